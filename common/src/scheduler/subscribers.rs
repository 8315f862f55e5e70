// Subscriber map shared between the scheduler and its triggers

use crate::models::{Identity, Subscriber};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Subscribers keyed by id
///
/// Writers are the scheduler (user add/remove, identity refresh); triggers
/// take a snapshot when they fire.
#[derive(Debug, Clone, Default)]
pub struct SharedSubscribers {
    inner: Arc<RwLock<BTreeMap<String, Subscriber>>>,
}

impl SharedSubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list(subscribers: Vec<Subscriber>) -> Self {
        let map = subscribers
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect::<BTreeMap<_, _>>();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Insert or replace by id
    ///
    /// A known identity is kept when the incoming record carries none and the
    /// coinbase address did not change.
    pub async fn upsert(&self, mut subscriber: Subscriber) {
        let mut map = self.inner.write().await;
        if subscriber.identity.is_none() {
            if let Some(existing) = map.get(&subscriber.id) {
                if existing.coinbase_address == subscriber.coinbase_address {
                    subscriber.identity = existing.identity.clone();
                }
            }
        }
        map.insert(subscriber.id.clone(), subscriber);
    }

    pub async fn remove(&self, id: &str) -> Option<Subscriber> {
        self.inner.write().await.remove(id)
    }

    /// Replace the whole set, as on initial load
    pub async fn replace_all(&self, subscribers: Vec<Subscriber>) {
        let mut map = self.inner.write().await;
        map.clear();
        for subscriber in subscribers {
            map.insert(subscriber.id.clone(), subscriber);
        }
    }

    /// Align the map with a directory listing
    ///
    /// Unknown ids are added, ids missing from `listed` are dropped and known
    /// ones keep their identity. Returns `(added, removed)`.
    pub async fn sync(&self, listed: Vec<Subscriber>) -> (usize, usize) {
        let mut map = self.inner.write().await;
        let keep: BTreeMap<String, Subscriber> =
            listed.into_iter().map(|s| (s.id.clone(), s)).collect();

        let before = map.len();
        map.retain(|id, _| keep.contains_key(id));
        let removed = before - map.len();

        let mut added = 0;
        for (id, mut subscriber) in keep {
            match map.get(&id) {
                Some(existing) => {
                    if subscriber.identity.is_none()
                        && existing.coinbase_address == subscriber.coinbase_address
                    {
                        subscriber.identity = existing.identity.clone();
                    }
                }
                None => added += 1,
            }
            map.insert(id, subscriber);
        }
        (added, removed)
    }

    /// Attach a refreshed identity; a no-op when the subscriber is gone
    /// or changed its address meanwhile
    pub async fn set_identity(&self, id: &str, address: &str, identity: Identity) -> bool {
        let mut map = self.inner.write().await;
        match map.get_mut(id) {
            Some(subscriber) if subscriber.coinbase_address == address => {
                subscriber.identity = Some(identity);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Subscriber> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Subscriber> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdentityState;

    fn identity(state: IdentityState) -> Identity {
        Identity {
            state,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let subscribers = SharedSubscribers::new();
        subscribers.upsert(Subscriber::new("u1", 1, "0xa")).await;
        subscribers.upsert(Subscriber::new("u1", 2, "0xa")).await;
        subscribers.upsert(Subscriber::new("u2", 3, "0xb")).await;

        assert_eq!(subscribers.len().await, 2);
        assert_eq!(subscribers.get("u1").await.unwrap().chat_id, 2);
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity_for_same_address() {
        let subscribers = SharedSubscribers::from_list(vec![
            Subscriber::new("u1", 1, "0xa").with_identity(identity(IdentityState::Human))
        ]);

        subscribers.upsert(Subscriber::new("u1", 5, "0xa")).await;
        assert!(subscribers.get("u1").await.unwrap().identity.is_some());

        subscribers.upsert(Subscriber::new("u1", 5, "0xnew")).await;
        assert!(subscribers.get("u1").await.unwrap().identity.is_none());
    }

    #[tokio::test]
    async fn test_set_identity_checks_address() {
        let subscribers = SharedSubscribers::from_list(vec![Subscriber::new("u1", 1, "0xa")]);
        assert!(!subscribers.set_identity("u1", "0xother", identity(IdentityState::Newbie)).await);
        assert!(subscribers.set_identity("u1", "0xa", identity(IdentityState::Newbie)).await);
        assert!(!subscribers.set_identity("u9", "0xa", identity(IdentityState::Newbie)).await);
    }

    #[tokio::test]
    async fn test_remove() {
        let subscribers = SharedSubscribers::from_list(vec![Subscriber::new("u1", 1, "0xa")]);
        assert!(subscribers.remove("u1").await.is_some());
        assert!(subscribers.remove("u1").await.is_none());
        assert!(subscribers.is_empty().await);
    }

    #[tokio::test]
    async fn test_sync_adds_and_drops() {
        let subscribers = SharedSubscribers::from_list(vec![
            Subscriber::new("u1", 1, "0xa").with_identity(identity(IdentityState::Verified)),
            Subscriber::new("u2", 2, "0xb"),
        ]);

        let (added, removed) = subscribers
            .sync(vec![Subscriber::new("u1", 1, "0xa"), Subscriber::new("u3", 3, "0xc")])
            .await;

        assert_eq!((added, removed), (1, 1));
        assert!(subscribers.get("u2").await.is_none());
        assert!(subscribers.get("u3").await.is_some());
        assert!(subscribers.get("u1").await.unwrap().identity.is_some());
    }
}
