// In-memory store implementations

use super::{IdempotencyStore, OracleWatchStore, UserDirectory};
use crate::errors::StorageError;
use crate::models::{OracleVotingWatch, Subscriber, TriggerRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Trigger markers held in a map
///
/// `persist` is atomic because the map is only touched under one lock.
#[derive(Debug, Default)]
pub struct MemoryTriggerStore {
    records: Mutex<HashMap<(String, u64), Option<serde_json::Value>>>,
    persist_calls: AtomicUsize,
    payload_writes: AtomicUsize,
}

impl MemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `persist` calls, successful or not
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Number of `store_payload` calls
    pub fn payload_writes(&self) -> usize {
        self.payload_writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryTriggerStore {
    async fn is_done(&self, trigger_id: &str, epoch: u64) -> Result<bool, StorageError> {
        Ok(self
            .records
            .lock()
            .await
            .contains_key(&(trigger_id.to_string(), epoch)))
    }

    async fn persist(
        &self,
        trigger_id: &str,
        epoch: u64,
        payload: Option<serde_json::Value>,
    ) -> Result<bool, StorageError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().await;
        let key = (trigger_id.to_string(), epoch);
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, payload);
        Ok(true)
    }

    async fn get(&self, trigger_id: &str, epoch: u64) -> Result<Option<TriggerRecord>, StorageError> {
        Ok(self
            .records
            .lock()
            .await
            .get(&(trigger_id.to_string(), epoch))
            .map(|payload| TriggerRecord {
                trigger_id: trigger_id.to_string(),
                epoch,
                payload: payload.clone(),
            }))
    }

    async fn store_payload(
        &self,
        trigger_id: &str,
        epoch: u64,
        payload: serde_json::Value,
    ) -> Result<(), StorageError> {
        self.payload_writes.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .await
            .insert((trigger_id.to_string(), epoch), Some(payload));
        Ok(())
    }
}

/// Oracle watches keyed by contract
#[derive(Debug, Default)]
pub struct MemoryOracleWatchStore {
    watches: Mutex<BTreeMap<String, u64>>,
}

impl MemoryOracleWatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<OracleVotingWatch> {
        self.watches
            .lock()
            .await
            .iter()
            .map(|(contract, due)| OracleVotingWatch {
                contract_address: contract.clone(),
                due_block_height: *due,
            })
            .collect()
    }
}

#[async_trait]
impl OracleWatchStore for MemoryOracleWatchStore {
    async fn upsert(&self, watch: &OracleVotingWatch) -> Result<(), StorageError> {
        self.watches
            .lock()
            .await
            .insert(watch.contract_address.clone(), watch.due_block_height);
        Ok(())
    }

    async fn due_at(&self, height: u64) -> Result<Vec<OracleVotingWatch>, StorageError> {
        Ok(self
            .all()
            .await
            .into_iter()
            .filter(|w| w.due_block_height == height)
            .collect())
    }

    async fn prune_before(&self, height: u64) -> Result<u64, StorageError> {
        let mut watches = self.watches.lock().await;
        let before = watches.len();
        watches.retain(|_, due| *due >= height);
        Ok((before - watches.len()) as u64)
    }
}

/// Fixed subscriber list
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryUserDirectory {
    pub fn new(subscribers: Vec<Subscriber>) -> Self {
        Self {
            subscribers: Mutex::new(subscribers),
        }
    }

    /// Swap the listing, as logins and deletions would
    pub async fn replace(&self, subscribers: Vec<Subscriber>) {
        *self.subscribers.lock().await = subscribers;
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn list(&self) -> Result<Vec<Subscriber>, StorageError> {
        Ok(self.subscribers.lock().await.clone())
    }
}
