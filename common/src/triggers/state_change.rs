// Identity state transition trigger

use super::guard::run_once;
use super::tasks::{sleep_or_cancel, TaskSet};
use super::{Trigger, TriggerContext};
use crate::errors::TriggerError;
use crate::models::{Epoch, IdentityState, Subscriber};
use crate::scheduler::SharedSubscribers;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const TEMPLATE_ID: &str = "accept-invite";

/// Notifies subscribers whose identity just became an invite
///
/// Polls the subscriber snapshot; the trigger id carries the address so each
/// subscriber is notified at most once per epoch.
pub struct StateChangeTrigger {
    ctx: TriggerContext,
    tasks: TaskSet,
}

impl StateChangeTrigger {
    pub fn new(ctx: TriggerContext) -> Self {
        Self {
            ctx,
            tasks: TaskSet::new(),
        }
    }

    pub fn trigger_id(address: &str) -> String {
        format!("{}-{}", TEMPLATE_ID, address)
    }
}

#[async_trait]
impl Trigger for StateChangeTrigger {
    fn name(&self) -> &str {
        TEMPLATE_ID
    }

    async fn start(
        &mut self,
        epoch: &Epoch,
        subscribers: &SharedSubscribers,
    ) -> Result<(), TriggerError> {
        self.stop().await;

        let token = self.tasks.token();
        let mut watcher = StateWatcher {
            ctx: self.ctx.clone(),
            epoch: epoch.number,
            previous: HashMap::new(),
            token: token.clone(),
        };
        let subscribers = subscribers.clone();
        let interval = self.ctx.state_poll;

        self.tasks.spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                watcher.poll(&subscribers.snapshot().await).await;
                if !sleep_or_cancel(&token, interval).await {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn stop(&mut self) {
        self.tasks.shutdown().await;
        self.tasks = TaskSet::new();
    }
}

/// Last observed state per coinbase address
pub(crate) struct StateWatcher {
    ctx: TriggerContext,
    epoch: u64,
    previous: HashMap<String, Option<IdentityState>>,
    token: CancellationToken,
}

impl StateWatcher {
    pub(crate) async fn poll(&mut self, subscribers: &[Subscriber]) {
        for subscriber in subscribers {
            let current = subscriber.identity.as_ref().map(|i| i.state);
            let previous = self
                .previous
                .insert(subscriber.coinbase_address.clone(), current)
                .flatten();

            if current == Some(IdentityState::Invite) && previous != Some(IdentityState::Invite) {
                if let Err(e) = self.notify(subscriber).await {
                    warn!(
                        subscriber = %subscriber.coinbase_address,
                        error = %e,
                        "Failed to process invite acceptance"
                    );
                }
            }
        }
    }

    async fn notify(&self, subscriber: &Subscriber) -> Result<(), TriggerError> {
        let trigger_id = StateChangeTrigger::trigger_id(&subscriber.coinbase_address);
        let ctx = &self.ctx;
        let epoch = self.epoch;

        let outcome = run_once(ctx.store.as_ref(), &trigger_id, epoch, &self.token, || async {
            if let Err(e) = ctx
                .notify(&trigger_id, epoch, subscriber, TEMPLATE_ID, str::to_string, None)
                .await
            {
                warn!(trigger_id = %trigger_id, error = %e, "Failed to emit notification");
            }
        })
        .await?;

        debug!(trigger_id = %trigger_id, ?outcome, "Invite state change handled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Identity;
    use crate::notifications::TemplateTable;
    use crate::triggers::testing::{ts, Harness};
    use std::time::Duration;

    fn with_state(id: &str, state: IdentityState) -> Subscriber {
        Subscriber::new(id, 1, format!("0x{}", id)).with_identity(Identity {
            state,
            ..Default::default()
        })
    }

    fn harness() -> Harness {
        Harness::new(
            TemplateTable::new().with(TEMPLATE_ID, "invite", "Accept your invite"),
            ts("2024-01-05T00:00:00Z"),
        )
    }

    #[tokio::test]
    async fn test_transition_into_invite_notifies_once() {
        let mut h = harness();
        let mut watcher = StateWatcher {
            ctx: h.ctx.clone(),
            epoch: 42,
            previous: HashMap::new(),
            token: CancellationToken::new(),
        };

        watcher.poll(&[with_state("a", IdentityState::Undefined)]).await;
        assert!(h.drain().is_empty());

        watcher.poll(&[with_state("a", IdentityState::Invite)]).await;
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].trigger_id, "accept-invite-0xa");

        // Staying in Invite is not a transition
        watcher.poll(&[with_state("a", IdentityState::Invite)]).await;
        // Leaving and coming back is, but the epoch marker suppresses it
        watcher.poll(&[with_state("a", IdentityState::Candidate)]).await;
        watcher.poll(&[with_state("a", IdentityState::Invite)]).await;
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval_until_stopped() {
        let mut h = harness();
        let subscribers = SharedSubscribers::from_list(vec![with_state("a", IdentityState::Undefined)]);

        let epoch = Epoch {
            number: 42,
            next_validation_time: ts("2024-01-10T12:00:00Z"),
            start_block_height: 0,
        };
        let mut trigger = StateChangeTrigger::new(h.ctx.clone());
        trigger.start(&epoch, &subscribers).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        subscribers.upsert(with_state("a", IdentityState::Invite)).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.drain().len(), 1);

        trigger.stop().await;
        subscribers.upsert(with_state("b", IdentityState::Invite)).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.drain().is_empty());
    }
}
