// Post-validation result notifications

use super::guard::{run_once, GuardOutcome};
use super::TriggerContext;
use crate::errors::TriggerError;
use crate::models::{Epoch, Subscriber};
use crate::notifications::{calendar_link, fill};
use crate::scheduler::SharedSubscribers;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TEMPLATE_ID: &str = "validation-result";

/// One-shot pass run when the scheduler observes an epoch transition
///
/// Keyed on the epoch that just ended, so a restart right after the
/// transition does not repeat it.
pub struct ValidationResultPass {
    ctx: TriggerContext,
}

impl ValidationResultPass {
    pub fn new(ctx: TriggerContext) -> Self {
        Self { ctx }
    }

    pub async fn run(
        &self,
        ended_epoch: u64,
        new_epoch: &Epoch,
        subscribers: &SharedSubscribers,
        token: &CancellationToken,
    ) -> Result<GuardOutcome, TriggerError> {
        run_once(self.ctx.store.as_ref(), TEMPLATE_ID, ended_epoch, token, || async {
            let mut sent = 0usize;
            for subscriber in subscribers.snapshot().await {
                match self.deliver(&subscriber, ended_epoch, new_epoch, subscribers).await {
                    Ok(true) => sent += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        subscriber = %subscriber.coinbase_address,
                        error = %e,
                        "Failed to send validation result"
                    ),
                }
            }
            info!(epoch = ended_epoch, sent, "Validation results sent");
        })
        .await
    }

    async fn deliver(
        &self,
        subscriber: &Subscriber,
        ended_epoch: u64,
        new_epoch: &Epoch,
        subscribers: &SharedSubscribers,
    ) -> Result<bool, TriggerError> {
        if subscriber.identity.is_none() {
            return Ok(false);
        }

        // The ceremony outcome is only visible on a fresh read
        let identity = self.ctx.chain.identity(&subscriber.coinbase_address).await?;
        subscribers
            .set_identity(&subscriber.id, &subscriber.coinbase_address, identity.clone())
            .await;
        let subscriber = subscriber.clone().with_identity(identity);

        let state = subscriber
            .identity
            .as_ref()
            .map(|i| i.state.to_string())
            .unwrap_or_default();
        let report_link = format!(
            "{}/identity/{}/epoch/{}/validation",
            self.ctx.links.explorer_url.trim_end_matches('/'),
            subscriber.coinbase_address,
            ended_epoch
        );
        let calendar = calendar_link(new_epoch.next_validation_time);

        self.ctx
            .notify(
                TEMPLATE_ID,
                ended_epoch,
                &subscriber,
                TEMPLATE_ID,
                |t| {
                    fill(
                        t,
                        &[
                            ("identity-state", state.as_str()),
                            ("report-link", report_link.as_str()),
                            ("calendar-link", calendar.as_str()),
                        ],
                    )
                },
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, IdentityState};
    use crate::notifications::TemplateTable;
    use crate::store::IdempotencyStore;
    use crate::triggers::testing::{ts, FlakyStore, Harness};
    use std::sync::Arc;

    fn new_epoch() -> Epoch {
        Epoch {
            number: 43,
            next_validation_time: ts("2024-01-31T13:30:00Z"),
            start_block_height: 1000,
        }
    }

    #[tokio::test]
    async fn test_results_use_fresh_identity_and_ended_epoch() {
        let mut h = Harness::new(
            TemplateTable::new()
                .with(TEMPLATE_ID, "verified", "You are {identity-state}: {report-link}")
                .with(TEMPLATE_ID, "candidate", "Failed: {report-link}"),
            ts("2024-01-10T14:00:00Z"),
        );
        h.chain.set_identity(Identity {
            address: "0xa".to_string(),
            state: IdentityState::Verified,
            ..Default::default()
        });
        let before = Identity {
            address: "0xa".to_string(),
            state: IdentityState::Candidate,
            ..Default::default()
        };
        let subscribers = SharedSubscribers::from_list(vec![
            Subscriber::new("a", 1, "0xa").with_identity(before),
            Subscriber::new("b", 2, "0xb"),
        ]);

        let pass = ValidationResultPass::new(h.ctx.clone());
        let token = CancellationToken::new();
        let outcome = pass.run(42, &new_epoch(), &subscribers, &token).await.unwrap();
        assert_eq!(outcome, GuardOutcome::Fired);

        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].epoch, 42);
        assert_eq!(
            sent[0].message,
            "You are Verified: https://scan.idena.io/identity/0xa/epoch/42/validation"
        );
        let refreshed = subscribers.get("a").await.unwrap();
        assert_eq!(refreshed.identity.unwrap().state, IdentityState::Verified);

        let again = pass.run(42, &new_epoch(), &subscribers, &token).await.unwrap();
        assert_eq!(again, GuardOutcome::AlreadyDone);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_identity_is_skipped() {
        let mut h = Harness::new(
            TemplateTable::new().with(TEMPLATE_ID, "default", "{calendar-link}"),
            ts("2024-01-10T14:00:00Z"),
        );
        h.chain.set_identity(Identity {
            address: "0xb".to_string(),
            ..Default::default()
        });
        let subscribers = SharedSubscribers::from_list(vec![
            Subscriber::new("a", 1, "0xa").with_identity(Identity::default()),
            Subscriber::new("b", 2, "0xb").with_identity(Identity::default()),
        ]);

        ValidationResultPass::new(h.ctx.clone())
            .run(42, &new_epoch(), &subscribers, &CancellationToken::new())
            .await
            .unwrap();

        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subscriber_id, "b");
        assert!(sent[0].message.contains("dates=20240131T133000Z%2F20240131T140000Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_delays_but_keeps_results() {
        let mut h = Harness::new(
            TemplateTable::new().with(TEMPLATE_ID, "verified", "{identity-state}"),
            ts("2024-01-10T14:00:00Z"),
        );
        let store = Arc::new(FlakyStore::new(3));
        h.ctx.store = store.clone();
        h.chain.set_identity(Identity {
            address: "0xa".to_string(),
            state: IdentityState::Verified,
            ..Default::default()
        });
        let subscribers = SharedSubscribers::from_list(vec![
            Subscriber::new("a", 1, "0xa").with_identity(Identity::default()),
        ]);

        let outcome = ValidationResultPass::new(h.ctx.clone())
            .run(42, &new_epoch(), &subscribers, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, GuardOutcome::Fired);
        assert_eq!(h.drain().len(), 1);
        assert!(store.inner().get(TEMPLATE_ID, 42).await.unwrap().is_some());
    }
}
