// Epoch-scoped triggers
//
// Every trigger owns its timers through a `TaskSet`. `start` arms the work
// for one epoch, `stop` cancels it and returns only once no task is left.

pub mod catalog;
pub mod guard;
pub mod oracle_voting;
pub mod scheduled;
pub mod state_change;
pub mod tasks;
pub mod validation_result;

use crate::chain::ChainReader;
use crate::config::{EpochPolicy, LinksConfig, OracleConfig};
use crate::errors::TriggerError;
use crate::models::{Action, Epoch, Notification, Subscriber};
use crate::notifications::TemplateTable;
use crate::router::NotificationEmitter;
use crate::scheduler::SharedSubscribers;
use crate::schedule::Clock;
use crate::store::{IdempotencyStore, OracleWatchStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use guard::{run_once, GuardOutcome};
pub use oracle_voting::{OracleVotingPoller, StepOutcome};
pub use scheduled::{Audience, Body, ScheduleEntry, ScheduledTrigger};
pub use state_change::StateChangeTrigger;
pub use tasks::TaskSet;
pub use validation_result::ValidationResultPass;

/// Collaborators shared by all triggers
#[derive(Clone)]
pub struct TriggerContext {
    pub chain: Arc<dyn ChainReader>,
    pub store: Arc<dyn IdempotencyStore>,
    pub watches: Arc<dyn OracleWatchStore>,
    pub templates: Arc<TemplateTable>,
    pub emitter: NotificationEmitter,
    pub clock: Arc<dyn Clock>,
    pub policy: EpochPolicy,
    pub links: LinksConfig,
    pub oracle: OracleConfig,
    pub state_poll: Duration,
}

impl TriggerContext {
    /// Render `template_id` for the subscriber's identity and emit it
    ///
    /// Returns `false` when the subscriber has no identity or the template
    /// has no text for its state.
    pub(crate) async fn notify(
        &self,
        trigger_id: &str,
        epoch: u64,
        subscriber: &Subscriber,
        template_id: &str,
        render: impl FnOnce(&str) -> String + Send,
        action: Option<Action>,
    ) -> Result<bool, TriggerError> {
        let Some(identity) = subscriber.identity.as_ref() else {
            return Ok(false);
        };
        let Some(template) = self.templates.lookup(template_id, identity) else {
            return Ok(false);
        };

        self.emitter
            .emit(Notification {
                trigger_id: trigger_id.to_string(),
                epoch,
                subscriber_id: subscriber.id.clone(),
                chat_id: subscriber.chat_id,
                message: render(template),
                action,
            })
            .await?;
        Ok(true)
    }
}

/// A unit of idempotent, epoch-scoped work
#[async_trait]
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    /// Arm the trigger for `epoch`, replacing anything armed before
    async fn start(
        &mut self,
        epoch: &Epoch,
        subscribers: &SharedSubscribers,
    ) -> Result<(), TriggerError>;

    /// Cancel pending work; no emission happens after this returns
    async fn stop(&mut self);
}

/// Closed set of trigger variants run by the scheduler
pub enum EpochTrigger {
    Scheduled(ScheduledTrigger),
    StateChange(StateChangeTrigger),
    OracleVoting(OracleVotingPoller),
}

#[async_trait]
impl Trigger for EpochTrigger {
    fn name(&self) -> &str {
        match self {
            EpochTrigger::Scheduled(t) => t.name(),
            EpochTrigger::StateChange(t) => t.name(),
            EpochTrigger::OracleVoting(t) => t.name(),
        }
    }

    async fn start(
        &mut self,
        epoch: &Epoch,
        subscribers: &SharedSubscribers,
    ) -> Result<(), TriggerError> {
        match self {
            EpochTrigger::Scheduled(t) => t.start(epoch, subscribers).await,
            EpochTrigger::StateChange(t) => t.start(epoch, subscribers).await,
            EpochTrigger::OracleVoting(t) => t.start(epoch, subscribers).await,
        }
    }

    async fn stop(&mut self) {
        match self {
            EpochTrigger::Scheduled(t) => t.stop().await,
            EpochTrigger::StateChange(t) => t.stop().await,
            EpochTrigger::OracleVoting(t) => t.stop().await,
        }
    }
}
