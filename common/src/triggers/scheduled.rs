// Time-based triggers: fixed offsets and percent-of-epoch fire times

use super::guard::run_once;
use super::tasks::{sleep_or_cancel, TaskSet};
use super::{Trigger, TriggerContext};
use crate::errors::TriggerError;
use crate::models::{Block, Epoch, IdentityState, Readiness, Subscriber};
use crate::notifications::{escape_markdown, fill};
use crate::retry::{retry, ExponentialBackoff};
use crate::scheduler::SharedSubscribers;
use crate::schedule::{days_left, delay_until, FirePolicy};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which subscribers an entry is delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Anyone with a known identity
    IdentityHolders,
    Ready,
    NotReady,
}

impl Audience {
    pub fn includes(&self, subscriber: &Subscriber) -> bool {
        match (self, subscriber.identity.as_ref()) {
            (_, None) => false,
            (Audience::IdentityHolders, Some(_)) => true,
            (Audience::Ready, Some(identity)) => Readiness::of(identity) == Readiness::Ready,
            (Audience::NotReady, Some(identity)) => Readiness::of(identity) == Readiness::NotReady,
        }
    }
}

/// Message produced for each subscriber in the audience
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// `{days-left}` until validation
    DaysLeft,
    /// `{invites-count}`, only for identities holding invites
    InvitesCount,
    /// Only for identities that can still submit extra flips
    ExtraFlip,
    /// Status line per invitee, template segmented by invitee readiness
    InviteeReminder,
}

/// One independently idempotent fire time
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    /// Trigger id, also the idempotency key and default template id
    pub id: String,
    pub fire: FirePolicy,
    pub audience: Audience,
    pub body: Body,
}

impl ScheduleEntry {
    pub fn new(id: impl Into<String>, fire: FirePolicy, audience: Audience, body: Body) -> Self {
        Self {
            id: id.into(),
            fire,
            audience,
            body,
        }
    }
}

/// Group of time-based entries armed together for an epoch
pub struct ScheduledTrigger {
    name: String,
    entries: Vec<ScheduleEntry>,
    ctx: TriggerContext,
    tasks: TaskSet,
}

impl ScheduledTrigger {
    pub fn new(name: impl Into<String>, entries: Vec<ScheduleEntry>, ctx: TriggerContext) -> Self {
        Self {
            name: name.into(),
            entries,
            ctx,
            tasks: TaskSet::new(),
        }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }
}

#[async_trait]
impl Trigger for ScheduledTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &mut self,
        epoch: &Epoch,
        subscribers: &SharedSubscribers,
    ) -> Result<(), TriggerError> {
        self.stop().await;

        for entry in &self.entries {
            let job = FireJob {
                ctx: self.ctx.clone(),
                entry: Arc::new(entry.clone()),
                epoch: epoch.clone(),
                subscribers: subscribers.clone(),
                token: self.tasks.token(),
            };
            self.tasks.spawn(async move { job.arm().await });
        }

        Ok(())
    }

    async fn stop(&mut self) {
        self.tasks.shutdown().await;
        self.tasks = TaskSet::new();
    }
}

/// Everything a fired entry needs, owned by its task
struct FireJob {
    ctx: TriggerContext,
    entry: Arc<ScheduleEntry>,
    epoch: Epoch,
    subscribers: SharedSubscribers,
    token: CancellationToken,
}

impl FireJob {
    /// Resolve the fire time, sleep until it and fire
    async fn arm(&self) {
        let head = if self.entry.fire.needs_chain_head() {
            match self.chain_head().await {
                Some(block) => Some(block),
                None => return,
            }
        } else {
            None
        };

        let Some(fire_at) = self.entry.fire.fire_time(&self.epoch, head.as_ref(), &self.ctx.policy) else {
            return;
        };
        info!(
            trigger_id = %self.entry.id,
            epoch = self.epoch.number,
            fire_at = %fire_at,
            "Trigger armed"
        );

        let delay = delay_until(fire_at, self.ctx.clock.now());
        if sleep_or_cancel(&self.token, delay).await {
            self.fire().await;
        }
    }

    /// Read the chain head until it succeeds; `None` when cancelled first
    async fn chain_head(&self) -> Option<Block> {
        let strategy = ExponentialBackoff::new();
        tokio::select! {
            _ = self.token.cancelled() => None,
            result = retry(&strategy, "last_block", || self.ctx.chain.last_block()) => match result {
                Ok(block) => Some(block),
                Err(e) => {
                    warn!(trigger_id = %self.entry.id, error = %e, "Cannot read chain head");
                    None
                }
            },
        }
    }

    async fn fire(&self) {
        let result = run_once(
            self.ctx.store.as_ref(),
            &self.entry.id,
            self.epoch.number,
            &self.token,
            || self.deliver_all(),
        )
        .await;

        if let Err(e) = result {
            warn!(trigger_id = %self.entry.id, epoch = self.epoch.number, error = %e, "Trigger failed");
        }
    }

    async fn deliver_all(&self) {
        for subscriber in self.subscribers.snapshot().await {
            if self.token.is_cancelled() {
                break;
            }
            if !self.entry.audience.includes(&subscriber) {
                continue;
            }
            if let Err(e) = self.deliver(&subscriber).await {
                warn!(
                    trigger_id = %self.entry.id,
                    subscriber = %subscriber.coinbase_address,
                    error = %e,
                    "Failed to notify subscriber"
                );
            }
        }
    }

    async fn deliver(&self, subscriber: &Subscriber) -> Result<(), TriggerError> {
        let Some(identity) = subscriber.identity.as_ref() else {
            return Ok(());
        };
        let id = self.entry.id.as_str();
        let epoch = self.epoch.number;

        match self.entry.body {
            Body::DaysLeft => {
                let days = days_left(self.epoch.next_validation_time, self.ctx.clock.now()).to_string();
                self.ctx
                    .notify(id, epoch, subscriber, id, |t| fill(t, &[("days-left", days.as_str())]), None)
                    .await?;
            }
            Body::InvitesCount => {
                if identity.invites == 0 {
                    return Ok(());
                }
                let count = match identity.invites {
                    1 => "1 invitation".to_string(),
                    n => format!("{} invitations", n),
                };
                self.ctx
                    .notify(id, epoch, subscriber, id, |t| fill(t, &[("invites-count", count.as_str())]), None)
                    .await?;
            }
            Body::ExtraFlip => {
                let can_add_flips = identity.is_ready_for_validation()
                    && identity.available_flips > identity.made_flips;
                if can_add_flips {
                    self.ctx
                        .notify(id, epoch, subscriber, id, str::to_string, None)
                        .await?;
                }
            }
            Body::InviteeReminder => {
                if identity.invitees.is_empty() {
                    return Ok(());
                }

                let mut lines = Vec::with_capacity(identity.invitees.len());
                let mut all_ready = true;
                for invitee in &identity.invitees {
                    let status = self.ctx.chain.identity(&invitee.address).await?;
                    let activated = status.state != IdentityState::Invite;
                    let flips_ready = status.is_ready_for_validation();
                    all_ready &= activated && flips_ready;
                    lines.push(invitee_status_line(&invitee.address, activated, flips_ready));
                }

                let segment = if all_ready { "invitee-ready" } else { "invitee-not-ready" };
                let template_id = format!("{}.{}", id, segment);
                self.ctx
                    .notify(
                        id,
                        epoch,
                        subscriber,
                        &template_id,
                        |t| format!("{}\n{}", t, lines.join("\n")),
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn invitee_status_line(address: &str, activated: bool, flips_ready: bool) -> String {
    let status = if !activated {
        "invite not activated"
    } else if flips_ready {
        "ready for validation"
    } else {
        "flips not submitted"
    };
    format!("{} \\- {}", escape_markdown(address), status)
}
