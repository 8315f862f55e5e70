// Epoch scheduler: restarts the trigger set on every epoch transition

use super::subscribers::SharedSubscribers;
use crate::chain::ChainReader;
use crate::config::SchedulerConfig;
use crate::models::{Epoch, Subscriber};
use crate::retry::{retry, FixedDelay};
use crate::schedule::delay_until;
use crate::store::UserDirectory;
use crate::telemetry;
use crate::triggers::catalog::builtin_triggers;
use crate::triggers::{EpochTrigger, TaskSet, Trigger, TriggerContext, ValidationResultPass};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Lifecycle state of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Restarting,
}

/// Owns the trigger set, the current epoch and the subscriber map
pub struct EpochScheduler {
    ctx: TriggerContext,
    directory: Arc<dyn UserDirectory>,
    config: SchedulerConfig,
    subscribers: SharedSubscribers,
    triggers: Mutex<Vec<EpochTrigger>>,
    current_epoch: RwLock<Option<Epoch>>,
    state_tx: watch::Sender<SchedulerState>,
    stop_token: CancellationToken,
}

impl EpochScheduler {
    /// Create a scheduler running the built-in triggers
    pub fn new(ctx: TriggerContext, directory: Arc<dyn UserDirectory>, config: SchedulerConfig) -> Self {
        let triggers = builtin_triggers(&ctx);
        Self::with_triggers(ctx, directory, config, triggers)
    }

    pub fn with_triggers(
        ctx: TriggerContext,
        directory: Arc<dyn UserDirectory>,
        config: SchedulerConfig,
        triggers: Vec<EpochTrigger>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self {
            ctx,
            directory,
            config,
            subscribers: SharedSubscribers::new(),
            triggers: Mutex::new(triggers),
            current_epoch: RwLock::new(None),
            state_tx,
            stop_token: CancellationToken::new(),
        }
    }

    pub fn subscribers(&self) -> &SharedSubscribers {
        &self.subscribers
    }

    pub async fn current_epoch(&self) -> Option<Epoch> {
        self.current_epoch.read().await.clone()
    }

    /// Observe state changes
    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state_tx.send_replace(state);
        debug!(?state, "Scheduler state changed");
    }

    /// Wait for the node, then load subscribers and their identities
    ///
    /// Both upstreams are retried indefinitely.
    #[instrument(skip(self))]
    pub async fn launch(&self) {
        let strategy = FixedDelay::new(self.config.launch_retry());

        // Unbounded strategy, so these only return on success
        if let Ok(epoch) = retry(&strategy, "current_epoch", || self.ctx.chain.current_epoch()).await {
            info!(epoch = epoch.number, "Chain node reachable");
        }
        if let Ok(list) = retry(&strategy, "list_subscribers", || self.directory.list()).await {
            self.subscribers.replace_all(list).await;
        }

        let refreshed = refresh_identities(self.ctx.chain.as_ref(), &self.subscribers).await;
        let total = self.subscribers.len().await;
        telemetry::set_subscribers_total(total);
        info!(subscribers = total, identities = refreshed, "Scheduler launched");
    }

    /// Run the restart cycle until `shutdown` or [`stop`](Self::stop)
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut background = TaskSet::new();
        self.spawn_identity_refresh(&mut background);

        let mut previous: Option<u64> = None;
        loop {
            self.set_state(SchedulerState::Restarting);
            self.stop_triggers().await;

            let Some(epoch) = self.fetch_epoch(&shutdown).await else {
                break;
            };
            info!(epoch = epoch.number, next_validation = %epoch.next_validation_time, "Epoch loaded");
            telemetry::set_current_epoch(epoch.number);
            *self.current_epoch.write().await = Some(epoch.clone());

            if let Some(ended) = previous.filter(|n| *n != epoch.number) {
                self.spawn_result_pass(&mut background, ended, &epoch);
            }
            previous = Some(epoch.number);

            self.start_triggers(&epoch).await;
            self.set_state(SchedulerState::Running);

            if !self.wait_for_next_epoch(&epoch, &shutdown).await {
                break;
            }
            sync_subscribers(self.directory.as_ref(), &self.subscribers).await;
            refresh_identities(self.ctx.chain.as_ref(), &self.subscribers).await;
        }

        self.stop_triggers().await;
        background.shutdown().await;
        self.set_state(SchedulerState::Idle);
        info!("Scheduler stopped");
    }

    /// Stop a running cycle and every trigger
    pub async fn stop(&self) {
        self.stop_token.cancel();
        self.stop_triggers().await;
    }

    /// Upsert a subscriber registered by the bot, attaching its identity if readable
    pub async fn on_new_user(&self, mut subscriber: Subscriber) {
        match self.ctx.chain.identity(&subscriber.coinbase_address).await {
            Ok(identity) => subscriber.identity = Some(identity),
            Err(e) => debug!(subscriber = %subscriber.id, error = %e, "Identity not available yet"),
        }
        info!(subscriber = %subscriber.id, "Subscriber added");
        self.subscribers.upsert(subscriber).await;
        telemetry::set_subscribers_total(self.subscribers.len().await);
    }

    pub async fn on_delete_user(&self, id: &str) {
        if self.subscribers.remove(id).await.is_some() {
            info!(subscriber = %id, "Subscriber removed");
        }
        telemetry::set_subscribers_total(self.subscribers.len().await);
    }

    async fn stop_triggers(&self) {
        for trigger in self.triggers.lock().await.iter_mut() {
            trigger.stop().await;
        }
    }

    async fn start_triggers(&self, epoch: &Epoch) {
        for trigger in self.triggers.lock().await.iter_mut() {
            if let Err(e) = trigger.start(epoch, &self.subscribers).await {
                warn!(trigger = %trigger.name(), epoch = epoch.number, error = %e, "Failed to start trigger");
            }
        }
    }

    async fn stopped(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.stop_token.cancelled() => {}
        }
    }

    /// `false` when stopped before the duration elapsed
    async fn sleep(&self, shutdown: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped(shutdown) => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn fetch_epoch(&self, shutdown: &CancellationToken) -> Option<Epoch> {
        let strategy = FixedDelay::new(self.config.launch_retry());
        tokio::select! {
            _ = self.stopped(shutdown) => None,
            result = retry(&strategy, "current_epoch", || self.ctx.chain.current_epoch()) => result.ok(),
        }
    }

    /// Sleep until the validation time, then poll until the epoch number changes
    async fn wait_for_next_epoch(&self, epoch: &Epoch, shutdown: &CancellationToken) -> bool {
        let delay = delay_until(epoch.next_validation_time, self.ctx.clock.now());
        if !self.sleep(shutdown, delay).await {
            return false;
        }

        loop {
            match self.ctx.chain.current_epoch().await {
                Ok(current) if current.number != epoch.number => {
                    info!(from = epoch.number, to = current.number, "Epoch changed");
                    return true;
                }
                Ok(_) => debug!(epoch = epoch.number, "Validation not finished yet"),
                Err(e) => warn!(error = %e, "Failed to recheck epoch"),
            }
            if !self.sleep(shutdown, self.config.epoch_recheck()).await {
                return false;
            }
        }
    }

    fn spawn_result_pass(&self, tasks: &mut TaskSet, ended: u64, epoch: &Epoch) {
        let pass = ValidationResultPass::new(self.ctx.clone());
        let subscribers = self.subscribers.clone();
        let epoch = epoch.clone();
        let token = tasks.token();
        tasks.spawn(async move {
            if let Err(e) = pass.run(ended, &epoch, &subscribers, &token).await {
                warn!(epoch = ended, error = %e, "Validation result pass failed");
            }
        });
    }

    fn spawn_identity_refresh(&self, tasks: &mut TaskSet) {
        let chain = self.ctx.chain.clone();
        let directory = self.directory.clone();
        let subscribers = self.subscribers.clone();
        let interval = self.config.identity_refresh();
        let token = tasks.token();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                sync_subscribers(directory.as_ref(), &subscribers).await;
                refresh_identities(chain.as_ref(), &subscribers).await;
            }
        });
    }
}

/// Pick up logins and deletions from the directory
///
/// A failed listing keeps the current set until the next tick.
pub async fn sync_subscribers(directory: &dyn UserDirectory, subscribers: &SharedSubscribers) {
    match directory.list().await {
        Ok(listed) => {
            let (added, removed) = subscribers.sync(listed).await;
            if added > 0 || removed > 0 {
                info!(added, removed, "Subscribers synced with directory");
            }
            telemetry::set_subscribers_total(subscribers.len().await);
        }
        Err(e) => warn!(error = %e, "Failed to list subscribers"),
    }
}

/// Re-read every subscriber's identity; failures are logged per subscriber
pub async fn refresh_identities(chain: &dyn ChainReader, subscribers: &SharedSubscribers) -> usize {
    let mut refreshed = 0;
    for subscriber in subscribers.snapshot().await {
        match chain.identity(&subscriber.coinbase_address).await {
            Ok(identity) => {
                if subscribers
                    .set_identity(&subscriber.id, &subscriber.coinbase_address, identity)
                    .await
                {
                    refreshed += 1;
                }
            }
            Err(e) => warn!(
                subscriber = %subscriber.id,
                address = %subscriber.coinbase_address,
                error = %e,
                "Failed to refresh identity"
            ),
        }
    }
    debug!(refreshed, "Identities refreshed");
    refreshed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{Identity, IdentityState};
    use crate::notifications::TemplateTable;
    use crate::store::MemoryUserDirectory;
    use crate::triggers::testing::{ts, Harness};

    fn epoch(number: u64, next_validation: &str) -> Epoch {
        Epoch {
            number,
            next_validation_time: ts(next_validation),
            start_block_height: 0,
        }
    }

    fn verified(address: &str) -> Identity {
        Identity {
            address: address.to_string(),
            state: IdentityState::Verified,
            ..Default::default()
        }
    }

    fn scheduler(h: &Harness, users: Vec<Subscriber>) -> Arc<EpochScheduler> {
        with_directory(h, Arc::new(MemoryUserDirectory::new(users)))
    }

    fn with_directory(h: &Harness, directory: Arc<MemoryUserDirectory>) -> Arc<EpochScheduler> {
        Arc::new(EpochScheduler::with_triggers(
            h.ctx.clone(),
            directory,
            Settings::default().scheduler,
            Vec::new(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_waits_for_node_and_loads_identities() {
        let h = Harness::new(TemplateTable::new(), ts("2024-01-10T11:00:00Z"));
        h.chain.set_epoch(epoch(42, "2024-01-10T12:00:00Z"));
        h.chain.fail_epoch_reads(3);
        h.chain.set_identity(verified("0xa"));

        let scheduler = scheduler(
            &h,
            vec![Subscriber::new("a", 1, "0xa"), Subscriber::new("b", 2, "0xb")],
        );
        scheduler.launch().await;

        let a = scheduler.subscribers().get("a").await.unwrap();
        assert_eq!(a.identity.unwrap().state, IdentityState::Verified);
        assert!(scheduler.subscribers().get("b").await.unwrap().identity.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_epoch_transition_runs_result_pass_for_ended_epoch() {
        let mut h = Harness::new(
            TemplateTable::new().with("validation-result", "verified", "Result: {identity-state}"),
            ts("2024-01-10T11:00:00Z"),
        );
        h.chain.set_epoch(epoch(42, "2024-01-10T12:00:00Z"));
        h.chain.set_identity(verified("0xa"));

        let scheduler = scheduler(&h, vec![Subscriber::new("a", 1, "0xa")]);
        scheduler.launch().await;

        let shutdown = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*scheduler.state().borrow(), SchedulerState::Running);
        assert_eq!(scheduler.current_epoch().await.unwrap().number, 42);

        // Validation time passed but the ceremony is still running
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(scheduler.current_epoch().await.unwrap().number, 42);
        assert!(h.drain().is_empty());

        h.chain.set_epoch(epoch(43, "2024-02-01T12:00:00Z"));
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(scheduler.current_epoch().await.unwrap().number, 43);

        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].trigger_id, "validation-result");
        assert_eq!(sent[0].epoch, 42);
        assert_eq!(sent[0].message, "Result: Verified");

        shutdown.cancel();
        runner.await.unwrap();
        assert_eq!(*scheduler.state().borrow(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_sends_no_results() {
        let mut h = Harness::new(
            TemplateTable::new().with("validation-result", "verified", "Result"),
            ts("2024-01-10T11:00:00Z"),
        );
        h.chain.set_epoch(epoch(42, "2024-01-10T12:00:00Z"));
        h.chain.set_identity(verified("0xa"));

        let scheduler = scheduler(&h, vec![Subscriber::new("a", 1, "0xa")]);
        scheduler.launch().await;

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.drain().is_empty());

        scheduler.stop().await;
        runner.await.unwrap();
        assert_eq!(*scheduler.state().borrow(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_user_add_and_delete() {
        let h = Harness::new(TemplateTable::new(), ts("2024-01-10T11:00:00Z"));
        h.chain.set_identity(verified("0xa"));
        let scheduler = scheduler(&h, Vec::new());

        scheduler.on_new_user(Subscriber::new("a", 1, "0xa")).await;
        scheduler.on_new_user(Subscriber::new("b", 2, "0xb")).await;
        assert_eq!(scheduler.subscribers().len().await, 2);
        assert!(scheduler.subscribers().get("a").await.unwrap().identity.is_some());

        scheduler.on_delete_user("a").await;
        scheduler.on_delete_user("missing").await;
        assert_eq!(scheduler.subscribers().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_changes_picked_up_while_running() {
        let h = Harness::new(TemplateTable::new(), ts("2024-01-10T11:00:00Z"));
        h.chain.set_epoch(epoch(42, "2024-01-10T12:00:00Z"));
        h.chain.set_identity(verified("0xa"));
        h.chain.set_identity(verified("0xb"));

        let directory = Arc::new(MemoryUserDirectory::new(vec![Subscriber::new("a", 1, "0xa")]));
        let scheduler = with_directory(&h, directory.clone());
        scheduler.launch().await;

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;

        // "a" deleted their account, "b" logged in
        directory.replace(vec![Subscriber::new("b", 2, "0xb")]).await;
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert!(scheduler.subscribers().get("a").await.is_none());
        let b = scheduler.subscribers().get("b").await.unwrap();
        assert_eq!(b.identity.unwrap().state, IdentityState::Verified);

        scheduler.stop().await;
        runner.await.unwrap();
    }
}
