// Chain cursor poller for oracle voting contracts
//
// Blocks are scanned strictly in height order. The cursor is persisted only
// after a height has been fully processed, so a crash reprocesses that
// height from scratch and notifications for it may be emitted twice.

use super::tasks::{sleep_or_cancel, TaskSet};
use super::{Trigger, TriggerContext};
use crate::chain::{decode_call_attachment, value_as_u64, ArgFormat, ContractArg};
use crate::errors::{ChainError, StorageError, TriggerError};
use crate::models::{Action, Block, ChainCursor, Epoch, OracleVotingWatch, Subscriber, TxKind};
use crate::notifications::{escape_markdown, fill};
use crate::scheduler::SharedSubscribers;
use crate::telemetry;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Trigger id under which the cursor is stored
pub const ORACLE_WATCHER_ID: &str = "oracle-watcher";

/// The cursor is not tied to an epoch
const CURSOR_EPOCH: u64 = 0;

const NEW_VOTING_TEMPLATE: &str = "oracle-voting-new";
const REVEAL_TEMPLATE: &str = "oracle-public-voting";

/// Contract method that opens a voting
const START_VOTING: &str = "startVoting";
/// Contract method that extends a voting that did not reach quorum
const PROLONG_VOTING: &str = "prolongVoting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VotingEvent {
    Start,
    Prolong,
}

impl VotingEvent {
    fn as_str(&self) -> &'static str {
        match self {
            VotingEvent::Start => "start",
            VotingEvent::Prolong => "prolong",
        }
    }
}

/// Result of one poll iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Block at this height processed and cursor advanced to it
    Advanced(u64),
    /// Next height not produced yet
    Idle,
}

/// Long-running cursor poller
pub struct OracleVotingPoller {
    ctx: TriggerContext,
    tasks: TaskSet,
}

impl OracleVotingPoller {
    pub fn new(ctx: TriggerContext) -> Self {
        Self {
            ctx,
            tasks: TaskSet::new(),
        }
    }
}

#[async_trait]
impl Trigger for OracleVotingPoller {
    fn name(&self) -> &str {
        ORACLE_WATCHER_ID
    }

    async fn start(
        &mut self,
        epoch: &Epoch,
        subscribers: &SharedSubscribers,
    ) -> Result<(), TriggerError> {
        self.stop().await;

        let scanner = BlockScanner::new(self.ctx.clone(), subscribers.clone(), epoch.number);
        let token = self.tasks.token();
        let idle = Duration::from_millis(self.ctx.oracle.idle_delay_ms);
        let on_error = Duration::from_millis(self.ctx.oracle.error_delay_ms);
        let step = Duration::from_millis(self.ctx.oracle.step_delay_ms);

        self.tasks.spawn(async move {
            info!("Oracle voting poller started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                let delay = match scanner.step().await {
                    Ok(StepOutcome::Advanced(_)) => step,
                    Ok(StepOutcome::Idle) => idle,
                    Err(e) => {
                        warn!(error = %e, "Oracle voting poll failed, retrying");
                        on_error
                    }
                };
                if !sleep_or_cancel(&token, delay).await {
                    break;
                }
            }
            info!("Oracle voting poller stopped");
        });
        Ok(())
    }

    async fn stop(&mut self) {
        self.tasks.shutdown().await;
        self.tasks = TaskSet::new();
    }
}

/// One step of the poll loop and the per-block processing behind it
pub struct BlockScanner {
    ctx: TriggerContext,
    subscribers: SharedSubscribers,
    /// Epoch stamped on emitted notifications
    epoch: u64,
}

impl BlockScanner {
    pub fn new(ctx: TriggerContext, subscribers: SharedSubscribers, epoch: u64) -> Self {
        Self {
            ctx,
            subscribers,
            epoch,
        }
    }

    /// Load the persisted cursor, creating it at the initial height if absent
    pub async fn load_cursor(&self) -> Result<ChainCursor, StorageError> {
        match self.ctx.store.get(ORACLE_WATCHER_ID, CURSOR_EPOCH).await? {
            Some(record) => match record.payload {
                Some(payload) => Ok(serde_json::from_value(payload)?),
                None => Err(StorageError::InvalidPayload(
                    "cursor record has no payload".to_string(),
                )),
            },
            None => {
                let cursor = ChainCursor::new(self.ctx.oracle.initial_cursor);
                self.save_cursor(cursor).await?;
                info!(block = cursor.block, "Cursor initialized");
                Ok(cursor)
            }
        }
    }

    async fn save_cursor(&self, cursor: ChainCursor) -> Result<(), StorageError> {
        self.ctx
            .store
            .store_payload(ORACLE_WATCHER_ID, CURSOR_EPOCH, serde_json::to_value(cursor)?)
            .await
    }

    /// Process the next height, advancing the cursor only on success
    pub async fn step(&self) -> Result<StepOutcome, TriggerError> {
        let cursor = self.load_cursor().await?;
        let height = cursor.next_height();

        let Some(block) = self.ctx.chain.block_at(height).await? else {
            return Ok(StepOutcome::Idle);
        };

        let subscribers = self.subscribers.snapshot().await;

        if !block.transactions.is_empty() {
            self.process_block(&block, &subscribers).await?;
        }
        self.process_delayed(&block, &subscribers).await;

        let next = cursor.advance();
        self.save_cursor(next).await?;
        telemetry::set_cursor_height(next.block);

        if let Err(e) = self.ctx.watches.prune_before(block.height).await {
            debug!(error = %e, "Failed to prune processed oracle watches");
        }

        Ok(StepOutcome::Advanced(next.block))
    }

    #[instrument(skip(self, block, subscribers), fields(height = block.height))]
    async fn process_block(
        &self,
        block: &Block,
        subscribers: &[Subscriber],
    ) -> Result<(), TriggerError> {
        for hash in &block.transactions {
            if let Err(e) = self.process_transaction(hash, subscribers).await {
                match e {
                    // Emitter closed means shutdown; the height must be retried
                    TriggerError::Queue(_) => return Err(e),
                    other => warn!(tx = %hash, error = %other, "Failed to process transaction"),
                }
            }
        }
        Ok(())
    }

    async fn process_transaction(
        &self,
        hash: &str,
        subscribers: &[Subscriber],
    ) -> Result<(), TriggerError> {
        let tx = self.ctx.chain.transaction(hash).await?;
        if tx.kind != TxKind::CallContract {
            return Ok(());
        }

        let decode_error = |reason: String| ChainError::Decode {
            hash: hash.to_string(),
            reason,
        };
        let payload = tx
            .payload
            .as_deref()
            .ok_or_else(|| decode_error("missing payload".to_string()))?;
        let attachment = decode_call_attachment(payload).map_err(decode_error)?;
        let contract = tx
            .to
            .as_deref()
            .ok_or_else(|| decode_error("missing contract address".to_string()))?;

        match attachment.method.as_str() {
            START_VOTING => self.process_voting(contract, VotingEvent::Start, subscribers).await,
            PROLONG_VOTING => self.process_voting(contract, VotingEvent::Prolong, subscribers).await,
            _ => Ok(()),
        }
    }

    /// Notify committee members and schedule the reveal check
    #[instrument(skip(self, subscribers), fields(event = event.as_str()))]
    async fn process_voting(
        &self,
        contract: &str,
        event: VotingEvent,
        subscribers: &[Subscriber],
    ) -> Result<(), TriggerError> {
        info!(contract, "Oracle voting detected");

        let committee_size = self.committee_size(contract).await.to_string();
        let prize_pool = escape_markdown(&self.prize_pool(contract).await);
        let trigger_id = format!("oracle-voting-{}-{}", event.as_str(), contract);
        let action = Action {
            title: "Click to vote".to_string(),
            url: format!("{}{}", self.ctx.links.oracle_view_url, contract),
        };

        for subscriber in subscribers {
            if subscriber.identity.is_none() {
                continue;
            }
            if !self.in_committee(contract, &subscriber.coinbase_address).await {
                continue;
            }
            if event == VotingEvent::Prolong
                && self.has_private_vote(contract, &subscriber.coinbase_address).await
            {
                continue;
            }

            let emitted = self
                .ctx
                .notify(
                    &trigger_id,
                    self.epoch,
                    subscriber,
                    NEW_VOTING_TEMPLATE,
                    |t| {
                        fill(
                            t,
                            &[
                                ("commitee-size", committee_size.as_str()),
                                ("prize-pool", prize_pool.as_str()),
                            ],
                        )
                    },
                    Some(action.clone()),
                )
                .await;
            match emitted {
                Ok(_) => {}
                Err(e @ TriggerError::Queue(_)) => return Err(e),
                Err(e) => warn!(
                    contract,
                    subscriber = %subscriber.coinbase_address,
                    error = %e,
                    "Failed to notify committee member"
                ),
            }
        }

        let Some(vote_block) = self.vote_block(contract).await else {
            warn!(contract, "Cannot read vote block, reveal check skipped");
            return Ok(());
        };

        let watch = OracleVotingWatch {
            contract_address: contract.to_string(),
            due_block_height: vote_block + self.ctx.oracle.reveal_delay_blocks,
        };
        if let Err(e) = self.ctx.watches.upsert(&watch).await {
            warn!(contract, error = %e, "Failed to store oracle voting watch");
        }
        Ok(())
    }

    /// Remind voters who committed but did not reveal
    async fn process_delayed(&self, block: &Block, subscribers: &[Subscriber]) {
        let watches = match self.ctx.watches.due_at(block.height).await {
            Ok(watches) => watches,
            Err(e) => {
                warn!(height = block.height, error = %e, "Cannot load oracle voting watches");
                return;
            }
        };

        for watch in watches {
            let contract = watch.contract_address.as_str();
            let trigger_id = format!("oracle-public-voting-{}", contract);
            let action = Action {
                title: "Login into Idena app".to_string(),
                url: self.ctx.links.wallet_url.clone(),
            };

            for subscriber in subscribers {
                if subscriber.identity.is_none() {
                    continue;
                }
                let address = subscriber.coinbase_address.as_str();
                if self.has_public_vote(contract, address).await {
                    continue;
                }
                if !self.has_private_vote(contract, address).await {
                    continue;
                }

                if let Err(e) = self
                    .ctx
                    .notify(
                        &trigger_id,
                        self.epoch,
                        subscriber,
                        REVEAL_TEMPLATE,
                        str::to_string,
                        Some(action.clone()),
                    )
                    .await
                {
                    warn!(contract, subscriber = address, error = %e, "Failed to send reveal reminder");
                }
            }
        }
    }

    async fn committee_size(&self, contract: &str) -> u64 {
        self.ctx
            .chain
            .contract_read(contract, "committeeSize", ArgFormat::Uint64)
            .await
            .ok()
            .as_ref()
            .and_then(value_as_u64)
            .unwrap_or(0)
    }

    async fn prize_pool(&self, contract: &str) -> String {
        match self.ctx.chain.balance(contract).await {
            Ok(balance) => balance,
            Err(e) => {
                debug!(contract, error = %e, "Cannot read prize pool");
                "0".to_string()
            }
        }
    }

    async fn vote_block(&self, contract: &str) -> Option<u64> {
        self.ctx
            .chain
            .contract_readonly_call(contract, "voteBlock", ArgFormat::Uint64, &[])
            .await
            .ok()
            .as_ref()
            .and_then(value_as_u64)
            .filter(|block| *block > 0)
    }

    /// Membership is provable when the `proof` call succeeds
    async fn in_committee(&self, contract: &str, address: &str) -> bool {
        self.ctx
            .chain
            .contract_readonly_call(contract, "proof", ArgFormat::Hex, &[ContractArg::hex(0, address)])
            .await
            .is_ok()
    }

    async fn has_public_vote(&self, contract: &str, address: &str) -> bool {
        self.ctx
            .chain
            .contract_read_map(contract, "votes", address, ArgFormat::Hex)
            .await
            .is_ok()
    }

    async fn has_private_vote(&self, contract: &str, address: &str) -> bool {
        self.ctx
            .chain
            .contract_read_map(contract, "voteHashes", address, ArgFormat::Hex)
            .await
            .is_ok()
    }
}
