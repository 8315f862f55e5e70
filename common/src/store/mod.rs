// Persistence seams used by triggers and the scheduler
//
// PostgreSQL implementations live in `db::repositories`; the in-memory
// implementations back tests and dry runs.

pub mod memory;

use crate::errors::StorageError;
use crate::models::{OracleVotingWatch, Subscriber, TriggerRecord};
use async_trait::async_trait;

pub use memory::{MemoryOracleWatchStore, MemoryTriggerStore, MemoryUserDirectory};

/// Durable `(trigger_id, epoch)` markers
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Check whether a marker exists
    async fn is_done(&self, trigger_id: &str, epoch: u64) -> Result<bool, StorageError>;

    /// Atomically create the marker
    ///
    /// Returns `false` when the marker already existed, in which case nothing
    /// is written.
    async fn persist(
        &self,
        trigger_id: &str,
        epoch: u64,
        payload: Option<serde_json::Value>,
    ) -> Result<bool, StorageError>;

    /// Load a marker with its payload
    async fn get(&self, trigger_id: &str, epoch: u64) -> Result<Option<TriggerRecord>, StorageError>;

    /// Create or overwrite the payload of a marker
    async fn store_payload(
        &self,
        trigger_id: &str,
        epoch: u64,
        payload: serde_json::Value,
    ) -> Result<(), StorageError>;
}

/// Delayed reveal checks keyed by contract address
#[async_trait]
pub trait OracleWatchStore: Send + Sync {
    /// Insert or move the watch for a contract
    async fn upsert(&self, watch: &OracleVotingWatch) -> Result<(), StorageError>;

    /// Watches whose due height equals `height`
    async fn due_at(&self, height: u64) -> Result<Vec<OracleVotingWatch>, StorageError>;

    /// Drop watches due strictly below `height`, returning how many were removed
    async fn prune_before(&self, height: u64) -> Result<u64, StorageError>;
}

/// Source of subscribers that completed login
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list(&self) -> Result<Vec<Subscriber>, StorageError>;
}
