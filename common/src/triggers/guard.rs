// Once-per-epoch execution guard

use crate::errors::{StorageError, TriggerError};
use crate::retry::{retry, ExponentialBackoff};
use crate::store::IdempotencyStore;
use crate::telemetry;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of a guarded run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Marker claimed and body executed
    Fired,
    /// Marker already present before the claim
    AlreadyDone,
    /// Another writer created the marker between the check and the claim
    LostRace,
    /// Cancelled while the store was unavailable; nothing was claimed
    Cancelled,
}

/// Run `body` at most once for `(trigger_id, epoch)`
///
/// The marker is claimed with an atomic conditional create before the body
/// runs, so a crash mid-body never leads to a second run. Store failures are
/// retried with capped backoff until they succeed or `token` is cancelled.
pub async fn run_once<F, Fut>(
    store: &dyn IdempotencyStore,
    trigger_id: &str,
    epoch: u64,
    token: &CancellationToken,
    body: F,
) -> Result<GuardOutcome, TriggerError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let Some(done) = until_stored(token, "is_done", || store.is_done(trigger_id, epoch)).await? else {
        return Ok(GuardOutcome::Cancelled);
    };
    if done {
        debug!(trigger_id, epoch, "Trigger already done");
        telemetry::record_trigger_skipped(trigger_id, "already_done");
        return Ok(GuardOutcome::AlreadyDone);
    }

    // A retried claim whose first attempt landed reads as a lost race
    let Some(claimed) =
        until_stored(token, "persist", || store.persist(trigger_id, epoch, None)).await?
    else {
        return Ok(GuardOutcome::Cancelled);
    };
    if !claimed {
        debug!(trigger_id, epoch, "Trigger claimed concurrently");
        telemetry::record_trigger_skipped(trigger_id, "lost_race");
        return Ok(GuardOutcome::LostRace);
    }

    info!(trigger_id, epoch, "Trigger fired");
    telemetry::record_trigger_fired(trigger_id);
    body().await;
    Ok(GuardOutcome::Fired)
}

/// Retry a store call until it succeeds; `None` when cancelled first
async fn until_stored<T, F, Fut>(
    token: &CancellationToken,
    operation: &str,
    f: F,
) -> Result<Option<T>, TriggerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let strategy = ExponentialBackoff::new();
    tokio::select! {
        _ = token.cancelled() => Ok(None),
        result = retry(&strategy, operation, f) => Ok(Some(result?)),
    }
}
