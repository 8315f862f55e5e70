// Fire time calculation for epoch-relative triggers
//
// Offsets are measured back from the next validation time. Percent-of-epoch
// times extrapolate the validation block from the observed block rate and
// are optionally moved to a fixed time of day.

use crate::config::EpochPolicy;
use crate::models::{Block, Epoch};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Mutex;

/// Source of wall-clock time for trigger scheduling
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real UTC clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// When a scheduled trigger entry fires relative to the epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FirePolicy {
    /// `next_validation_time - offset`
    Offset(Duration),
    /// Fraction of the extrapolated epoch, moved to the policy time of day
    PercentOfEpoch { fraction: f64 },
}

impl FirePolicy {
    /// Whether computing the fire time needs the current chain head
    pub fn needs_chain_head(&self) -> bool {
        matches!(self, FirePolicy::PercentOfEpoch { .. })
    }

    /// Compute the fire time, `None` when the chain head is required but missing
    pub fn fire_time(
        &self,
        epoch: &Epoch,
        head: Option<&Block>,
        policy: &EpochPolicy,
    ) -> Option<DateTime<Utc>> {
        match self {
            FirePolicy::Offset(offset) => Some(offset_fire_time(epoch.next_validation_time, *offset)),
            FirePolicy::PercentOfEpoch { fraction } => {
                let head = head?;
                let head_time = DateTime::<Utc>::from_timestamp(head.timestamp, 0)?;
                let raw = percent_of_epoch_time(
                    epoch.start_block_height,
                    epoch.next_validation_time,
                    head.height,
                    head_time,
                    *fraction,
                    policy.blocks_per_minute,
                );
                Some(snap_to_time_of_day(raw, policy.snap_time, policy.snap_timezone))
            }
        }
    }
}

/// Fire time for a fixed offset before validation
pub fn offset_fire_time(next_validation: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    next_validation - offset
}

/// Estimate when `fraction` of the epoch has elapsed by extrapolating blocks
///
/// The validation block is estimated as the current height plus the whole
/// minutes left until validation times the block rate. The epoch length in
/// blocks is measured from the start block; a negative length is treated as
/// zero. The result is `next_validation - length * (1 - fraction) / rate`
/// minutes.
pub fn percent_of_epoch_time(
    start_block_height: u64,
    next_validation: DateTime<Utc>,
    current_height: u64,
    current_timestamp: DateTime<Utc>,
    fraction: f64,
    blocks_per_minute: u32,
) -> DateTime<Utc> {
    let rate = blocks_per_minute.max(1) as i64;
    let fraction = fraction.clamp(0.0, 1.0);

    let minutes_left = (next_validation - current_timestamp).num_minutes();
    let validation_block = current_height as i64 + minutes_left * rate;
    let epoch_blocks = (validation_block - start_block_height as i64).max(0);

    let minutes_before = epoch_blocks as f64 * (1.0 - fraction) / rate as f64;
    let millis_before = (minutes_before * 60_000.0).round() as i64;

    next_validation - Duration::milliseconds(millis_before)
}

/// Move a timestamp to a fixed time of day on its calendar date in `tz`
pub fn snap_to_time_of_day(dt: DateTime<Utc>, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let date = dt.with_timezone(&tz).date_naive();
    match tz.from_local_datetime(&date.and_time(time)).earliest() {
        Some(snapped) => snapped.with_timezone(&Utc),
        None => dt,
    }
}

/// Delay before `fire_at`, zero when it already passed
pub fn delay_until(fire_at: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (fire_at - now).to_std().unwrap_or(std::time::Duration::ZERO)
}

/// Whole days between now and the next validation, as shown to users
pub fn days_left(next_validation: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (next_validation - now).num_days()
}
