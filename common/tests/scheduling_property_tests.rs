// Property-based tests for epoch trigger scheduling

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use common::chain::ScriptedChain;
use common::config::{EpochPolicy, Settings};
use common::models::{Epoch, Identity, IdentityState, Notification, Subscriber};
use common::notifications::TemplateTable;
use common::router::NotificationEmitter;
use common::schedule::{percent_of_epoch_time, snap_to_time_of_day, FirePolicy, ManualClock};
use common::scheduler::SharedSubscribers;
use common::store::{IdempotencyStore, MemoryOracleWatchStore, MemoryTriggerStore};
use common::triggers::{Audience, Body, ScheduleEntry, ScheduledTrigger, Trigger, TriggerContext};
use proptest::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

struct Fixture {
    ctx: TriggerContext,
    store: Arc<MemoryTriggerStore>,
    clock: Arc<ManualClock>,
    rx: mpsc::Receiver<Notification>,
}

fn fixture(templates: TemplateTable, now: DateTime<Utc>) -> Fixture {
    let settings = Settings::default();
    let store = Arc::new(MemoryTriggerStore::new());
    let clock = Arc::new(ManualClock::new(now));
    let (emitter, rx) = NotificationEmitter::channel();
    let ctx = TriggerContext {
        chain: Arc::new(ScriptedChain::new()),
        store: store.clone(),
        watches: Arc::new(MemoryOracleWatchStore::new()),
        templates: Arc::new(templates),
        emitter,
        clock: clock.clone(),
        policy: EpochPolicy::default(),
        links: settings.links.clone(),
        oracle: settings.oracle.clone(),
        state_poll: settings.scheduler.state_poll(),
    };
    Fixture {
        ctx,
        store,
        clock,
        rx,
    }
}

fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

fn subscriber(i: usize, made: u32, required: u32) -> Subscriber {
    Subscriber::new(format!("u{}", i), i as i64, format!("0x{:040x}", i)).with_identity(Identity {
        state: IdentityState::Verified,
        made_flips: made,
        required_flips: required,
        ..Default::default()
    })
}

/// Increasing the fraction never moves the fire time earlier, and the whole
/// epoch elapsed means the validation time itself.
#[test]
fn property_percent_fire_time_is_monotonic() {
    proptest!(|(
        start_height in 0u64..5_000_000,
        head_offset in 0u64..200_000,
        minutes_left in -600i64..40_000,
        mut fractions in prop::collection::vec(0.0f64..=1.0, 2..20),
    )| {
        let next_validation = ts("2024-01-10T12:00:00Z");
        let head_time = next_validation - Duration::minutes(minutes_left);
        let head_height = start_height + head_offset;
        fractions.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let times: Vec<DateTime<Utc>> = fractions
            .iter()
            .map(|p| percent_of_epoch_time(start_height, next_validation, head_height, head_time, *p, 3))
            .collect();

        for pair in times.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        for t in &times {
            prop_assert!(*t <= next_validation);
        }

        let full = percent_of_epoch_time(start_height, next_validation, head_height, head_time, 1.0, 3);
        prop_assert_eq!(full, next_validation);

        let snap = NaiveTime::from_hms_opt(13, 30, 0).unwrap();
        let snapped: Vec<DateTime<Utc>> = times.iter().map(|t| snap_to_time_of_day(*t, snap, Tz::UTC)).collect();
        for pair in snapped.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    });
}

/// Ready and not-ready audiences split identity holders with no overlap and
/// no omission.
#[test]
fn property_readiness_segments_partition_subscribers() {
    proptest!(|(
        flips in prop::collection::vec((0u32..10, 0u32..10), 0..50),
    )| {
        let subscribers: Vec<Subscriber> = flips
            .iter()
            .enumerate()
            .map(|(i, (made, required))| subscriber(i, *made, *required))
            .collect();

        let ready: Vec<&Subscriber> = subscribers.iter().filter(|s| Audience::Ready.includes(s)).collect();
        let not_ready: Vec<&Subscriber> = subscribers.iter().filter(|s| Audience::NotReady.includes(s)).collect();

        prop_assert_eq!(ready.len() + not_ready.len(), subscribers.len());
        for s in &ready {
            prop_assert!(!Audience::NotReady.includes(s));
            let identity = s.identity.as_ref().unwrap();
            prop_assert!(identity.made_flips >= identity.required_flips);
        }
    });
}

/// Restarting a trigger any number of times within one epoch emits once per
/// subscriber and claims the marker once.
#[test]
fn property_restarts_fire_at_most_once() {
    proptest!(|(
        restarts in 1usize..6,
        audience_size in 1usize..8,
    )| {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut f = fixture(
                TemplateTable::new().with("validation.ready.now", "verified", "Now"),
                ts("2024-01-10T12:30:00Z"),
            );
            let subscribers = SharedSubscribers::from_list(
                (0..audience_size).map(|i| subscriber(i, 3, 3)).collect(),
            );
            let epoch = Epoch {
                number: 42,
                next_validation_time: ts("2024-01-10T12:00:00Z"),
                start_block_height: 0,
            };

            let mut trigger = ScheduledTrigger::new(
                "validation",
                vec![ScheduleEntry::new(
                    "validation.ready.now",
                    FirePolicy::Offset(Duration::zero()),
                    Audience::Ready,
                    Body::DaysLeft,
                )],
                f.ctx.clone(),
            );

            for _ in 0..restarts {
                trigger.start(&epoch, &subscribers).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            trigger.stop().await;

            assert_eq!(drain(&mut f.rx).len(), audience_size);
            assert_eq!(f.store.persist_calls(), 1);
        });
    });
}

#[tokio::test(start_paused = true)]
async fn test_one_hour_offset_fires_at_eleven_for_epoch_42() {
    let now = ts("2024-01-10T09:00:00Z");
    let mut f = fixture(
        TemplateTable::new().with("x", "verified", "Soon"),
        now,
    );
    let epoch = Epoch {
        number: 42,
        next_validation_time: ts("2024-01-10T12:00:00Z"),
        start_block_height: 0,
    };
    let policy = FirePolicy::Offset(Duration::hours(1));
    assert_eq!(
        policy.fire_time(&epoch, None, &EpochPolicy::default()),
        Some(ts("2024-01-10T11:00:00Z"))
    );

    let subscribers = SharedSubscribers::from_list(vec![subscriber(1, 3, 3)]);
    let mut trigger = ScheduledTrigger::new(
        "x",
        vec![ScheduleEntry::new("x", policy, Audience::IdentityHolders, Body::DaysLeft)],
        f.ctx.clone(),
    );
    trigger.start(&epoch, &subscribers).await.unwrap();

    // Two hours from 09:00 minus a second: not fired yet
    tokio::time::sleep(std::time::Duration::from_secs(2 * 3600 - 1)).await;
    assert!(!f.store.is_done("x", 42).await.unwrap());
    assert!(drain(&mut f.rx).is_empty());

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    assert!(f.store.is_done("x", 42).await.unwrap());
    assert_eq!(f.store.persist_calls(), 1);
    assert_eq!(drain(&mut f.rx).len(), 1);

    // Restart after the fire time: fires immediately but the marker holds
    f.clock.set(ts("2024-01-10T11:00:01Z"));
    trigger.start(&epoch, &subscribers).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    trigger.stop().await;
    assert_eq!(f.store.persist_calls(), 1);
    assert!(drain(&mut f.rx).is_empty());
}
