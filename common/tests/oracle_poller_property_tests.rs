// Property-based tests for the oracle voting chain poller

use chrono::{DateTime, Utc};
use common::chain::ScriptedChain;
use common::config::{EpochPolicy, Settings};
use common::models::{Block, ChainCursor, Identity, IdentityState, Notification, Subscriber};
use common::notifications::TemplateTable;
use common::router::NotificationEmitter;
use common::schedule::ManualClock;
use common::scheduler::SharedSubscribers;
use common::store::{IdempotencyStore, MemoryOracleWatchStore, MemoryTriggerStore, OracleWatchStore};
use common::triggers::oracle_voting::{BlockScanner, ORACLE_WATCHER_ID};
use common::triggers::{StepOutcome, TriggerContext};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Fixture {
    ctx: TriggerContext,
    chain: Arc<ScriptedChain>,
    store: Arc<MemoryTriggerStore>,
    watches: Arc<MemoryOracleWatchStore>,
    rx: mpsc::Receiver<Notification>,
}

fn fixture(initial_cursor: u64) -> Fixture {
    let mut settings = Settings::default();
    settings.oracle.initial_cursor = initial_cursor;

    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryTriggerStore::new());
    let watches = Arc::new(MemoryOracleWatchStore::new());
    let (emitter, rx) = NotificationEmitter::channel();
    let now: DateTime<Utc> = DateTime::from_timestamp(1_704_888_000, 0).unwrap();

    let ctx = TriggerContext {
        chain: chain.clone(),
        store: store.clone(),
        watches: watches.clone(),
        templates: Arc::new(
            TemplateTable::new()
                .with("oracle-voting-new", "human", "Vote: {commitee-size} / {prize-pool}")
                .with("oracle-public-voting", "human", "Reveal"),
        ),
        emitter,
        clock: Arc::new(ManualClock::new(now)),
        policy: EpochPolicy::default(),
        links: settings.links.clone(),
        oracle: settings.oracle.clone(),
        state_poll: settings.scheduler.state_poll(),
    };

    Fixture {
        ctx,
        chain,
        store,
        watches,
        rx,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// After N successful iterations the cursor moved by exactly N, heights were
/// requested in ascending order without repeats, and the next iteration idles.
#[test]
fn property_cursor_advances_by_one_per_block() {
    proptest!(|(
        initial in 0u64..1_000_000,
        blocks in 1u64..40,
    )| {
        let rt = runtime();
        rt.block_on(async {
            let f = fixture(initial);
            f.chain.push_empty_blocks(initial + 1, initial + blocks);
            let scanner = BlockScanner::new(f.ctx.clone(), SharedSubscribers::new(), 42);

            for i in 1..=blocks {
                assert_eq!(scanner.step().await.unwrap(), StepOutcome::Advanced(initial + i));
            }
            assert_eq!(scanner.step().await.unwrap(), StepOutcome::Idle);
            assert_eq!(scanner.load_cursor().await.unwrap(), ChainCursor::new(initial + blocks));

            let expected: Vec<u64> = (initial + 1..=initial + blocks + 1).collect();
            assert_eq!(f.chain.requested_heights(), expected);
        });
    });
}

/// A failure at height h leaves the cursor at h - 1; the next run retries h
/// and then continues in order.
#[test]
fn property_failed_height_is_reprocessed_first() {
    proptest!(|(
        blocks in 2u64..30,
        fail_at in 1u64..30,
    )| {
        prop_assume!(fail_at <= blocks);
        let rt = runtime();
        rt.block_on(async {
            let f = fixture(1);
            f.chain.push_empty_blocks(2, blocks + 1);
            let failing = fail_at + 1;
            f.chain.fail_block_once(failing);

            let scanner = BlockScanner::new(f.ctx.clone(), SharedSubscribers::new(), 42);
            let mut errors = 0;
            let mut processed = Vec::new();
            loop {
                match scanner.step().await {
                    Ok(StepOutcome::Advanced(h)) => processed.push(h),
                    Ok(StepOutcome::Idle) => break,
                    Err(_) => {
                        errors += 1;
                        assert_eq!(scanner.load_cursor().await.unwrap(), ChainCursor::new(failing - 1));
                    }
                }
            }

            assert_eq!(errors, 1);
            let expected: Vec<u64> = (2..=blocks + 1).collect();
            assert_eq!(processed, expected);
            let requests = f.chain.requested_heights();
            let position = requests.iter().position(|h| *h == failing).unwrap();
            assert_eq!(requests[position + 1], failing);
        });
    });
}

#[tokio::test]
async fn test_start_voting_at_101_schedules_reveal_check_at_530() {
    let mut f = fixture(1);
    f.store
        .store_payload(ORACLE_WATCHER_ID, 0, json!({"block": 100}))
        .await
        .unwrap();

    let contract = "0x9d6c2a1b4f0e8e3c7a5d6b2f1e0c9a8b7d6e5f4a";
    f.chain.push_block(Block {
        height: 101,
        timestamp: 1_704_888_000,
        transactions: vec!["0xstart".to_string()],
    });
    f.chain.add_contract_call("0xstart", contract, "startVoting");
    f.chain.set_call(contract, "voteBlock", None, json!("500"));
    f.chain.set_call(contract, "proof", None, json!("0x01"));

    let subscribers = SharedSubscribers::from_list(vec![
        Subscriber::new("anon", 1, "0xaaa"),
        Subscriber::new("member", 2, "0xbbb").with_identity(Identity {
            state: IdentityState::Human,
            ..Default::default()
        }),
    ]);
    let scanner = BlockScanner::new(f.ctx.clone(), subscribers, 42);
    assert_eq!(scanner.step().await.unwrap(), StepOutcome::Advanced(101));

    let watches = f.watches.all().await;
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].contract_address, contract);
    assert_eq!(watches[0].due_block_height, 530);
    assert_eq!(f.watches.due_at(530).await.unwrap(), watches);

    let mut sent = Vec::new();
    while let Ok(n) = f.rx.try_recv() {
        sent.push(n);
    }
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subscriber_id, "member");
    assert!(sent.iter().all(|n| n.subscriber_id != "anon"));
}
