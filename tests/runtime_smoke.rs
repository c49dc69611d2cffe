use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tempfile::TempDir;

use listorder::{
    core::store::Store,
    op::StoredCommit,
    persist::{CommitSink, PersistError, PersistResult, sqlite::SqliteCommitSink},
    runtime::{
        events::StoreEvent,
        handle::{RuntimeConfig, RuntimeError, StoreHandle, spawn_store},
    },
    types::{CheckMode, CommitSeq, ContainerId},
};

struct SlowSink {
    seen: Arc<Mutex<Vec<CommitSeq>>>,
    delay: Duration,
}

impl CommitSink for SlowSink {
    fn append_commits(&mut self, commits: &[StoredCommit]) -> PersistResult<CommitSeq> {
        std::thread::sleep(self.delay);
        let mut seen = self.seen.lock().expect("lock");
        for commit in commits {
            seen.push(commit.seq);
        }
        Ok(commits.last().map(|c| c.seq).unwrap_or(0))
    }
}

/// Journals into SQLite but rejects the first `failures` appends.
struct FlakySink {
    inner: SqliteCommitSink,
    failures: usize,
}

impl CommitSink for FlakySink {
    fn append_commits(&mut self, commits: &[StoredCommit]) -> PersistResult<CommitSeq> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(PersistError::Message("disk unavailable".to_string()));
        }
        self.inner.append_commits(commits)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.inner.flush()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn seed_outdoor(handle: &StoreHandle) -> ContainerId {
    handle
        .transact(CheckMode::Deferred, |txn| {
            let outdoor = txn.create_container("outdoor")?;
            txn.create_member("mow", "Mow lawn")?;
            txn.create_member("dig", "Dig garden")?;
            txn.add_membership(outdoor, "mow", 3)?;
            txn.add_membership(outdoor, "dig", 4)?;
            Ok(outdoor)
        })
        .await
        .expect("seed")
}

async fn next_event(sub: &mut tokio::sync::broadcast::Receiver<StoreEvent>) -> StoreEvent {
    tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("recv timeout")
        .expect("recv")
}

#[tokio::test]
async fn runtime_swap_query_and_events_ordered() {
    let handle = spawn_store(Store::new(), None, RuntimeConfig::default());
    let mut sub = handle.subscribe();

    let outdoor = seed_outdoor(&handle).await;
    handle.swap("outdoor", "mow", "dig").await.expect("swap");

    let rendered: Vec<String> = handle
        .list_ordered(outdoor)
        .await
        .expect("list")
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(rendered, ["4. Dig garden", "5. Mow lawn"]);
    let mow = handle.resolve_membership("outdoor", "mow").await.expect("mow");
    assert_eq!(mow.position, 4);

    let mut committed = Vec::new();
    for _ in 0..6 {
        if let StoreEvent::Committed { seq, containers } = next_event(&mut sub).await {
            committed.push((seq, containers));
        }
        if committed.len() == 2 {
            break;
        }
    }
    assert_eq!(committed, [(1, vec![outdoor]), (2, vec![outdoor])]);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn conflicting_transaction_is_retried() {
    init_tracing();
    let handle = spawn_store(Store::new(), None, RuntimeConfig::default());
    seed_outdoor(&handle).await;
    let mut sub = handle.subscribe();

    let store = Arc::clone(handle.store());
    let mut attempts = 0u32;
    handle
        .transact(CheckMode::Deferred, |txn| {
            attempts += 1;
            if attempts == 1 {
                store.swap("outdoor", "mow", "dig")?;
            }
            txn.swap("outdoor", "mow", "dig")
        })
        .await
        .expect("retried swap");
    assert_eq!(attempts, 2);

    assert_eq!(next_event(&mut sub).await, StoreEvent::ConflictRetry { attempt: 1 });
    assert_eq!(store.resolve_membership("outdoor", "mow").expect("mow").position, 3);
    assert_eq!(store.latest_seq(), 3);
}

#[tokio::test]
async fn retries_give_up_after_configured_attempts() {
    init_tracing();
    let cfg = RuntimeConfig {
        max_conflict_retries: 2,
        retry_backoff_ms: 1,
        ..RuntimeConfig::default()
    };
    let handle = spawn_store(Store::new(), None, cfg);
    seed_outdoor(&handle).await;

    let store = Arc::clone(handle.store());
    let mut attempts = 0u32;
    let result = handle
        .transact(CheckMode::Deferred, |txn| {
            attempts += 1;
            store.swap("outdoor", "mow", "dig")?;
            txn.swap("outdoor", "mow", "dig")
        })
        .await;

    assert!(matches!(result, Err(RuntimeError::Store(ref err)) if err.is_retryable()));
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn sqlite_sink_reports_durability_and_checkpoints() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("lists.db");
    let sink = SqliteCommitSink::open(&db_path).expect("open sqlite");

    let handle = spawn_store(Store::new(), Some(Box::new(sink)), RuntimeConfig::default());
    let mut sub = handle.subscribe();

    seed_outdoor(&handle).await;
    handle.swap("outdoor", "mow", "dig").await.expect("swap");
    handle.checkpoint().await.expect("checkpoint");
    handle.swap("outdoor", "mow", "dig").await.expect("swap back");
    assert_eq!(handle.flush().await.expect("flush"), 3);

    let mut durable = 0;
    for _ in 0..12 {
        if let StoreEvent::DurableUpTo { seq } = next_event(&mut sub).await {
            durable = durable.max(seq);
        }
        if durable == 3 {
            break;
        }
    }
    assert_eq!(durable, 3);
    handle.shutdown().await.expect("shutdown");
    let expected = handle.store().export_snapshot();

    let reopened = SqliteCommitSink::open(&db_path).expect("reopen");
    let replayed = reopened.load_store().expect("replay");
    let replay = replayed.export_snapshot();
    assert_eq!(replay.seq, expected.seq);
    assert_eq!(replay.memberships, expected.memberships);
}

#[tokio::test]
async fn slow_sink_surfaces_queue_pressure() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(250),
    };

    let cfg = RuntimeConfig {
        flush_on_commit: true,
        batch_max_commits: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_commits: 0,
        ..RuntimeConfig::default()
    };

    let handle = spawn_store(Store::new(), Some(Box::new(sink)), cfg);
    let mut sub = handle.subscribe();

    seed_outdoor(&handle).await;

    let mut durable_seen = false;
    for _ in 0..5 {
        if matches!(next_event(&mut sub).await, StoreEvent::DurableUpTo { .. }) {
            durable_seen = true;
            break;
        }
    }
    assert!(durable_seen, "expected DurableUpTo event");

    let mut queue_error_seen = false;
    for i in 0..12u64 {
        let r = handle
            .transact(CheckMode::Deferred, |txn| txn.create_member(format!("task{i}"), "Chore"))
            .await;
        if let Err(RuntimeError::Persist(_)) = r {
            queue_error_seen = true;
            break;
        }
    }
    assert!(queue_error_seen, "expected persistence queue pressure to surface as error");

    handle.shutdown().await.expect("shutdown");
    let seen = seen.lock().expect("lock").clone();
    assert_eq!(seen.last().copied(), Some(handle.store().latest_seq()));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "journal order: {seen:?}");
}

#[tokio::test]
async fn failed_append_is_retried_before_later_commits() {
    init_tracing();
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("lists.db");
    let sink = FlakySink {
        inner: SqliteCommitSink::open(&db_path).expect("open sqlite"),
        failures: 1,
    };

    let handle = spawn_store(Store::new(), Some(Box::new(sink)), RuntimeConfig::default());
    handle
        .transact(CheckMode::Deferred, |txn| txn.create_container("outdoor"))
        .await
        .expect("container");
    handle
        .transact(CheckMode::Deferred, |txn| txn.create_member("mow", "Mow lawn"))
        .await
        .expect("member");
    handle
        .transact(CheckMode::Deferred, |txn| txn.add_membership("outdoor", "mow", 3))
        .await
        .expect("membership");

    assert_eq!(handle.flush().await.expect("flush"), 3);
    handle.shutdown().await.expect("shutdown");

    let reopened = SqliteCommitSink::open(&db_path).expect("reopen");
    let journaled: Vec<CommitSeq> = reopened
        .load_commits_after(0)
        .expect("load")
        .iter()
        .map(|c| c.seq)
        .collect();
    assert_eq!(journaled, [1, 2, 3]);

    let replayed = reopened.load_store().expect("replay");
    assert_eq!(replayed.export_snapshot().memberships, handle.store().export_snapshot().memberships);
    assert_eq!(replayed.resolve_membership("outdoor", "mow").expect("mow").position, 3);
}

#[tokio::test]
async fn failing_sink_never_reports_durability() {
    let sink = FlakySink {
        inner: SqliteCommitSink::open_in_memory().expect("open"),
        failures: usize::MAX,
    };
    let handle = spawn_store(Store::new(), Some(Box::new(sink)), RuntimeConfig::default());

    let outdoor = seed_outdoor(&handle).await;
    assert_eq!(handle.store().container("outdoor").expect("visible").id, outdoor);

    assert!(matches!(handle.flush().await, Err(RuntimeError::Persist(_))));
    assert!(matches!(handle.checkpoint().await, Err(RuntimeError::Persist(_))));
    assert!(matches!(handle.shutdown().await, Err(RuntimeError::Persist(_))));
}

#[test]
fn runtime_config_fills_missing_fields_with_defaults() {
    let cfg: RuntimeConfig =
        serde_json::from_str(r#"{"persist_queue_bound": 8, "max_conflict_retries": 0}"#).expect("config");
    assert_eq!(cfg.persist_queue_bound, 8);
    assert_eq!(cfg.max_conflict_retries, 0);
    assert_eq!(cfg.batch_max_commits, RuntimeConfig::default().batch_max_commits);
    assert!(cfg.flush_on_commit);
}
