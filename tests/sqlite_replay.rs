use tempfile::TempDir;

use listorder::{
    core::store::Store,
    persist::{CommitSink, sqlite::SqliteCommitSink},
    types::CheckMode,
};

fn seed(store: &Store) {
    store
        .transact(CheckMode::Deferred, |txn| {
            txn.create_container("outdoor")?;
            txn.create_container("indoor")?;
            for (name, text) in [("mow", "Mow lawn"), ("dig", "Dig garden"), ("sweep", "Sweep")] {
                txn.create_member(name, text)?;
            }
            txn.add_membership("outdoor", "mow", 3)?;
            txn.add_membership("outdoor", "dig", 4)?;
            txn.add_membership("indoor", "sweep", 0)?;
            txn.add_membership("indoor", "mow", 1)
        })
        .expect("seed");
}

#[test]
fn sqlite_replay_round_trips_state_and_order() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("lists.db");

    let store = Store::new();
    let mut sink = SqliteCommitSink::open(&db_path).expect("open sqlite");

    seed(&store);
    store.swap("outdoor", "mow", "dig").expect("swap");
    store.remove_membership("indoor", "mow").expect("remove");
    store.delete_member("sweep").expect("delete");

    let commits = store.drain_pending_commits();
    assert_eq!(commits.len(), 4);
    let durable = sink.append_commits(&commits).expect("append");
    assert_eq!(durable, store.latest_seq());
    drop(sink);

    let sink2 = SqliteCommitSink::open(&db_path).expect("reopen");
    assert_eq!(sink2.latest_seq().expect("latest"), store.latest_seq());
    let replayed = sink2.load_store().expect("replay");

    let orig = store.export_snapshot();
    let replay = replayed.export_snapshot();
    assert_eq!(orig.seq, replay.seq);
    assert_eq!(orig.members, replay.members);
    assert_eq!(orig.containers, replay.containers);
    assert_eq!(orig.memberships, replay.memberships);

    let outdoor: Vec<_> = replayed
        .list_ordered("outdoor")
        .expect("list")
        .map(|e| e.render(1))
        .collect();
    assert_eq!(outdoor, ["4. Dig garden", "5. Mow lawn"]);
    assert_eq!(replayed.list_ordered("indoor").expect("indoor").len(), 0);
}

#[test]
fn appending_the_same_commits_twice_is_idempotent() {
    let store = Store::new();
    let mut sink = SqliteCommitSink::open_in_memory().expect("open");

    seed(&store);
    let commits = store.drain_pending_commits();
    sink.append_commits(&commits).expect("append");
    sink.append_commits(&commits).expect("append again");

    assert_eq!(sink.load_commits_after(0).expect("load").len(), 1);
    assert!(sink.load_commits_after(store.latest_seq()).expect("tail").is_empty());
}

#[test]
fn snapshot_and_compaction_preserve_replay() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("lists.db");

    let store = Store::new();
    let mut sink = SqliteCommitSink::open(&db_path).expect("open sqlite");

    seed(&store);
    store.swap("outdoor", "mow", "dig").expect("swap");
    sink.append_commits(&store.drain_pending_commits()).expect("append");

    let snapshot = store.export_snapshot();
    sink.write_snapshot(&snapshot).expect("snapshot");
    let removed = sink.compact_through(snapshot.seq).expect("compact");
    assert_eq!(removed, 2);

    store.swap("outdoor", "mow", "dig").expect("swap back");
    sink.append_commits(&store.drain_pending_commits()).expect("append tail");
    drop(sink);

    let sink2 = SqliteCommitSink::open(&db_path).expect("reopen");
    assert_eq!(sink2.load_commits_after(0).expect("tail").len(), 1);
    let replayed = sink2.load_store().expect("replay");

    assert_eq!(replayed.latest_seq(), store.latest_seq());
    assert_eq!(replayed.resolve_membership("outdoor", "mow").expect("mow").position, 3);
    assert_eq!(replayed.resolve_membership("outdoor", "dig").expect("dig").position, 4);
}

#[test]
fn replayed_store_continues_id_allocation() {
    let store = Store::new();
    let mut sink = SqliteCommitSink::open_in_memory().expect("open");

    seed(&store);
    sink.append_commits(&store.drain_pending_commits()).expect("append");

    let replayed = sink.load_store().expect("replay");
    let last_member = replayed.member("sweep").expect("sweep").id;
    let last_container = replayed.container("indoor").expect("indoor").id;

    let fresh_member = replayed.create_member("rake", "Rake leaves").expect("member");
    let fresh_container = replayed.create_container("garage").expect("container");
    assert!(fresh_member > last_member);
    assert!(fresh_container > last_container);
    assert_eq!(replayed.latest_seq(), store.latest_seq() + 2);
}
