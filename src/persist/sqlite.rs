//! SQLite-backed append-only commit journal.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::{
    core::{state::StoreSnapshotV1, store::Store},
    op::{COMMIT_FORMAT_VERSION, StoredCommit, StoredCommitEnvelope},
    types::{CommitSeq, now_ms},
};

use super::{CommitSink, PersistError, PersistResult};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    format_version: u16,
    snapshot: StoreSnapshotV1,
}

/// Journals commits and snapshots to a single SQLite database.
pub struct SqliteCommitSink {
    conn: Connection,
}

impl SqliteCommitSink {
    /// Opens or creates the journal at `path` (WAL, `synchronous=NORMAL`).
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening commit journal");
        Self::with_connection(Connection::open(path)?)
    }

    /// Opens a journal that lives only as long as the sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Rebuilds a store from the newest snapshot plus every commit after it.
    pub fn load_store(&self) -> PersistResult<Store> {
        let store = self
            .latest_snapshot()?
            .map(Store::from_snapshot)
            .transpose()?
            .unwrap_or_default();

        let tail = self.load_commits_after(store.latest_seq())?;
        tracing::debug!(base_seq = store.latest_seq(), replay = tail.len(), "replaying commit journal");
        for commit in tail {
            store.apply_replayed_commit(commit)?;
        }
        Ok(store)
    }

    /// Journaled commits with a sequence above `seq`, ascending.
    pub fn load_commits_after(&self, seq: CommitSeq) -> PersistResult<Vec<StoredCommit>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, ts_ms, payload FROM commits WHERE seq > ?1 ORDER BY seq")?;
        let commits = stmt
            .query_map(params![seq as i64], commit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(commits)
    }

    /// Stores `snapshot` as the new replay base.
    pub fn write_snapshot(&mut self, snapshot: &StoreSnapshotV1) -> PersistResult<()> {
        let record = SnapshotRecord {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        self.conn.execute(
            "INSERT INTO snapshots(last_seq, ts_ms, payload) VALUES (?1, ?2, ?3)",
            params![snapshot.seq as i64, now_ms() as i64, serde_json::to_vec(&record)?],
        )?;
        tracing::info!(
            seq = snapshot.seq,
            members = snapshot.members.len(),
            containers = snapshot.containers.len(),
            "snapshot written"
        );
        Ok(())
    }

    /// Drops journaled commits at or below `seq`; returns how many were removed.
    pub fn compact_through(&mut self, seq: CommitSeq) -> PersistResult<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM commits WHERE seq <= ?1", params![seq as i64])?;
        tracing::debug!(seq, removed, "journal compacted");
        Ok(removed)
    }

    /// Highest journaled commit sequence, or 0 for an empty journal.
    pub fn latest_seq(&self) -> PersistResult<CommitSeq> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM commits", [], |row| row.get(0))?;
        Ok(max.map_or(0, |seq| seq as CommitSeq))
    }

    fn latest_snapshot(&self) -> PersistResult<Option<StoreSnapshotV1>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|bytes| -> PersistResult<StoreSnapshotV1> {
                let record: SnapshotRecord = serde_json::from_slice(&bytes)?;
                check_format("snapshot", record.format_version, SNAPSHOT_FORMAT_VERSION)?;
                Ok(record.snapshot)
            })
            .transpose()
    }
}

impl CommitSink for SqliteCommitSink {
    fn append_commits(&mut self, commits: &[StoredCommit]) -> PersistResult<CommitSeq> {
        let Some(last) = commits.last() else {
            return self.latest_seq();
        };

        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO commits(seq, ts_ms, txn_id, op_count, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for commit in commits {
                let payload = serde_json::to_vec(&StoredCommitEnvelope::new(commit.clone()))?;
                insert.execute(params![
                    commit.seq as i64,
                    commit.ts_ms as i64,
                    commit.txn_id as i64,
                    commit.ops.len() as i64,
                    payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(last.seq)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &StoreSnapshotV1) -> PersistResult<()> {
        SqliteCommitSink::write_snapshot(self, snapshot)
    }

    fn compact_through(&mut self, seq: CommitSeq) -> PersistResult<usize> {
        SqliteCommitSink::compact_through(self, seq)
    }
}

/// Decodes one `commits` row; the row's columns are authoritative for `seq` and `ts_ms`.
fn commit_from_row(row: &Row<'_>) -> rusqlite::Result<StoredCommit> {
    let seq: i64 = row.get(0)?;
    let ts_ms: i64 = row.get(1)?;
    let payload: Vec<u8> = row.get(2)?;
    let envelope = decode_commit(&payload).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Blob, Box::new(err))
    })?;
    Ok(StoredCommit {
        seq: seq as CommitSeq,
        ts_ms: ts_ms as u64,
        ..envelope
    })
}

fn decode_commit(payload: &[u8]) -> PersistResult<StoredCommit> {
    let envelope: StoredCommitEnvelope = serde_json::from_slice(payload)?;
    check_format("commit", envelope.format_version, COMMIT_FORMAT_VERSION)?;
    Ok(envelope.stored)
}

fn check_format(kind: &'static str, found: u16, expected: u16) -> PersistResult<()> {
    if found == expected {
        Ok(())
    } else {
        Err(PersistError::UnsupportedFormat { kind, found })
    }
}
