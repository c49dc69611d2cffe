/// SQLite journal.
pub mod sqlite;

use thiserror::Error;

use crate::{
    core::{error::StoreError, state::StoreSnapshotV1},
    op::StoredCommit,
    types::CommitSeq,
};

/// Failure while journaling or restoring commits.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite driver error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload (de)serialization error.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Replayed data was rejected by the store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A stored payload carries a format version this build cannot read.
    #[error("unsupported {kind} format version {found}")]
    UnsupportedFormat {
        /// Payload kind.
        kind: &'static str,
        /// Version found on disk.
        found: u16,
    },
    /// Anything else, including queue pressure and worker failures.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Durable destination for committed transactions.
///
/// `append_commits` must be all-or-nothing per call.
pub trait CommitSink: Send {
    /// Appends commits in sequence order; returns the highest sequence now durable.
    fn append_commits(&mut self, commits: &[StoredCommit]) -> PersistResult<CommitSeq>;
    /// Makes appended commits durable.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    /// Records a full snapshot as the new replay base.
    fn write_snapshot(&mut self, _snapshot: &StoreSnapshotV1) -> PersistResult<()> {
        Ok(())
    }
    /// Discards journaled commits covered by a snapshot.
    fn compact_through(&mut self, _seq: CommitSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
