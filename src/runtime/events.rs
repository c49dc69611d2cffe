//! Runtime event stream payloads.

use crate::types::{CommitSeq, ContainerId};

/// Events emitted by a [`super::handle::StoreHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A transaction became visible.
    Committed {
        /// Commit sequence.
        seq: CommitSeq,
        /// Containers written by the commit, ascending.
        containers: Vec<ContainerId>,
    },
    /// A transaction hit a write conflict and is being retried.
    ConflictRetry {
        /// Retry number, starting at 1.
        attempt: u32,
    },
    /// Persistence has reached at least this commit sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        seq: CommitSeq,
    },
}
