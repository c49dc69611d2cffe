//! Mutation operation model and persistence wrappers.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::{
    model::{Container, Member, Membership},
    types::{CommitSeq, ContainerId, MemberId, Position, TxnId},
};

/// Version number for serialized [`StoredCommitEnvelope`] payloads.
pub const COMMIT_FORMAT_VERSION: u16 = 1;

/// One mutation recorded by a transaction, in call order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Create a member with a freshly allocated id.
    CreateMember {
        /// Created record.
        member: Member,
    },
    /// Create a container with a freshly allocated id.
    CreateContainer {
        /// Created record.
        container: Container,
    },
    /// Place a member in a container.
    AddMembership {
        /// Created membership.
        membership: Membership,
    },
    /// Move an existing membership to a new position.
    SetPosition {
        /// Owning container.
        container: ContainerId,
        /// Moved member.
        member: MemberId,
        /// New position.
        position: Position,
        /// Position before the move.
        prev: Position,
    },
    /// Remove a member from a container.
    RemoveMembership {
        /// Owning container.
        container: ContainerId,
        /// Removed member.
        member: MemberId,
    },
    /// Delete a container and all of its memberships.
    DeleteContainer {
        /// Deleted container.
        id: ContainerId,
    },
    /// Delete a member and every membership referencing it.
    DeleteMember {
        /// Deleted member.
        id: MemberId,
    },
}

impl Op {
    /// Container whose membership set this op writes directly, if any.
    pub fn container(&self) -> Option<ContainerId> {
        match self {
            Op::CreateContainer { container } => Some(container.id),
            Op::AddMembership { membership } => Some(membership.container),
            Op::SetPosition { container, .. } | Op::RemoveMembership { container, .. } => {
                Some(*container)
            }
            Op::DeleteContainer { id } => Some(*id),
            Op::CreateMember { .. } | Op::DeleteMember { .. } => None,
        }
    }
}

/// A published transaction: its commit sequence plus its ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCommit {
    /// Monotonic commit sequence.
    pub seq: CommitSeq,
    /// Commit timestamp in milliseconds.
    pub ts_ms: u64,
    /// Transaction that produced this commit.
    pub txn_id: TxnId,
    /// Ops in the order the transaction issued them.
    pub ops: Vec<Op>,
}

impl StoredCommit {
    /// Containers written directly by this commit, ascending.
    pub fn containers(&self) -> Vec<ContainerId> {
        let mut out: Vec<ContainerId> = self
            .ops
            .iter()
            .filter_map(Op::container)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        out.sort_unstable();
        out
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCommitEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped commit.
    pub stored: StoredCommit,
}

impl StoredCommitEnvelope {
    /// Constructs an envelope using [`COMMIT_FORMAT_VERSION`].
    pub fn new(stored: StoredCommit) -> Self {
        Self {
            format_version: COMMIT_FORMAT_VERSION,
            stored,
        }
    }
}
