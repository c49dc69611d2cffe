//! Shared primitive ids, ordering keys, and transaction modes.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Ordering key of a membership within its container.
pub type Position = u64;
/// Monotonic sequence assigned to every published commit.
pub type CommitSeq = u64;
/// Transaction identifier, unique per store.
pub type TxnId = u64;

/// Wall-clock milliseconds since the Unix epoch, 0 if the clock is before it.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Stable member identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u64);

/// Stable container identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member#{}", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container#{}", self.0)
    }
}

/// Addresses a container by id or by unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKey<'a> {
    /// Lookup by id.
    Id(ContainerId),
    /// Lookup by name.
    Name(&'a str),
}

/// Addresses a member by id or by unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKey<'a> {
    /// Lookup by id.
    Id(MemberId),
    /// Lookup by name.
    Name(&'a str),
}

impl From<ContainerId> for ContainerKey<'_> {
    fn from(value: ContainerId) -> Self {
        Self::Id(value)
    }
}

impl<'a> From<&'a str> for ContainerKey<'a> {
    fn from(value: &'a str) -> Self {
        Self::Name(value)
    }
}

impl<'a> From<&'a String> for ContainerKey<'a> {
    fn from(value: &'a String) -> Self {
        Self::Name(value.as_str())
    }
}

impl From<MemberId> for MemberKey<'_> {
    fn from(value: MemberId) -> Self {
        Self::Id(value)
    }
}

impl<'a> From<&'a str> for MemberKey<'a> {
    fn from(value: &'a str) -> Self {
        Self::Name(value)
    }
}

impl<'a> From<&'a String> for MemberKey<'a> {
    fn from(value: &'a String) -> Self {
        Self::Name(value.as_str())
    }
}

impl fmt::Display for ContainerKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => id.fmt(f),
            Self::Name(name) => write!(f, "container '{name}'"),
        }
    }
}

impl fmt::Display for MemberKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => id.fmt(f),
            Self::Name(name) => write!(f, "member '{name}'"),
        }
    }
}

/// When the per-container position uniqueness rule is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CheckMode {
    /// Checked once over all touched containers at commit.
    #[default]
    Deferred,
    /// Checked after every mutating call, scoped to the touched container.
    Immediate,
}
