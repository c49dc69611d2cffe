use hashbrown::{HashMap, HashSet};

use crate::types::{ContainerId, MemberId, Position};

/// Positions of the members of one container.
pub type MembershipSet = HashMap<MemberId, Position>;
/// Unique-name lookup.
pub type NameIndex<Id> = HashMap<String, Id>;
/// Containers each member currently belongs to.
pub type ReverseIndex = HashMap<MemberId, HashSet<ContainerId>>;
