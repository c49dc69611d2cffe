//! Per-container position uniqueness check.

use std::{collections::BTreeSet, fmt};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::types::{ContainerId, MemberId, Position};

/// Two memberships of one container found at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCollision {
    /// Container holding both memberships.
    pub container: ContainerId,
    /// Shared position.
    pub position: Position,
    /// Colliding members, lower id first.
    pub members: (MemberId, MemberId),
}

impl fmt::Display for PositionCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} and {} both at position {} in {}",
            self.members.0, self.members.1, self.position, self.container
        )
    }
}

/// Evaluates the rule that positions are pairwise distinct within a container.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstraintChecker;

impl ConstraintChecker {
    /// Checks one container's `(member, position)` pairs.
    pub fn check_container<I>(container: ContainerId, entries: I) -> Result<(), PositionCollision>
    where
        I: IntoIterator<Item = (MemberId, Position)>,
    {
        let mut seen: HashMap<Position, MemberId> = HashMap::new();
        for (member, position) in entries {
            if let Some(other) = seen.insert(position, member) {
                let members = if other <= member {
                    (other, member)
                } else {
                    (member, other)
                };
                return Err(PositionCollision {
                    container,
                    position,
                    members,
                });
            }
        }
        Ok(())
    }

    /// Checks every container in `containers`, ascending by id, reporting the first
    /// collision. `entries_of` supplies a container's current memberships.
    pub fn check_containers<F, I>(
        containers: &BTreeSet<ContainerId>,
        mut entries_of: F,
    ) -> Result<(), PositionCollision>
    where
        F: FnMut(ContainerId) -> I,
        I: IntoIterator<Item = (MemberId, Position)>,
    {
        for container in containers {
            Self::check_container(*container, entries_of(*container))?;
        }
        Ok(())
    }
}
