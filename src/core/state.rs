//! Committed store image and op application.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    model::{Container, Member, Membership},
    op::Op,
    types::{CommitSeq, ContainerId, MemberId, Position},
};

use super::{
    error::{StoreError, StoreResult},
    indices::{MembershipSet, NameIndex, ReverseIndex},
    view::StateView,
};

/// Serializable full image of the committed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    /// Sequence of the last commit included.
    pub seq: CommitSeq,
    /// Next member id to allocate.
    pub next_member_id: u64,
    /// Next container id to allocate.
    pub next_container_id: u64,
    /// Members, ascending by id.
    pub members: Vec<Member>,
    /// Containers, ascending by id.
    pub containers: Vec<Container>,
    /// Memberships, ascending by `(container, position, member)`.
    pub memberships: Vec<Membership>,
}

/// Immutable-once-published image of all committed members, containers and
/// memberships, plus the last commit that wrote each container and member.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    seq: CommitSeq,
    members: HashMap<MemberId, Member>,
    member_names: NameIndex<MemberId>,
    containers: HashMap<ContainerId, Container>,
    container_names: NameIndex<ContainerId>,
    memberships: HashMap<ContainerId, Arc<MembershipSet>>,
    by_member: ReverseIndex,
    container_versions: HashMap<ContainerId, CommitSeq>,
    member_versions: HashMap<MemberId, CommitSeq>,
}

impl StoreState {
    /// Sequence of the last commit in this image.
    pub fn seq(&self) -> CommitSeq {
        self.seq
    }

    pub(crate) fn set_seq(&mut self, seq: CommitSeq) {
        self.seq = self.seq.max(seq);
    }

    /// Last commit that changed the container's existence or membership set.
    pub fn container_version(&self, id: ContainerId) -> CommitSeq {
        self.container_versions.get(&id).copied().unwrap_or(0)
    }

    /// Last commit that created or deleted the member.
    pub fn member_version(&self, id: MemberId) -> CommitSeq {
        self.member_versions.get(&id).copied().unwrap_or(0)
    }

    /// Containers `member` currently belongs to.
    pub fn containers_of(&self, member: MemberId) -> impl Iterator<Item = ContainerId> + '_ {
        self.by_member
            .get(&member)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Largest member id present, or 0.
    pub fn max_member_id(&self) -> u64 {
        self.members.keys().map(|id| id.0).max().unwrap_or(0)
    }

    /// Largest container id present, or 0.
    pub fn max_container_id(&self) -> u64 {
        self.containers.keys().map(|id| id.0).max().unwrap_or(0)
    }

    /// Rebuilds the image; every entity gets `snapshot.seq` as its version.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> StoreResult<Self> {
        let mut state = Self::default();
        let seq = snapshot.seq;
        for member in snapshot.members {
            state.apply(&Op::CreateMember { member }, seq)?;
        }
        for container in snapshot.containers {
            state.apply(&Op::CreateContainer { container }, seq)?;
        }
        for membership in snapshot.memberships {
            state.apply(&Op::AddMembership { membership }, seq)?;
        }
        state.seq = seq;
        Ok(state)
    }

    /// Serializable image with deterministic ordering.
    pub fn to_snapshot(&self, next_member_id: u64, next_container_id: u64) -> StoreSnapshotV1 {
        let mut members: Vec<Member> = self.members.values().cloned().collect();
        members.sort_unstable_by_key(|m| m.id);
        let mut containers: Vec<Container> = self.containers.values().cloned().collect();
        containers.sort_unstable_by_key(|c| c.id);
        let mut memberships: Vec<Membership> = self
            .memberships
            .iter()
            .flat_map(|(container, set)| {
                set.iter().map(|(member, position)| Membership {
                    container: *container,
                    member: *member,
                    position: *position,
                })
            })
            .collect();
        memberships.sort_unstable_by_key(|m| (m.container, m.position, m.member));

        StoreSnapshotV1 {
            seq: self.seq,
            next_member_id,
            next_container_id,
            members,
            containers,
            memberships,
        }
    }

    /// Applies one op as part of commit `seq`. Position uniqueness is not checked
    /// here; on error this op has made no change.
    pub fn apply(&mut self, op: &Op, seq: CommitSeq) -> StoreResult<()> {
        match op {
            Op::CreateMember { member } => {
                if self.members.contains_key(&member.id) {
                    return Err(StoreError::DuplicateName(member.id.to_string()));
                }
                if self.member_names.contains_key(&member.name) {
                    return Err(StoreError::DuplicateName(format!("member '{}'", member.name)));
                }
                self.member_names.insert(member.name.clone(), member.id);
                self.members.insert(member.id, member.clone());
                self.member_versions.insert(member.id, seq);
            }
            Op::CreateContainer { container } => {
                if self.containers.contains_key(&container.id) {
                    return Err(StoreError::DuplicateName(container.id.to_string()));
                }
                if self.container_names.contains_key(&container.name) {
                    return Err(StoreError::DuplicateName(format!(
                        "container '{}'",
                        container.name
                    )));
                }
                self.container_names
                    .insert(container.name.clone(), container.id);
                self.containers.insert(container.id, container.clone());
                self.container_versions.insert(container.id, seq);
            }
            Op::AddMembership { membership } => {
                let Membership {
                    container,
                    member,
                    position,
                } = *membership;
                self.require_endpoints(container, member)?;
                if self.position_of(container, member).is_some() {
                    return Err(StoreError::DuplicateName(format!(
                        "{member} in {container}"
                    )));
                }
                Arc::make_mut(self.memberships.entry(container).or_default())
                    .insert(member, position);
                self.by_member.entry(member).or_default().insert(container);
                self.container_versions.insert(container, seq);
            }
            Op::SetPosition {
                container,
                member,
                position,
                ..
            } => {
                let set = self
                    .memberships
                    .get_mut(container)
                    .filter(|set| set.contains_key(member))
                    .ok_or_else(|| StoreError::NotFound(format!("{member} in {container}")))?;
                Arc::make_mut(set).insert(*member, *position);
                self.container_versions.insert(*container, seq);
            }
            Op::RemoveMembership { container, member } => {
                let set = self
                    .memberships
                    .get_mut(container)
                    .filter(|set| set.contains_key(member))
                    .ok_or_else(|| StoreError::NotFound(format!("{member} in {container}")))?;
                Arc::make_mut(set).remove(member);
                self.unlink(*member, *container);
                self.container_versions.insert(*container, seq);
            }
            Op::DeleteContainer { id } => {
                let container = self
                    .containers
                    .remove(id)
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                self.container_names.remove(&container.name);
                if let Some(set) = self.memberships.remove(id) {
                    for member in set.keys() {
                        self.unlink(*member, *id);
                    }
                }
                self.container_versions.insert(*id, seq);
            }
            Op::DeleteMember { id } => {
                let member = self
                    .members
                    .remove(id)
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                self.member_names.remove(&member.name);
                for container in self.by_member.remove(id).unwrap_or_default() {
                    if let Some(set) = self.memberships.get_mut(&container) {
                        Arc::make_mut(set).remove(id);
                    }
                    self.container_versions.insert(container, seq);
                }
                self.member_versions.insert(*id, seq);
            }
        }
        Ok(())
    }

    fn require_endpoints(&self, container: ContainerId, member: MemberId) -> StoreResult<()> {
        if !self.containers.contains_key(&container) {
            return Err(StoreError::NotFound(container.to_string()));
        }
        if !self.members.contains_key(&member) {
            return Err(StoreError::NotFound(member.to_string()));
        }
        Ok(())
    }

    fn unlink(&mut self, member: MemberId, container: ContainerId) {
        if let Some(set) = self.by_member.get_mut(&member) {
            set.remove(&container);
            if set.is_empty() {
                self.by_member.remove(&member);
            }
        }
    }
}

impl StateView for StoreState {
    fn member_by_id(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    fn member_id_by_name(&self, name: &str) -> Option<MemberId> {
        self.member_names.get(name).copied()
    }

    fn container_by_id(&self, id: ContainerId) -> Option<&Container> {
        self.containers.get(&id)
    }

    fn container_id_by_name(&self, name: &str) -> Option<ContainerId> {
        self.container_names.get(name).copied()
    }

    fn position_of(&self, container: ContainerId, member: MemberId) -> Option<Position> {
        self.memberships
            .get(&container)
            .and_then(|set| set.get(&member).copied())
    }

    fn container_entries(&self, container: ContainerId) -> Vec<(MemberId, Position)> {
        self.memberships
            .get(&container)
            .map(|set| set.iter().map(|(m, p)| (*m, *p)).collect())
            .unwrap_or_default()
    }

    fn container_ids(&self) -> Vec<ContainerId> {
        self.containers.keys().copied().collect()
    }
}
