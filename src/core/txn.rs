//! Transactions: a private overlay over a snapshot, committed atomically.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use hashbrown::HashMap;

use crate::{
    model::{Container, Member, Membership, MembershipRef},
    op::Op,
    types::{CheckMode, CommitSeq, ContainerId, ContainerKey, MemberId, MemberKey, Position, TxnId},
};

use super::{
    checker::ConstraintChecker,
    error::{StoreError, StoreResult},
    state::StoreState,
    store::Store,
    view::{OrderedIter, StateView},
};

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting reads and mutations.
    Open,
    /// Validation and constraint check in progress.
    Committing,
    /// Published at the given sequence.
    Committed(CommitSeq),
    /// Discarding the overlay after a failure.
    Aborting,
    /// Overlay discarded; nothing was published.
    Aborted,
}

/// Transaction-local writes layered over the snapshot. `None` slots are deletions.
#[derive(Debug, Default)]
struct Overlay {
    members: HashMap<MemberId, Option<Member>>,
    member_names: HashMap<String, Option<MemberId>>,
    containers: HashMap<ContainerId, Option<Container>>,
    container_names: HashMap<String, Option<ContainerId>>,
    memberships: HashMap<ContainerId, HashMap<MemberId, Option<Position>>>,
    ops: Vec<Op>,
}

/// What the commit protocol needs from a finished overlay.
#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    pub(crate) ops: Vec<Op>,
    pub(crate) containers: BTreeSet<ContainerId>,
    pub(crate) deleted_members: Vec<MemberId>,
    pub(crate) deleted_containers: Vec<ContainerId>,
    pub(crate) referenced_members: Vec<MemberId>,
    pub(crate) member_names: Vec<String>,
    pub(crate) container_names: Vec<String>,
}

impl Overlay {
    fn into_write_set(self) -> WriteSet {
        let containers = self
            .memberships
            .keys()
            .chain(self.containers.keys())
            .copied()
            .collect();
        let deleted_members = self
            .members
            .iter()
            .filter(|(_, slot)| slot.is_none())
            .map(|(id, _)| *id)
            .collect();
        let deleted_containers = self
            .containers
            .iter()
            .filter(|(_, slot)| slot.is_none())
            .map(|(id, _)| *id)
            .collect();
        let mut referenced_members: Vec<MemberId> = self
            .memberships
            .values()
            .flat_map(|slots| slots.iter())
            .filter(|(_, position)| position.is_some())
            .map(|(member, _)| *member)
            .filter(|member| !self.members.contains_key(member))
            .collect();
        referenced_members.sort_unstable();
        referenced_members.dedup();
        let member_names = self
            .member_names
            .into_iter()
            .filter_map(|(name, slot)| slot.map(|_| name))
            .collect();
        let container_names = self
            .container_names
            .into_iter()
            .filter_map(|(name, slot)| slot.map(|_| name))
            .collect();

        WriteSet {
            ops: self.ops,
            containers,
            deleted_members,
            deleted_containers,
            referenced_members,
            member_names,
            container_names,
        }
    }
}

/// Atomic unit of work against a [`Store`].
///
/// Reads see the snapshot taken at begin plus this transaction's own writes.
/// Writes stay private until [`Transaction::commit`]. Dropping an open
/// transaction aborts it.
pub struct Transaction<'s> {
    store: &'s Store,
    id: TxnId,
    mode: CheckMode,
    state: TxnState,
    snapshot: Arc<StoreState>,
    overlay: Overlay,
    session: Option<&'s AtomicBool>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(
        store: &'s Store,
        id: TxnId,
        mode: CheckMode,
        snapshot: Arc<StoreState>,
        session: Option<&'s AtomicBool>,
    ) -> Self {
        tracing::debug!(txn_id = id, ?mode, snapshot_seq = snapshot.seq(), "transaction opened");
        Self {
            store,
            id,
            mode,
            state: TxnState::Open,
            snapshot,
            overlay: Overlay::default(),
            session,
        }
    }

    /// Transaction identifier.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Constraint-check mode in force.
    pub fn mode(&self) -> CheckMode {
        self.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Commit sequence of the snapshot this transaction reads from.
    pub fn snapshot_seq(&self) -> CommitSeq {
        self.snapshot.seq()
    }

    /// Number of mutations recorded so far.
    pub fn pending_ops(&self) -> usize {
        self.overlay.ops.len()
    }

    /// Looks up a member visible to this transaction.
    pub fn member<'k>(&self, key: impl Into<MemberKey<'k>>) -> StoreResult<Member> {
        self.ensure_open()?;
        self.read_member(key.into())
    }

    /// Looks up a container visible to this transaction.
    pub fn container<'k>(&self, key: impl Into<ContainerKey<'k>>) -> StoreResult<Container> {
        self.ensure_open()?;
        self.read_container(key.into())
    }

    /// All visible containers, ascending by name.
    pub fn list_containers(&self) -> StoreResult<Vec<Container>> {
        self.ensure_open()?;
        Ok(self.all_containers())
    }

    /// Members of `container` ascending by position, including uncommitted writes.
    pub fn list_ordered<'k>(&self, container: impl Into<ContainerKey<'k>>) -> StoreResult<OrderedIter> {
        self.ensure_open()?;
        self.ordered(container.into())
    }

    /// Resolves the membership of `member` in `container`.
    pub fn resolve_membership<'a, 'b>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
    ) -> StoreResult<MembershipRef> {
        self.ensure_open()?;
        self.membership(container.into(), member.into())
    }

    /// Creates a member; fails with `DuplicateName` if the name is visible.
    pub fn create_member(&mut self, name: impl Into<String>, text: impl Into<String>) -> StoreResult<MemberId> {
        let (name, text) = (name.into(), text.into());
        self.mutate(|txn| {
            if txn.member_id_by_name(&name).is_some() {
                return Err(StoreError::DuplicateName(format!("member '{name}'")));
            }
            let member = Member {
                id: txn.store.allocate_member_id(),
                name,
                text,
            };
            let id = member.id;
            txn.overlay.member_names.insert(member.name.clone(), Some(id));
            txn.overlay.members.insert(id, Some(member.clone()));
            txn.overlay.ops.push(Op::CreateMember { member });
            Ok(id)
        })
    }

    /// Creates a container; fails with `DuplicateName` if the name is visible.
    pub fn create_container(&mut self, name: impl Into<String>) -> StoreResult<ContainerId> {
        let name = name.into();
        self.mutate(|txn| {
            if txn.container_id_by_name(&name).is_some() {
                return Err(StoreError::DuplicateName(format!("container '{name}'")));
            }
            let container = Container {
                id: txn.store.allocate_container_id(),
                name,
            };
            let id = container.id;
            txn.overlay
                .container_names
                .insert(container.name.clone(), Some(id));
            txn.overlay.containers.insert(id, Some(container.clone()));
            txn.overlay.ops.push(Op::CreateContainer { container });
            Ok(id)
        })
    }

    /// Places `member` in `container` at `position`.
    pub fn add_membership<'a, 'b>(
        &mut self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
        position: Position,
    ) -> StoreResult<()> {
        let (container, member) = (container.into(), member.into());
        self.mutate(|txn| {
            let c = txn.resolve_container(container)?;
            let m = txn.resolve_member(member)?;
            if txn.position_of(c, m).is_some() {
                return Err(StoreError::DuplicateName(format!("{member} in {container}")));
            }
            txn.write_slot(c, m, Some(position));
            txn.overlay.ops.push(Op::AddMembership {
                membership: Membership {
                    container: c,
                    member: m,
                    position,
                },
            });
            txn.check_immediate(c)
        })
    }

    /// Moves an existing membership to `position`.
    pub fn set_position<'a, 'b>(
        &mut self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
        position: Position,
    ) -> StoreResult<()> {
        let (container, member) = (container.into(), member.into());
        self.mutate(|txn| {
            let current = txn.membership(container, member)?;
            if current.position == position {
                return Ok(());
            }
            txn.record_move(current, position);
            txn.check_immediate(current.container)
        })
    }

    /// Removes `member` from `container`.
    pub fn remove_membership<'a, 'b>(
        &mut self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
    ) -> StoreResult<()> {
        let (container, member) = (container.into(), member.into());
        self.mutate(|txn| {
            let current = txn.membership(container, member)?;
            txn.write_slot(current.container, current.member, None);
            txn.overlay.ops.push(Op::RemoveMembership {
                container: current.container,
                member: current.member,
            });
            Ok(())
        })
    }

    /// Exchanges the positions of two members of one container.
    ///
    /// Only valid under [`CheckMode::Deferred`]: the first of the two writes always
    /// duplicates the other member's position until the second lands.
    pub fn swap<'a, 'b, 'c>(
        &mut self,
        container: impl Into<ContainerKey<'a>>,
        member_a: impl Into<MemberKey<'b>>,
        member_b: impl Into<MemberKey<'c>>,
    ) -> StoreResult<()> {
        let (container, member_a, member_b) = (container.into(), member_a.into(), member_b.into());
        self.mutate(|txn| {
            if txn.mode == CheckMode::Immediate {
                return Err(StoreError::InvalidState(
                    "swap requires deferred constraint checking".to_string(),
                ));
            }
            let a = txn.membership(container, member_a)?;
            let b = txn.membership(container, member_b)?;
            if a.position == b.position {
                return Ok(());
            }
            tracing::trace!(
                txn_id = txn.id,
                container = %a.container,
                a = %a.member,
                b = %b.member,
                "swapping positions {} and {}",
                a.position,
                b.position
            );
            txn.record_move(a, b.position);
            txn.record_move(b, a.position);
            Ok(())
        })
    }

    /// Deletes a container together with all of its memberships.
    pub fn delete_container<'k>(&mut self, container: impl Into<ContainerKey<'k>>) -> StoreResult<()> {
        let container = container.into();
        self.mutate(|txn| {
            let existing = txn.read_container(container)?;
            txn.overlay.container_names.insert(existing.name, None);
            txn.overlay.containers.insert(existing.id, None);
            txn.overlay.ops.push(Op::DeleteContainer { id: existing.id });
            Ok(())
        })
    }

    /// Deletes a member and every membership that references it.
    pub fn delete_member<'k>(&mut self, member: impl Into<MemberKey<'k>>) -> StoreResult<()> {
        let member = member.into();
        self.mutate(|txn| {
            let existing = txn.read_member(member)?;
            for container in txn.member_containers(existing.id) {
                txn.write_slot(container, existing.id, None);
            }
            txn.overlay.member_names.insert(existing.name, None);
            txn.overlay.members.insert(existing.id, None);
            txn.overlay.ops.push(Op::DeleteMember { id: existing.id });
            Ok(())
        })
    }

    /// Validates and publishes every recorded mutation atomically.
    ///
    /// Fails with `Conflict` when a concurrent commit wrote a touched container, or
    /// with `ConstraintViolation` when any touched container ends with two members
    /// at one position. On failure nothing is published and the transaction is
    /// aborted.
    pub fn commit(&mut self) -> StoreResult<CommitSeq> {
        self.ensure_open()?;
        self.state = TxnState::Committing;
        let write_set = std::mem::take(&mut self.overlay).into_write_set();
        match self.store.commit(self.id, self.snapshot.seq(), write_set) {
            Ok(seq) => {
                self.state = TxnState::Committed(seq);
                self.release_session();
                Ok(seq)
            }
            Err(err) => {
                tracing::debug!(txn_id = self.id, error = %err, "commit rejected");
                self.state = TxnState::Aborting;
                self.finish_abort();
                Err(err)
            }
        }
    }

    /// Discards every recorded mutation. No-op unless the transaction is open.
    pub fn abort(&mut self) {
        if self.state == TxnState::Open {
            tracing::debug!(txn_id = self.id, ops = self.overlay.ops.len(), "transaction aborted");
            self.state = TxnState::Aborting;
            self.finish_abort();
        }
    }

    fn finish_abort(&mut self) {
        self.overlay = Overlay::default();
        self.state = TxnState::Aborted;
        self.release_session();
    }

    fn release_session(&mut self) {
        if let Some(flag) = self.session.take() {
            flag.store(false, Ordering::Release);
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        match self.state {
            TxnState::Open => Ok(()),
            other => Err(StoreError::InvalidState(format!(
                "transaction {} is {other:?}",
                self.id
            ))),
        }
    }

    /// Runs a mutation; any error discards the overlay and aborts.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut Self) -> StoreResult<T>) -> StoreResult<T> {
        self.ensure_open()?;
        let res = f(self);
        if let Err(err) = &res {
            tracing::debug!(txn_id = self.id, error = %err, "mutation failed; aborting");
            self.state = TxnState::Aborting;
            self.finish_abort();
        }
        res
    }

    fn record_move(&mut self, current: MembershipRef, position: Position) {
        self.write_slot(current.container, current.member, Some(position));
        self.overlay.ops.push(Op::SetPosition {
            container: current.container,
            member: current.member,
            position,
            prev: current.position,
        });
    }

    fn write_slot(&mut self, container: ContainerId, member: MemberId, position: Option<Position>) {
        self.overlay
            .memberships
            .entry(container)
            .or_default()
            .insert(member, position);
    }

    fn check_immediate(&self, container: ContainerId) -> StoreResult<()> {
        if self.mode != CheckMode::Immediate {
            return Ok(());
        }
        ConstraintChecker::check_container(container, self.container_entries(container))
            .map_err(StoreError::ConstraintViolation)
    }

    fn member_containers(&self, member: MemberId) -> BTreeSet<ContainerId> {
        let mut out: BTreeSet<ContainerId> = self.snapshot.containers_of(member).collect();
        for (container, slots) in &self.overlay.memberships {
            match slots.get(&member) {
                Some(Some(_)) => {
                    out.insert(*container);
                }
                Some(None) => {
                    out.remove(container);
                }
                None => {}
            }
        }
        out.retain(|c| self.container_by_id(*c).is_some());
        out
    }
}

impl StateView for Transaction<'_> {
    fn member_by_id(&self, id: MemberId) -> Option<&Member> {
        match self.overlay.members.get(&id) {
            Some(slot) => slot.as_ref(),
            None => self.snapshot.member_by_id(id),
        }
    }

    fn member_id_by_name(&self, name: &str) -> Option<MemberId> {
        match self.overlay.member_names.get(name) {
            Some(slot) => *slot,
            None => self.snapshot.member_id_by_name(name),
        }
    }

    fn container_by_id(&self, id: ContainerId) -> Option<&Container> {
        match self.overlay.containers.get(&id) {
            Some(slot) => slot.as_ref(),
            None => self.snapshot.container_by_id(id),
        }
    }

    fn container_id_by_name(&self, name: &str) -> Option<ContainerId> {
        match self.overlay.container_names.get(name) {
            Some(slot) => *slot,
            None => self.snapshot.container_id_by_name(name),
        }
    }

    fn position_of(&self, container: ContainerId, member: MemberId) -> Option<Position> {
        self.container_by_id(container)?;
        self.member_by_id(member)?;
        match self
            .overlay
            .memberships
            .get(&container)
            .and_then(|slots| slots.get(&member))
        {
            Some(slot) => *slot,
            None => self.snapshot.position_of(container, member),
        }
    }

    fn container_entries(&self, container: ContainerId) -> Vec<(MemberId, Position)> {
        if self.container_by_id(container).is_none() {
            return Vec::new();
        }
        let slots = self.overlay.memberships.get(&container);
        let mut out: Vec<(MemberId, Position)> = self
            .snapshot
            .container_entries(container)
            .into_iter()
            .filter(|(member, _)| slots.is_none_or(|s| !s.contains_key(member)))
            .collect();
        if let Some(slots) = slots {
            out.extend(
                slots
                    .iter()
                    .filter_map(|(member, position)| position.map(|p| (*member, p))),
            );
        }
        out
    }

    fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: BTreeSet<ContainerId> = self.snapshot.container_ids().into_iter().collect();
        for (id, slot) in &self.overlay.containers {
            if slot.is_some() {
                ids.insert(*id);
            } else {
                ids.remove(id);
            }
        }
        ids.into_iter().collect()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A logical session: at most one open transaction at a time.
pub struct Session<'s> {
    store: &'s Store,
    active: AtomicBool,
}

impl<'s> Session<'s> {
    pub(crate) fn new(store: &'s Store) -> Self {
        Self {
            store,
            active: AtomicBool::new(false),
        }
    }

    /// Opens a deferred-mode transaction.
    pub fn begin(&self) -> StoreResult<Transaction<'_>> {
        self.begin_with(CheckMode::Deferred)
    }

    /// Opens a transaction; fails with `InvalidState` while another is open.
    pub fn begin_with(&self, mode: CheckMode) -> StoreResult<Transaction<'_>> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(StoreError::InvalidState(
                "session already has an open transaction".to_string(),
            ));
        }
        Ok(self.store.open_transaction(mode, Some(&self.active)))
    }

    /// True while a transaction of this session is open.
    pub fn has_open_transaction(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
