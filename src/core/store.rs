use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    model::{Container, Member, MembershipRef},
    op::{Op, StoredCommit},
    types::{CheckMode, CommitSeq, ContainerId, ContainerKey, MemberId, MemberKey, Position, TxnId, now_ms},
};

use super::{
    checker::ConstraintChecker,
    error::{StoreError, StoreResult},
    state::{StoreSnapshotV1, StoreState},
    txn::{Session, Transaction, WriteSet},
    view::{OrderedIter, StateView},
};

/// Shared ordered-collection store.
///
/// Readers and transactions work from immutable `Arc<StoreState>` snapshots; the
/// commit lock serializes validation and publication of new states.
#[derive(Debug)]
pub struct Store {
    state: RwLock<Arc<StoreState>>,
    commit_lock: Mutex<()>,
    pending: Mutex<VecDeque<StoredCommit>>,
    next_member_id: AtomicU64,
    next_container_id: AtomicU64,
    next_txn_id: AtomicU64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Empty store; ids start at 1.
    pub fn new() -> Self {
        Self::from_state(StoreState::default(), 1, 1)
    }

    /// Restores a store from a snapshot. Id counters resume past every id it holds.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> StoreResult<Self> {
        let (next_member_id, next_container_id) =
            (snapshot.next_member_id, snapshot.next_container_id);
        let state = StoreState::from_snapshot(snapshot)?;
        let next_member_id = next_member_id.max(state.max_member_id() + 1);
        let next_container_id = next_container_id.max(state.max_container_id() + 1);
        Ok(Self::from_state(state, next_member_id, next_container_id))
    }

    fn from_state(state: StoreState, next_member_id: u64, next_container_id: u64) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
            commit_lock: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            next_member_id: AtomicU64::new(next_member_id),
            next_container_id: AtomicU64::new(next_container_id),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Full image of the latest committed state.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let _guard = self.commit_lock.lock();
        self.current().to_snapshot(
            self.next_member_id.load(Ordering::SeqCst),
            self.next_container_id.load(Ordering::SeqCst),
        )
    }

    /// Sequence of the latest published commit.
    pub fn latest_seq(&self) -> CommitSeq {
        self.current().seq()
    }

    /// Opens a deferred-mode transaction.
    pub fn begin(&self) -> Transaction<'_> {
        self.open_transaction(CheckMode::Deferred, None)
    }

    /// Opens a transaction in `mode`.
    pub fn begin_with(&self, mode: CheckMode) -> Transaction<'_> {
        self.open_transaction(mode, None)
    }

    /// Creates a session that allows one open transaction at a time.
    pub fn session(&self) -> Session<'_> {
        Session::new(self)
    }

    /// Runs `f` in a fresh transaction and commits it; aborts if `f` fails.
    pub fn transact<T, F>(&self, mode: CheckMode, f: F) -> StoreResult<(T, CommitSeq)>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<T>,
    {
        let mut txn = self.begin_with(mode);
        let out = f(&mut txn)?;
        let seq = txn.commit()?;
        Ok((out, seq))
    }

    /// Autocommitted [`Transaction::create_member`].
    pub fn create_member(&self, name: impl Into<String>, text: impl Into<String>) -> StoreResult<MemberId> {
        self.autocommit(|txn| txn.create_member(name, text))
    }

    /// Autocommitted [`Transaction::create_container`].
    pub fn create_container(&self, name: impl Into<String>) -> StoreResult<ContainerId> {
        self.autocommit(|txn| txn.create_container(name))
    }

    /// Autocommitted [`Transaction::add_membership`].
    pub fn add_membership<'a, 'b>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
        position: Position,
    ) -> StoreResult<()> {
        self.autocommit(|txn| txn.add_membership(container, member, position))
    }

    /// Autocommitted [`Transaction::set_position`].
    pub fn set_position<'a, 'b>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
        position: Position,
    ) -> StoreResult<()> {
        self.autocommit(|txn| txn.set_position(container, member, position))
    }

    /// Autocommitted [`Transaction::remove_membership`].
    pub fn remove_membership<'a, 'b>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
    ) -> StoreResult<()> {
        self.autocommit(|txn| txn.remove_membership(container, member))
    }

    /// Swaps two members' positions in a single deferred-mode transaction.
    pub fn swap<'a, 'b, 'c>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member_a: impl Into<MemberKey<'b>>,
        member_b: impl Into<MemberKey<'c>>,
    ) -> StoreResult<CommitSeq> {
        self.transact(CheckMode::Deferred, |txn| txn.swap(container, member_a, member_b))
            .map(|((), seq)| seq)
    }

    /// Autocommitted [`Transaction::delete_container`].
    pub fn delete_container<'k>(&self, container: impl Into<ContainerKey<'k>>) -> StoreResult<()> {
        self.autocommit(|txn| txn.delete_container(container))
    }

    /// Autocommitted [`Transaction::delete_member`].
    pub fn delete_member<'k>(&self, member: impl Into<MemberKey<'k>>) -> StoreResult<()> {
        self.autocommit(|txn| txn.delete_member(member))
    }

    /// Latest committed listing of `container`, ascending by position.
    pub fn list_ordered<'k>(&self, container: impl Into<ContainerKey<'k>>) -> StoreResult<OrderedIter> {
        self.current().ordered(container.into())
    }

    /// Latest committed membership of `member` in `container`.
    pub fn resolve_membership<'a, 'b>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
    ) -> StoreResult<MembershipRef> {
        self.current().membership(container.into(), member.into())
    }

    /// Latest committed member by id or name.
    pub fn member<'k>(&self, key: impl Into<MemberKey<'k>>) -> StoreResult<Member> {
        self.current().read_member(key.into())
    }

    /// Latest committed container by id or name.
    pub fn container<'k>(&self, key: impl Into<ContainerKey<'k>>) -> StoreResult<Container> {
        self.current().read_container(key.into())
    }

    /// Committed containers, ascending by name.
    pub fn list_containers(&self) -> Vec<Container> {
        self.current().all_containers()
    }

    /// Takes every commit not yet handed to a journal, in sequence order.
    pub fn drain_pending_commits(&self) -> Vec<StoredCommit> {
        self.pending.lock().drain(..).collect()
    }

    /// Puts commits back at the front of the pending queue.
    pub fn requeue_pending(&self, commits: Vec<StoredCommit>) {
        let mut pending = self.pending.lock();
        for commit in commits.into_iter().rev() {
            pending.push_front(commit);
        }
    }

    /// Number of commits waiting for a journal.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Re-applies a journaled commit at its original sequence.
    pub fn apply_replayed_commit(&self, commit: StoredCommit) -> StoreResult<()> {
        let _guard = self.commit_lock.lock();
        let current = self.current();
        if commit.seq <= current.seq() {
            return Ok(());
        }
        let mut next = (*current).clone();
        for op in &commit.ops {
            next.apply(op, commit.seq)?;
            self.observe_ids(op);
        }
        next.set_seq(commit.seq);
        self.next_txn_id.fetch_max(commit.txn_id + 1, Ordering::SeqCst);
        *self.state.write() = Arc::new(next);
        Ok(())
    }

    pub(crate) fn open_transaction<'a>(
        &'a self,
        mode: CheckMode,
        session: Option<&'a AtomicBool>,
    ) -> Transaction<'a> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction::new(self, id, mode, self.current(), session)
    }

    pub(crate) fn allocate_member_id(&self) -> MemberId {
        MemberId(self.next_member_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn allocate_container_id(&self) -> ContainerId {
        ContainerId(self.next_container_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Validates `write_set` against the latest state, applies it, checks position
    /// uniqueness over the touched containers, and publishes the result.
    pub(crate) fn commit(
        &self,
        txn_id: TxnId,
        snapshot_seq: CommitSeq,
        write_set: WriteSet,
    ) -> StoreResult<CommitSeq> {
        let _guard = self.commit_lock.lock();
        let current = self.current();
        if write_set.ops.is_empty() {
            return Ok(current.seq());
        }

        validate(&current, snapshot_seq, &write_set).inspect_err(|err| {
            tracing::debug!(txn_id, snapshot_seq, latest = current.seq(), error = %err, "commit conflict");
        })?;

        let seq = current.seq() + 1;
        let mut next = (*current).clone();
        for op in &write_set.ops {
            next.apply(op, seq)
                .map_err(|err| StoreError::Conflict(format!("commit replay failed: {err}")))?;
        }

        let live: std::collections::BTreeSet<ContainerId> = write_set
            .containers
            .iter()
            .copied()
            .filter(|c| next.container_by_id(*c).is_some())
            .collect();
        ConstraintChecker::check_containers(&live, |c| next.container_entries(c))
            .map_err(StoreError::ConstraintViolation)?;

        next.set_seq(seq);
        *self.state.write() = Arc::new(next);
        tracing::debug!(txn_id, seq, ops = write_set.ops.len(), containers = live.len(), "transaction committed");

        self.pending.lock().push_back(StoredCommit {
            seq,
            ts_ms: now_ms(),
            txn_id,
            ops: write_set.ops,
        });
        Ok(seq)
    }

    fn current(&self) -> Arc<StoreState> {
        Arc::clone(&self.state.read())
    }

    fn observe_ids(&self, op: &Op) {
        match op {
            Op::CreateMember { member } => {
                self.next_member_id.fetch_max(member.id.0 + 1, Ordering::SeqCst);
            }
            Op::CreateContainer { container } => {
                self.next_container_id
                    .fetch_max(container.id.0 + 1, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    fn autocommit<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> StoreResult<T>) -> StoreResult<T> {
        self.transact(CheckMode::Deferred, f).map(|(out, _)| out)
    }
}

/// First-committer-wins checks of a write set against the latest committed state.
fn validate(current: &StoreState, snapshot_seq: CommitSeq, ws: &WriteSet) -> StoreResult<()> {
    for container in &ws.containers {
        if current.container_version(*container) > snapshot_seq {
            return Err(StoreError::Conflict(format!(
                "{container} changed since snapshot {snapshot_seq}"
            )));
        }
    }

    for member in ws.referenced_members.iter().chain(&ws.deleted_members) {
        if current.member_version(*member) > snapshot_seq {
            return Err(StoreError::Conflict(format!(
                "{member} changed since snapshot {snapshot_seq}"
            )));
        }
    }

    for member in &ws.deleted_members {
        if let Some(container) = current
            .containers_of(*member)
            .find(|c| current.container_version(*c) > snapshot_seq)
        {
            return Err(StoreError::Conflict(format!(
                "{container} gained or moved {member} since snapshot {snapshot_seq}"
            )));
        }
    }

    for name in &ws.member_names {
        if let Some(existing) = current.member_id_by_name(name) {
            if !ws.deleted_members.contains(&existing) {
                return Err(StoreError::Conflict(format!("member '{name}' created concurrently")));
            }
        }
    }

    for name in &ws.container_names {
        if let Some(existing) = current.container_id_by_name(name) {
            if !ws.deleted_containers.contains(&existing) {
                return Err(StoreError::Conflict(format!(
                    "container '{name}' created concurrently"
                )));
            }
        }
    }

    Ok(())
}
