use std::{collections::VecDeque, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};

use crate::{
    core::{
        error::StoreError,
        state::StoreSnapshotV1,
        store::Store,
        txn::Transaction,
    },
    model::{MembershipRef, OrderedEntry},
    op::StoredCommit,
    persist::{CommitSink, PersistError},
    types::{CheckMode, CommitSeq, ContainerKey, MemberKey},
};

use super::events::StoreEvent;

/// Failure surfaced by [`StoreHandle`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The transaction itself failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Journaling failed or its queue is full; the commit is already visible.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The persistence worker is gone.
    #[error("runtime channel closed")]
    ChannelClosed,
}

/// Runtime tuning. Missing fields deserialize to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Append and flush every commit as soon as it arrives.
    pub flush_on_commit: bool,
    /// Largest batch handed to the sink at once.
    pub batch_max_commits: usize,
    /// Longest a buffered commit waits before being appended.
    pub batch_max_latency_ms: u64,
    /// Capacity of the queue between the handle and the worker.
    pub persist_queue_bound: usize,
    /// Automatic checkpoint interval in commits; 0 disables it.
    pub snapshot_every_commits: usize,
    /// Delete journaled commits covered by each checkpoint.
    pub compact_after_snapshot: bool,
    /// Retries of a conflicting transaction before giving up.
    pub max_conflict_retries: u32,
    /// Initial retry delay; doubles per attempt.
    pub retry_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_commit: true,
            batch_max_commits: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_commits: 2000,
            compact_after_snapshot: false,
            max_conflict_retries: 5,
            retry_backoff_ms: 2,
        }
    }
}

#[derive(Debug, Default)]
struct JournalState {
    announced: CommitSeq,
    commits_since_snapshot: usize,
}

/// Cloneable async front end to a shared [`Store`].
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<Store>,
    config: RuntimeConfig,
    events_tx: broadcast::Sender<StoreEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    journal: Arc<Mutex<JournalState>>,
}

enum PersistMsg {
    Commit(StoredCommit),
    Flush {
        resp: oneshot::Sender<Result<CommitSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: StoreSnapshotV1,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
}

/// Wraps `store` in a handle; with a sink, commits are journaled by a background
/// worker. Must be called inside a tokio runtime.
pub fn spawn_store(
    store: Store,
    sink: Option<Box<dyn CommitSink>>,
    config: RuntimeConfig,
) -> StoreHandle {
    let (events_tx, _) = broadcast::channel::<StoreEvent>(1024);

    let persist_tx = sink.map(|sink| {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (durable_tx, mut durable_rx) = mpsc::unbounded_channel::<Result<CommitSeq, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());

        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(durable) = durable_rx.recv().await {
                match durable {
                    Ok(seq) => {
                        let _ = events_tx.send(StoreEvent::DurableUpTo { seq });
                    }
                    Err(err) => tracing::error!(error = %err, "commit journal append failed"),
                }
            }
        });
        persist_tx
    });

    let journal = JournalState {
        announced: store.latest_seq(),
        commits_since_snapshot: 0,
    };

    StoreHandle {
        store: Arc::new(store),
        config,
        events_tx,
        persist_tx,
        journal: Arc::new(Mutex::new(journal)),
    }
}

impl StoreHandle {
    /// The shared store behind this handle.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Subscribes to commit, retry, and durability events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    /// Runs `f` in a fresh transaction and commits it, retrying the whole
    /// transaction on `Conflict` with exponential backoff.
    pub async fn transact<T, F>(&self, mode: CheckMode, mut f: F) -> Result<T, RuntimeError>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut attempt = 0u32;
        loop {
            match self.store.transact(mode, &mut f) {
                Ok((out, _)) => {
                    if self.publish(false).await? {
                        if let Err(err) = self.checkpoint().await {
                            tracing::error!(error = %err, "automatic checkpoint failed");
                        }
                    }
                    return Ok(out);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    let delay = self
                        .config
                        .retry_backoff_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    tracing::warn!(attempt, delay_ms = delay, error = %err, "write conflict; retrying transaction");
                    let _ = self.events_tx.send(StoreEvent::ConflictRetry { attempt });
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Swaps two members' positions, retrying on conflict like [`Self::transact`].
    pub async fn swap<'a, 'b, 'c>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member_a: impl Into<MemberKey<'b>>,
        member_b: impl Into<MemberKey<'c>>,
    ) -> Result<(), RuntimeError> {
        let (container, member_a, member_b) = (container.into(), member_a.into(), member_b.into());
        self.transact(CheckMode::Deferred, |txn| txn.swap(container, member_a, member_b))
            .await
    }

    /// Latest committed members of `container`, ascending by position.
    pub async fn list_ordered<'k>(
        &self,
        container: impl Into<ContainerKey<'k>>,
    ) -> Result<Vec<OrderedEntry>, RuntimeError> {
        Ok(self.store.list_ordered(container)?.collect())
    }

    /// Latest committed membership of `member` in `container`.
    pub async fn resolve_membership<'a, 'b>(
        &self,
        container: impl Into<ContainerKey<'a>>,
        member: impl Into<MemberKey<'b>>,
    ) -> Result<MembershipRef, RuntimeError> {
        Ok(self.store.resolve_membership(container, member)?)
    }

    /// Hands every pending commit to the journal and waits until it is durable.
    pub async fn flush(&self) -> Result<CommitSeq, RuntimeError> {
        self.publish(true).await?;
        let Some(tx) = &self.persist_tx else {
            return Ok(self.store.latest_seq());
        };
        let (resp, rx) = oneshot::channel();
        tx.send(PersistMsg::Flush { resp })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }

    /// Writes a snapshot of the latest committed state to the journal.
    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        self.publish(true).await?;
        let snapshot = self.store.export_snapshot();
        let (resp, rx) = oneshot::channel();
        tx.send(PersistMsg::Checkpoint {
            snapshot,
            compact: self.config.compact_after_snapshot,
            resp,
        })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)??;
        self.journal.lock().await.commits_since_snapshot = 0;
        Ok(())
    }

    /// Journals every outstanding commit and stops the persistence worker.
    ///
    /// Fails with `Persist` when the final append does not go through.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.publish(true).await?;
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        let (resp, rx) = oneshot::channel();
        tx.send(PersistMsg::Shutdown { resp })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }

    /// Announces and enqueues pending commits in sequence order. With `wait` unset a
    /// full queue is reported as an error and the unsent commits stay pending.
    /// Returns true when an automatic checkpoint is due.
    async fn publish(&self, wait: bool) -> Result<bool, RuntimeError> {
        let mut journal = self.journal.lock().await;
        let mut commits: VecDeque<StoredCommit> = self.store.drain_pending_commits().into();
        if commits.is_empty() {
            return Ok(false);
        }

        for commit in &commits {
            if commit.seq > journal.announced {
                journal.announced = commit.seq;
                let _ = self.events_tx.send(StoreEvent::Committed {
                    seq: commit.seq,
                    containers: commit.containers(),
                });
            }
        }

        let Some(tx) = &self.persist_tx else {
            let _ = self.events_tx.send(StoreEvent::DurableUpTo {
                seq: journal.announced,
            });
            return Ok(false);
        };

        while let Some(commit) = commits.pop_front() {
            let permit = if wait {
                tx.reserve().await.map_err(|_| RuntimeError::ChannelClosed)
            } else {
                tx.try_reserve().map_err(|err| {
                    RuntimeError::Persist(PersistError::Message(format!("persist queue error: {err}")))
                })
            };
            match permit {
                Ok(permit) => {
                    permit.send(PersistMsg::Commit(commit));
                    journal.commits_since_snapshot += 1;
                }
                Err(err) => {
                    commits.push_front(commit);
                    self.store.requeue_pending(commits.into());
                    return Err(err);
                }
            }
        }

        Ok(self.config.snapshot_every_commits > 0
            && journal.commits_since_snapshot >= self.config.snapshot_every_commits)
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn CommitSink>,
    rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<CommitSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let worker = JournalWorker {
        sink: Arc::new(Mutex::new(sink)),
        buf: Vec::new(),
        durable: 0,
        durable_tx,
        latency: Duration::from_millis(config.batch_max_latency_ms),
        config,
    };
    tokio::spawn(worker.run(rx));
}

/// Owns the sink on the runtime side; sink calls run on the blocking pool.
struct JournalWorker {
    sink: Arc<Mutex<Box<dyn CommitSink>>>,
    buf: Vec<StoredCommit>,
    durable: CommitSeq,
    durable_tx: mpsc::UnboundedSender<Result<CommitSeq, PersistError>>,
    latency: Duration,
    config: RuntimeConfig,
}

impl JournalWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<PersistMsg>) {
        let mut deadline = Instant::now() + self.latency;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = self.drain(true).await;
                        return;
                    };
                    match msg {
                        PersistMsg::Commit(commit) => {
                            self.buf.push(commit);
                            if self.config.flush_on_commit || self.buf.len() >= self.config.batch_max_commits {
                                let _ = self.drain(true).await;
                            } else {
                                continue;
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = self.drain(true).await.map(|()| self.durable);
                            let _ = resp.send(result);
                        }
                        PersistMsg::Checkpoint { snapshot, compact, resp } => {
                            let _ = resp.send(self.checkpoint(snapshot, compact).await);
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = resp.send(self.drain(true).await);
                            return;
                        }
                    }
                    deadline = Instant::now() + self.latency;
                }
                _ = tokio::time::sleep_until(deadline), if !self.buf.is_empty() => {
                    let _ = self.drain(false).await;
                    deadline = Instant::now() + self.latency;
                }
            }
        }
    }

    async fn with_sink<T, F>(&self, f: F) -> Result<T, PersistError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn CommitSink) -> Result<T, PersistError> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || {
            let mut guard = sink.blocking_lock();
            f(guard.as_mut())
        })
        .await
        .map_err(|err| PersistError::Message(format!("journal task failed: {err}")))?
    }

    /// Appends buffered commits; with `sync` set the sink is flushed as well.
    ///
    /// The buffer is cleared only once the sink accepted it, so a failed append
    /// is retried ahead of later commits and `durable` never skips a sequence.
    async fn drain(&mut self, sync: bool) -> Result<(), PersistError> {
        if !self.buf.is_empty() {
            let batch = self.buf.clone();
            let count = batch.len();
            match self.with_sink(move |sink| sink.append_commits(&batch)).await {
                Ok(seq) => {
                    self.buf.drain(..count);
                    self.durable = self.durable.max(seq);
                    tracing::trace!(count, durable = self.durable, "journal batch appended");
                    let _ = self.durable_tx.send(Ok(self.durable));
                }
                Err(err) => {
                    let first = self.buf.first().map_or(0, |c| c.seq);
                    tracing::warn!(count, first_seq = first, error = %err, "journal append failed; batch kept for retry");
                    let _ = self.durable_tx.send(Err(PersistError::Message(format!(
                        "append of {count} commits from seq {first} failed: {err}"
                    ))));
                    return Err(err);
                }
            }
        }
        if sync {
            self.with_sink(|sink| sink.flush()).await?;
        }
        Ok(())
    }

    async fn checkpoint(&mut self, snapshot: StoreSnapshotV1, compact: bool) -> Result<(), PersistError> {
        self.drain(true).await?;
        self.with_sink(move |sink| {
            sink.write_snapshot(&snapshot)?;
            if compact {
                sink.compact_through(snapshot.seq)?;
            }
            Ok(())
        })
        .await
    }
}
