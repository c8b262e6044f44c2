//! In-memory fork-capable provider
//!
//! States are held behind `Arc` and copied on first write, so creating a
//! fork or a snapshot never copies data. Each fork may have one open
//! transaction: `Begin` stages a private copy, `Commit` publishes it,
//! `Rollback` discards it. Snapshots and diffs only ever see committed data.

use crate::faults::{Fault, FaultPlan, ProviderOp};
use crate::state::DatabaseState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use timelines_core::{
    DataRef, ForkRef, ProviderError, ProviderResult, Query, QueryResult, RawDiff, Row,
    SnapshotRef, StorageProvider,
};
use tracing::debug;

#[derive(Debug)]
struct ForkState {
    committed: Arc<DatabaseState>,
    staged: Option<DatabaseState>,
}

#[derive(Debug, Default)]
struct Inner {
    base: Arc<DatabaseState>,
    forks: HashMap<ForkRef, ForkState>,
    snapshots: HashMap<SnapshotRef, Arc<DatabaseState>>,
    calls: HashMap<ProviderOp, usize>,
    next_handle: u64,
}

impl Inner {
    fn resolve(&self, source: &DataRef) -> ProviderResult<Arc<DatabaseState>> {
        match source {
            DataRef::Base => Ok(Arc::clone(&self.base)),
            DataRef::Fork(fork) => self
                .forks
                .get(fork)
                .map(|f| Arc::clone(&f.committed))
                .ok_or_else(|| ProviderError::not_found(format!("fork {}", fork))),
            DataRef::Snapshot(snap) => self
                .snapshots
                .get(snap)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(format!("snapshot {}", snap))),
        }
    }

    fn fork_mut(&mut self, fork: &ForkRef) -> ProviderResult<&mut ForkState> {
        self.forks
            .get_mut(fork)
            .ok_or_else(|| ProviderError::not_found(format!("fork {}", fork)))
    }

    fn handle(&mut self, prefix: &str) -> String {
        self.next_handle += 1;
        format!("{}-{}", prefix, self.next_handle)
    }
}

/// In-memory `StorageProvider`
///
/// Thread safety: all state sits behind one `parking_lot::Mutex` that is
/// never held across an `.await`.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    faults: FaultPlan,
    latency: Option<Duration>,
}

impl MemoryProvider {
    /// Create a provider whose base state is empty
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider whose base state is `base`
    pub fn with_base(base: DatabaseState) -> Self {
        let provider = Self::new();
        provider.inner.lock().base = Arc::new(base);
        provider
    }

    /// Add a fixed delay to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fault plan consulted at the start of every call
    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Number of calls made to `op`, including faulted ones
    pub fn calls(&self, op: ProviderOp) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of live forks
    pub fn live_forks(&self) -> usize {
        self.inner.lock().forks.len()
    }

    /// Number of snapshots taken
    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    /// Check whether a fork is live, bypassing faults and call counters
    pub fn is_live(&self, fork: &ForkRef) -> bool {
        self.inner.lock().forks.contains_key(fork)
    }

    /// Make a fork disappear as if the provider reclaimed it
    pub fn discard_fork(&self, fork: &ForkRef) -> bool {
        self.inner.lock().forks.remove(fork).is_some()
    }

    /// Committed contents of a fork
    pub fn fork_state(&self, fork: &ForkRef) -> Option<DatabaseState> {
        self.inner
            .lock()
            .forks
            .get(fork)
            .map(|f| f.committed.as_ref().clone())
    }

    /// Contents captured by a snapshot
    pub fn snapshot_state(&self, snapshot: &SnapshotRef) -> Option<DatabaseState> {
        self.inner
            .lock()
            .snapshots
            .get(snapshot)
            .map(|s| s.as_ref().clone())
    }

    /// Read one committed row from a fork
    pub fn read_row(&self, fork: &ForkRef, table: &str, key: &str) -> Option<Row> {
        self.inner
            .lock()
            .forks
            .get(fork)
            .and_then(|f| f.committed.row(table, key).cloned())
    }

    /// Check whether a fork has an open transaction
    pub fn has_open_transaction(&self, fork: &ForkRef) -> bool {
        self.inner
            .lock()
            .forks
            .get(fork)
            .map(|f| f.staged.is_some())
            .unwrap_or(false)
    }

    /// Count the call, apply latency and any scheduled fault
    async fn enter(&self, op: ProviderOp) -> ProviderResult<()> {
        *self.inner.lock().calls.entry(op).or_insert(0) += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.faults.take(op) {
            Some(Fault::Fail(err)) => {
                debug!(target: "timelines::memory", op = %op, error = %err, "Injected failure");
                Err(err)
            }
            Some(Fault::Delay(delay)) => {
                debug!(target: "timelines::memory", op = %op, ?delay, "Injected delay");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    async fn create_fork(&self, source: &DataRef) -> ProviderResult<ForkRef> {
        self.enter(ProviderOp::CreateFork).await?;
        let mut inner = self.inner.lock();
        let committed = inner.resolve(source)?;
        let fork = ForkRef::new(inner.handle("fork"));
        inner.forks.insert(
            fork.clone(),
            ForkState {
                committed,
                staged: None,
            },
        );
        debug!(target: "timelines::memory", fork = %fork, source = %source, "Created fork");
        Ok(fork)
    }

    async fn drop_fork(&self, fork: &ForkRef) -> ProviderResult<()> {
        self.enter(ProviderOp::DropFork).await?;
        self.inner
            .lock()
            .forks
            .remove(fork)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(format!("fork {}", fork)))?;
        debug!(target: "timelines::memory", fork = %fork, "Dropped fork");
        Ok(())
    }

    async fn snapshot_fork(&self, fork: &ForkRef) -> ProviderResult<SnapshotRef> {
        self.enter(ProviderOp::SnapshotFork).await?;
        let mut inner = self.inner.lock();
        let committed = inner.resolve(&DataRef::Fork(fork.clone()))?;
        let snapshot = SnapshotRef::new(inner.handle("snap"));
        inner.snapshots.insert(snapshot.clone(), committed);
        debug!(target: "timelines::memory", fork = %fork, snapshot = %snapshot, "Snapshotted fork");
        Ok(snapshot)
    }

    async fn execute(&self, fork: &ForkRef, query: &Query) -> ProviderResult<QueryResult> {
        self.enter(ProviderOp::Execute).await?;
        let mut inner = self.inner.lock();
        let state = inner.fork_mut(fork)?;
        match query {
            Query::Begin => {
                if state.staged.is_some() {
                    return Err(ProviderError::permanent("transaction already open"));
                }
                state.staged = Some(state.committed.as_ref().clone());
                Ok(QueryResult::default())
            }
            Query::Commit => {
                let staged = state
                    .staged
                    .take()
                    .ok_or_else(|| ProviderError::permanent("no open transaction"))?;
                state.committed = Arc::new(staged);
                Ok(QueryResult::default())
            }
            Query::Rollback => {
                state
                    .staged
                    .take()
                    .ok_or_else(|| ProviderError::permanent("no open transaction"))?;
                Ok(QueryResult::default())
            }
            _ => match state.staged.as_mut() {
                Some(staged) => staged.apply(query),
                None => Arc::make_mut(&mut state.committed).apply(query),
            },
        }
    }

    async fn diff_data(&self, from: &DataRef, to: &DataRef) -> ProviderResult<RawDiff> {
        self.enter(ProviderOp::DiffData).await?;
        let (a, b) = {
            let inner = self.inner.lock();
            (inner.resolve(from)?, inner.resolve(to)?)
        };
        if Arc::ptr_eq(&a, &b) {
            return Ok(RawDiff::default());
        }
        Ok(a.diff(&b))
    }

    async fn fork_exists(&self, fork: &ForkRef) -> ProviderResult<bool> {
        self.enter(ProviderOp::ForkExists).await?;
        Ok(self.inner.lock().forks.contains_key(fork))
    }
}
