//! Fork management
//!
//! `ForkManager` is the only component that calls the storage provider.
//! It owns three concerns:
//!
//! - **Call policy**: every provider call runs under the caller's timeout;
//!   transient failures of retry-safe calls are retried with bounded
//!   exponential backoff, everything else surfaces immediately.
//! - **Fork ownership**: a fork exists either in the registry (recorded on
//!   exactly one timeline) or in a `PendingFork` guard that drops it unless
//!   it gets recorded. Abandoning a creation midway (timeout, cancelled
//!   future, failed metadata write) therefore never leaks a fork.
//! - **Checkout / release**: mapping a timeline to its live fork, with
//!   reconciliation of recorded forks the provider no longer has.
//!
//! Callers hold the per-timeline lock for every method that takes a
//! timeline id.

use crate::retry::RetryConfig;
use crate::store::TimelineStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use timelines_core::{
    DataRef, ForkRef, ProviderError, ProviderResult, Query, QueryResult, RawDiff, SnapshotRef,
    StorageProvider, Timeline, TimelineError, TimelineId, TimelineResult,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Pending forks
// ============================================================================

enum PendingState {
    /// Provider call still running in its own task
    Creating(JoinHandle<ProviderResult<ForkRef>>),
    /// Fork exists but no timeline records it yet
    Created(ForkRef),
    /// Recorded, failed, or already handed back
    Settled,
}

/// A fork that is not yet owned by any timeline
///
/// The provider call runs in a spawned task so that it can finish even when
/// the caller stops waiting. Dropping the guard before `into_fork` hands the
/// fork to a background task that drops it.
#[must_use = "an unrecorded fork is dropped again when the guard goes away"]
pub struct PendingFork {
    state: PendingState,
    provider: Arc<dyn StorageProvider>,
}

impl PendingFork {
    fn spawn(provider: Arc<dyn StorageProvider>, source: DataRef) -> Self {
        let task_provider = Arc::clone(&provider);
        let handle = tokio::spawn(async move { task_provider.create_fork(&source).await });
        Self {
            state: PendingState::Creating(handle),
            provider,
        }
    }

    async fn wait(&mut self) -> ProviderResult<()> {
        let joined = match &mut self.state {
            PendingState::Creating(handle) => handle.await,
            PendingState::Created(_) => return Ok(()),
            PendingState::Settled => {
                return Err(ProviderError::permanent("fork creation already settled"))
            }
        };
        match joined {
            Ok(Ok(fork)) => {
                self.state = PendingState::Created(fork);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = PendingState::Settled;
                Err(e)
            }
            Err(join) => {
                self.state = PendingState::Settled;
                Err(ProviderError::permanent(format!(
                    "fork creation task failed: {}",
                    join
                )))
            }
        }
    }

    /// The created fork
    pub fn fork(&self) -> Option<&ForkRef> {
        match &self.state {
            PendingState::Created(fork) => Some(fork),
            _ => None,
        }
    }

    /// Take ownership of the fork; the guard no longer drops it
    pub fn into_fork(mut self) -> Option<ForkRef> {
        match std::mem::replace(&mut self.state, PendingState::Settled) {
            PendingState::Created(fork) => Some(fork),
            _ => None,
        }
    }
}

impl Drop for PendingFork {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut self.state, PendingState::Settled);
        let provider = Arc::clone(&self.provider);
        let reap = match state {
            PendingState::Settled => return,
            PendingState::Created(fork) => {
                warn!(target: "timelines::fork", fork = %fork, "Dropping unrecorded fork");
                ReapTarget::Fork(fork)
            }
            PendingState::Creating(handle) => ReapTarget::Task(handle),
        };

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let fork = match reap {
                        ReapTarget::Fork(fork) => fork,
                        ReapTarget::Task(handle) => match handle.await {
                            Ok(Ok(fork)) => {
                                warn!(
                                    target: "timelines::fork",
                                    fork = %fork,
                                    "Fork finished after its caller gave up; reaping"
                                );
                                fork
                            }
                            _ => return,
                        },
                    };
                    if let Err(e) = provider.drop_fork(&fork).await {
                        if !e.is_not_found() {
                            warn!(
                                target: "timelines::fork",
                                fork = %fork,
                                error = %e,
                                "Failed to reap fork"
                            );
                        }
                    }
                });
            }
            Err(_) => {
                if let ReapTarget::Task(handle) = reap {
                    handle.abort();
                }
            }
        }
    }
}

enum ReapTarget {
    Fork(ForkRef),
    Task(JoinHandle<ProviderResult<ForkRef>>),
}

// ============================================================================
// Transaction guard
// ============================================================================

/// Rolls back an open transaction on a fork unless disarmed
struct OpenTransaction {
    fork: Option<ForkRef>,
    provider: Arc<dyn StorageProvider>,
}

impl OpenTransaction {
    fn disarm(&mut self) {
        self.fork = None;
    }
}

impl Drop for OpenTransaction {
    fn drop(&mut self) {
        let Some(fork) = self.fork.take() else {
            return;
        };
        let provider = Arc::clone(&self.provider);
        if let Ok(runtime) = Handle::try_current() {
            warn!(target: "timelines::fork", fork = %fork, "Rolling back abandoned transaction");
            runtime.spawn(async move {
                if let Err(e) = provider.execute(&fork, &Query::Rollback).await {
                    warn!(target: "timelines::fork", fork = %fork, error = %e, "Rollback failed");
                }
            });
        }
    }
}

// ============================================================================
// ForkManager
// ============================================================================

/// Provider gateway and timeline ⇄ fork mapping
///
/// Cheap to clone; clones share the provider and store.
#[derive(Clone)]
pub struct ForkManager {
    provider: Arc<dyn StorageProvider>,
    store: Arc<TimelineStore>,
    retry: RetryConfig,
    metadata_write_attempts: usize,
    timeout: Duration,
}

impl std::fmt::Debug for ForkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkManager")
            .field("retry", &self.retry)
            .field("metadata_write_attempts", &self.metadata_write_attempts)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ForkManager {
    /// Create a fork manager
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        store: Arc<TimelineStore>,
        retry: RetryConfig,
        metadata_write_attempts: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            retry,
            metadata_write_attempts: metadata_write_attempts.max(1),
            timeout,
        }
    }

    /// Same manager with a different per-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one provider operation under the call policy
    ///
    /// `f` is invoked once per attempt. Only transient failures of
    /// `retryable` operations are retried.
    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        timeline: TimelineId,
        retryable: bool,
        mut f: F,
    ) -> TimelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let attempts = if retryable { self.retry.attempts() } else { 1 };
        let mut attempt = 0;
        loop {
            let outcome = tokio::time::timeout(self.timeout, f()).await;
            attempt += 1;
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => {
                    warn!(
                        target: "timelines::fork",
                        operation,
                        timeline_id = %timeline,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Provider call timed out"
                    );
                    return Err(TimelineError::ProviderTimeout {
                        operation,
                        timeline,
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
            };

            if !err.is_transient() {
                return Err(TimelineError::ProviderError {
                    operation,
                    timeline,
                    message: err.to_string(),
                });
            }
            if attempt >= attempts {
                return Err(TimelineError::ProviderUnavailable {
                    operation,
                    timeline,
                    attempts: attempt,
                    message: err.message,
                });
            }

            let delay = self.retry.calculate_delay(attempt - 1);
            warn!(
                target: "timelines::fork",
                operation,
                timeline_id = %timeline,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient provider failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run a metadata write, retrying write failures
    ///
    /// Validation errors are returned on the first occurrence.
    pub(crate) async fn write_metadata<T>(
        &self,
        mut write: impl FnMut() -> TimelineResult<T>,
    ) -> TimelineResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match write() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_metadata_write() && attempt < self.metadata_write_attempts => {
                    warn!(
                        target: "timelines::fork",
                        attempt,
                        error = %e,
                        "Metadata write failed, retrying"
                    );
                    tokio::time::sleep(self.retry.calculate_delay(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Create a fork of `source` for `timeline`, not yet recorded anywhere
    pub(crate) async fn provision(
        &self,
        timeline: TimelineId,
        source: &DataRef,
    ) -> TimelineResult<PendingFork> {
        let pending = self
            .call("create_fork", timeline, true, || {
                let mut pending = PendingFork::spawn(Arc::clone(&self.provider), source.clone());
                async move {
                    let created = pending.wait().await;
                    created.map(|()| pending)
                }
            })
            .await?;
        debug!(
            target: "timelines::fork",
            timeline_id = %timeline,
            source = %source,
            fork = ?pending.fork(),
            "Provisioned fork"
        );
        Ok(pending)
    }

    /// Record a pending fork through `write`, or drop it if that fails
    pub(crate) async fn adopt<T>(
        &self,
        timeline: TimelineId,
        pending: PendingFork,
        mut write: impl FnMut(&ForkRef) -> TimelineResult<T>,
    ) -> TimelineResult<(ForkRef, T)> {
        let Some(fork) = pending.fork().cloned() else {
            return Err(TimelineError::invariant(format!(
                "adopting an unsettled fork for timeline {}",
                timeline
            )));
        };

        match self.write_metadata(|| write(&fork)).await {
            Ok(value) => {
                let _ = pending.into_fork();
                Ok((fork, value))
            }
            Err(e) => {
                warn!(
                    target: "timelines::fork",
                    timeline_id = %timeline,
                    fork = %fork,
                    error = %e,
                    "Could not record fork; dropping it"
                );
                let _ = pending.into_fork();
                if let Err(drop_err) = self.drop_fork(timeline, &fork).await {
                    warn!(
                        target: "timelines::fork",
                        timeline_id = %timeline,
                        fork = %fork,
                        error = %drop_err,
                        "Failed to drop unrecorded fork"
                    );
                }
                Err(e)
            }
        }
    }

    /// Drop a fork; an already-missing fork counts as dropped
    pub(crate) async fn drop_fork(&self, timeline: TimelineId, fork: &ForkRef) -> TimelineResult<()> {
        let provider = &self.provider;
        self.call("drop_fork", timeline, true, || async move {
            match provider.drop_fork(fork).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await
    }

    /// Ask the provider whether a fork is still live
    pub async fn fork_is_live(&self, timeline: TimelineId, fork: &ForkRef) -> TimelineResult<bool> {
        let provider = &self.provider;
        self.call("fork_exists", timeline, true, || async move {
            provider.fork_exists(fork).await
        })
        .await
    }

    // ========================================================================
    // Checkout / release
    // ========================================================================

    /// Where a new fork for `timeline` starts from
    ///
    /// Head snapshot, then fork point, then the parent's head snapshot,
    /// then the fresh base.
    pub fn checkout_source(&self, timeline: &Timeline) -> TimelineResult<DataRef> {
        if let Some(head) = self.store.head_snapshot(timeline.id)? {
            return Ok(DataRef::Snapshot(head.provider_ref));
        }
        if let Some(fork_point) = &timeline.fork_point {
            return Ok(DataRef::Snapshot(fork_point.clone()));
        }
        if let Some(parent) = timeline.parent_id {
            if !self.store.contains(parent) {
                return Err(TimelineError::invariant(format!(
                    "timeline {} has dangling parent {}",
                    timeline.id, parent
                )));
            }
            if let Some(head) = self.store.head_snapshot(parent)? {
                return Ok(DataRef::Snapshot(head.provider_ref));
            }
        }
        Ok(DataRef::Base)
    }

    /// Return the timeline's live fork, provisioning one if needed
    ///
    /// Idempotent: a recorded fork the provider still has is returned as
    /// is. A recorded fork the provider lost is replaced.
    pub async fn checkout(&self, id: TimelineId) -> TimelineResult<ForkRef> {
        let timeline = self.store.get(id)?;
        if !timeline.is_active() {
            return Err(TimelineError::invalid_state(
                id,
                format!("cannot check out a {} timeline", timeline.status),
            ));
        }

        if let Some(fork) = &timeline.fork_ref {
            if self.fork_is_live(id, fork).await? {
                debug!(target: "timelines::fork", timeline_id = %id, fork = %fork, "Checkout reused live fork");
                return Ok(fork.clone());
            }
            warn!(
                target: "timelines::fork",
                timeline_id = %id,
                fork = %fork,
                "Recorded fork no longer exists; reprovisioning"
            );
        }

        let source = self.checkout_source(&timeline)?;
        let pending = self.provision(id, &source).await?;
        let store = &self.store;
        let (fork, _) = self
            .adopt(id, pending, |fork| {
                store.update(id, |t| {
                    t.fork_ref = Some(fork.clone());
                    Ok(())
                })
            })
            .await?;

        info!(target: "timelines::fork", timeline_id = %id, fork = %fork, source = %source, "Checked out timeline");
        Ok(fork)
    }

    /// Drop the timeline's fork, if any
    pub async fn release(&self, id: TimelineId) -> TimelineResult<()> {
        let timeline = self.store.get(id)?;
        let Some(fork) = timeline.fork_ref else {
            debug!(target: "timelines::fork", timeline_id = %id, "Release without a fork is a no-op");
            return Ok(());
        };

        self.drop_fork(id, &fork).await?;
        let store = &self.store;
        self.write_metadata(|| {
            store.update(id, |t| {
                t.fork_ref = None;
                Ok(())
            })
        })
        .await?;

        info!(target: "timelines::fork", timeline_id = %id, fork = %fork, "Released fork");
        Ok(())
    }

    /// The fork recorded on an active timeline
    ///
    /// Does not provision; a timeline without one must be checked out first.
    pub fn live_fork(&self, timeline: &Timeline) -> TimelineResult<ForkRef> {
        if !timeline.is_active() {
            return Err(TimelineError::invalid_state(
                timeline.id,
                format!("timeline is {}", timeline.status),
            ));
        }
        timeline.fork_ref.clone().ok_or_else(|| {
            TimelineError::invalid_state(timeline.id, "timeline has no live fork; check it out first")
        })
    }

    /// What to read a timeline's current state from, without provisioning
    ///
    /// Live fork, then head snapshot, then fork point, then the fresh base.
    pub async fn read_ref(&self, timeline: &Timeline) -> TimelineResult<DataRef> {
        if let Some(fork) = &timeline.fork_ref {
            if self.fork_is_live(timeline.id, fork).await? {
                return Ok(DataRef::Fork(fork.clone()));
            }
        }
        if let Some(head) = self.store.head_snapshot(timeline.id)? {
            return Ok(DataRef::Snapshot(head.provider_ref));
        }
        if let Some(fork_point) = &timeline.fork_point {
            return Ok(DataRef::Snapshot(fork_point.clone()));
        }
        Ok(DataRef::Base)
    }

    // ========================================================================
    // Fork operations
    // ========================================================================

    /// Capture a fork's committed contents
    pub async fn snapshot(&self, timeline: TimelineId, fork: &ForkRef) -> TimelineResult<SnapshotRef> {
        let provider = &self.provider;
        self.call("snapshot_fork", timeline, true, || async move {
            provider.snapshot_fork(fork).await
        })
        .await
    }

    /// Execute one statement on a fork
    ///
    /// Writes and `Commit` are never retried: a transient failure may have
    /// taken effect.
    pub async fn execute(
        &self,
        timeline: TimelineId,
        fork: &ForkRef,
        query: &Query,
    ) -> TimelineResult<QueryResult> {
        let retryable = matches!(query, Query::Begin | Query::Rollback | Query::Select { .. });
        let provider = &self.provider;
        self.call("execute", timeline, retryable, || async move {
            provider.execute(fork, query).await
        })
        .await
    }

    /// Execute statements as one transaction: all or nothing
    ///
    /// Returns the total rows affected. On any failure the transaction is
    /// rolled back before the error is returned; if the caller abandons the
    /// future, the rollback happens in the background.
    pub async fn execute_transaction(
        &self,
        timeline: TimelineId,
        fork: &ForkRef,
        statements: &[Query],
    ) -> TimelineResult<u64> {
        self.execute(timeline, fork, &Query::Begin).await?;
        let mut guard = OpenTransaction {
            fork: Some(fork.clone()),
            provider: Arc::clone(&self.provider),
        };

        let mut affected = 0;
        let mut outcome = Ok(());
        for statement in statements {
            match self.execute(timeline, fork, statement).await {
                Ok(result) => affected += result.rows_affected,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if outcome.is_ok() {
            outcome = self.execute(timeline, fork, &Query::Commit).await.map(|_| ());
        }

        match outcome {
            Ok(()) => {
                guard.disarm();
                debug!(
                    target: "timelines::fork",
                    timeline_id = %timeline,
                    statements = statements.len(),
                    affected,
                    "Committed transaction"
                );
                Ok(affected)
            }
            Err(e) => {
                guard.disarm();
                if let Err(rollback) = self.execute(timeline, fork, &Query::Rollback).await {
                    warn!(
                        target: "timelines::fork",
                        timeline_id = %timeline,
                        error = %rollback,
                        "Rollback after failed transaction did not succeed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Compute the difference `from` → `to`
    pub async fn diff(
        &self,
        timeline: TimelineId,
        from: &DataRef,
        to: &DataRef,
    ) -> TimelineResult<RawDiff> {
        let provider = &self.provider;
        self.call("diff_data", timeline, true, || async move {
            provider.diff_data(from, to).await
        })
        .await
    }
}
