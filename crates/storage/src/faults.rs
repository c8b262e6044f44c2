//! Deterministic fault injection for providers
//!
//! A `FaultPlan` is a queue of faults keyed by provider operation. Each
//! provider call pops at most one fault for its operation before doing any
//! work, so tests can script "fail twice, then succeed" or "hang on the
//! third snapshot" without timing games.
//!
//! ## Example
//!
//! ```ignore
//! let provider = MemoryProvider::new();
//! provider.faults().inject(ProviderOp::CreateFork, Fault::transient("busy"));
//! provider.faults().inject_after(ProviderOp::Execute, 2, Fault::permanent("quota"));
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use timelines_core::ProviderError;

/// Provider operation a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    /// `create_fork`
    CreateFork,
    /// `drop_fork`
    DropFork,
    /// `snapshot_fork`
    SnapshotFork,
    /// `execute`
    Execute,
    /// `diff_data`
    DiffData,
    /// `fork_exists`
    ForkExists,
}

impl fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderOp::CreateFork => "create_fork",
            ProviderOp::DropFork => "drop_fork",
            ProviderOp::SnapshotFork => "snapshot_fork",
            ProviderOp::Execute => "execute",
            ProviderOp::DiffData => "diff_data",
            ProviderOp::ForkExists => "fork_exists",
        })
    }
}

/// What happens to a call that hits a fault
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the call with this error
    Fail(ProviderError),
    /// Sleep, then run the call normally
    Delay(Duration),
}

impl Fault {
    /// Transient failure
    pub fn transient(message: impl Into<String>) -> Self {
        Fault::Fail(ProviderError::transient(message))
    }

    /// Permanent failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Fault::Fail(ProviderError::permanent(message))
    }

    /// Unknown handle
    pub fn not_found(message: impl Into<String>) -> Self {
        Fault::Fail(ProviderError::not_found(message))
    }
}

#[derive(Debug)]
struct Scheduled {
    op: ProviderOp,
    skip: usize,
    fault: Fault,
}

/// Queue of scheduled faults
#[derive(Debug, Default)]
pub struct FaultPlan {
    scheduled: Mutex<Vec<Scheduled>>,
}

impl FaultPlan {
    /// Create an empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault the next call to `op`
    pub fn inject(&self, op: ProviderOp, fault: Fault) {
        self.inject_after(op, 0, fault);
    }

    /// Let `skip` calls to `op` through, then fault the next one
    ///
    /// Faults for the same operation fire in the order they were added.
    pub fn inject_after(&self, op: ProviderOp, skip: usize, fault: Fault) {
        self.scheduled.lock().push(Scheduled { op, skip, fault });
    }

    /// Fault the next `times` calls to `op`
    pub fn inject_times(&self, op: ProviderOp, times: usize, fault: Fault) {
        for _ in 0..times {
            self.inject(op, fault.clone());
        }
    }

    /// Pop the fault for a call to `op`, if one is due
    pub fn take(&self, op: ProviderOp) -> Option<Fault> {
        let mut scheduled = self.scheduled.lock();
        let idx = scheduled.iter().position(|s| s.op == op)?;
        if scheduled[idx].skip > 0 {
            scheduled[idx].skip -= 1;
            return None;
        }
        Some(scheduled.remove(idx).fault)
    }

    /// Number of faults not yet fired
    pub fn pending(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// Drop all scheduled faults
    pub fn clear(&self) {
        self.scheduled.lock().clear();
    }
}
