//! Bookkeeping for spawned workers.
//!
//! The table is owned exclusively by the monitor loop. Signal-driven code
//! never touches it; terminations reach it only through the event queue.

use std::time::Instant;

use nix::unistd::Pid;

use crate::cli::WorkerRole;
use crate::error::{FifodError, Result};

/// Fixed number of worker slots per supervisor run.
pub const POOL_CAPACITY: usize = 10;

/// Lifecycle state of a tracked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Running as far as the supervisor knows.
    Active,
    /// Terminated by the timeout escalation.
    TimedOut,
    /// Exit status collected through the reaper path.
    Reaped,
}

/// One tracked worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Process ID.
    pub pid: Pid,
    /// Which workload this process runs.
    pub role: WorkerRole,
    /// When the process was spawned.
    pub started_at: Instant,
    /// Current lifecycle state.
    pub state: WorkerState,
}

impl WorkerRecord {
    /// Whether the record still occupies a live slot.
    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Active
    }
}

/// Bounded, insertion-ordered collection of worker records.
#[derive(Debug)]
pub struct WorkerTable {
    records: Vec<WorkerRecord>,
    capacity: usize,
}

impl WorkerTable {
    /// Create an empty table with the given slot limit.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Register a freshly spawned worker as `Active`.
    ///
    /// Fails with [`FifodError::TableFull`] when every slot is taken and with
    /// [`FifodError::DuplicateWorker`] when the pid is already tracked.
    pub fn register(&mut self, pid: Pid, role: WorkerRole, started_at: Instant) -> Result<()> {
        if self.records.len() >= self.capacity {
            return Err(FifodError::TableFull {
                capacity: self.capacity,
            });
        }
        if self.records.iter().any(|r| r.pid == pid) {
            return Err(FifodError::DuplicateWorker(pid.as_raw()));
        }
        self.records.push(WorkerRecord {
            pid,
            role,
            started_at,
            state: WorkerState::Active,
        });
        Ok(())
    }

    /// Transition a worker out of `Active`.
    ///
    /// Returns the record as it now stands when this call performed the
    /// transition. Returns `None` when the pid is unknown or already
    /// terminal, in which case the caller must not count it again.
    pub fn mark_terminal(&mut self, pid: Pid, state: WorkerState) -> Option<WorkerRecord> {
        debug_assert!(state != WorkerState::Active);
        let record = self
            .records
            .iter_mut()
            .find(|r| r.pid == pid && r.is_active())?;
        record.state = state;
        Some(record.clone())
    }

    /// Drop a fully processed record, freeing its slot.
    pub fn remove(&mut self, pid: Pid) {
        self.records.retain(|r| r.pid != pid);
    }

    /// Iterator over the currently active records.
    ///
    /// The iterator borrows the table, so callers restart it by calling
    /// `snapshot()` again after any mutation.
    pub fn snapshot(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.iter().filter(|r| r.is_active())
    }

    /// Pids of all active workers, oldest first.
    pub fn active_pids(&self) -> Vec<Pid> {
        self.snapshot().map(|r| r.pid).collect()
    }

    /// Number of records currently holding a slot.
    pub fn count(&self) -> usize {
        self.records.len()
    }
}
