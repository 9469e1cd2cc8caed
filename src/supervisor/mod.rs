//! Process supervision: spawning, bookkeeping, reaping, timeout escalation,
//! and the monitor loop that ties them together.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────┐
//!                │  supervisor daemon   │
//!                │    (monitor loop)    │
//!                └──────┬───────┬───────┘
//!          spawn + feed │       │ SIGTERM -> grace -> SIGKILL
//!               ┌───────▼──┐ ┌──▼───────┐
//!               │  worker  │ │  worker  │
//!               │ (compare)│ │ (report) │
//!               └────┬─────┘ └────▲─────┘
//!                    └── result ──┘
//!
//!   SIGCHLD ─> watcher thread ─> bounded event queue ─> monitor loop
//! ```
//!
//! The monitor loop is the single owner of the worker table and the
//! completion tally. Terminations observed asynchronously are handed off
//! through the bounded queue; the loop also sweeps for overdue workers once
//! per tick and exits once every worker is accounted for.

mod enforcer;
mod monitor;
mod reaper;
mod spawn;
mod table;

pub use monitor::{Supervisor, SupervisorConfig};
pub use spawn::SpawnConfig;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    /// Tests that spawn or reap raw child processes hold this lock so they
    /// cannot collect each other's children.
    static CHILD_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn child_lock() -> MutexGuard<'static, ()> {
        CHILD_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
