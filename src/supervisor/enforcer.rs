//! Timeout escalation for overdue workers.
//!
//! Runs inline in the monitor loop. Escalation is SIGTERM, a bounded grace
//! wait, then SIGKILL with a blocking targeted wait, so one sweep can never
//! stall past `grace` per overdue worker.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;

use super::reaper::{ExitKind, classify_status};
use super::table::{WorkerRecord, WorkerTable};

/// Poll interval while waiting out a grace period.
const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How an escalated worker was finally collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// The targeted wait here got the exit status.
    Collected(ExitKind),
    /// The reaper path got there first; its record is already queued.
    CollectedElsewhere,
}

/// Outcome of one escalation.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutKill {
    /// The worker that was escalated.
    pub pid: Pid,
    /// Whether SIGKILL was needed after the grace period.
    pub forced: bool,
    /// Who ended up collecting the exit status.
    pub collection: Collection,
}

/// Escalate every active worker whose lifetime exceeds `timeout` as of `now`.
///
/// The table is only read here; the caller applies the returned kills to its
/// own bookkeeping.
pub fn sweep(
    table: &WorkerTable,
    timeout: Duration,
    grace: Duration,
    now: Instant,
) -> Vec<TimeoutKill> {
    let mut kills = Vec::new();
    for record in table.snapshot() {
        if now.duration_since(record.started_at) > timeout {
            kills.push(escalate(record, grace));
        }
    }
    kills
}

/// Escalate every listed worker at once: one SIGTERM round, one shared grace
/// window, then SIGKILL for the survivors. Used for shutdown requests.
pub fn escalate_all(pids: &[Pid], grace: Duration) -> Vec<TimeoutKill> {
    for pid in pids {
        let _ = kill(*pid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + grace;
    let mut pending: Vec<Pid> = pids.to_vec();
    let mut kills = Vec::new();
    loop {
        pending.retain(|pid| match try_collect(*pid) {
            Some(collection) => {
                kills.push(TimeoutKill {
                    pid: *pid,
                    forced: false,
                    collection,
                });
                false
            }
            None => true,
        });
        if pending.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(GRACE_POLL_INTERVAL);
    }

    for pid in pending {
        let _ = kill(pid, Signal::SIGKILL);
        kills.push(TimeoutKill {
            pid,
            forced: true,
            collection: wait_collect(pid),
        });
    }
    kills
}

/// One worker's terminate, grace, kill sequence.
///
/// Always returns with the pid collected one way or the other.
fn escalate(record: &WorkerRecord, grace: Duration) -> TimeoutKill {
    let pid = record.pid;
    tracing::warn!(
        pid = pid.as_raw(),
        role = record.role.as_str(),
        "Worker exceeded its time limit, sending SIGTERM"
    );
    // ESRCH means it died just now; the grace poll below collects it.
    let _ = kill(pid, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    loop {
        if let Some(collection) = try_collect(pid) {
            return TimeoutKill {
                pid,
                forced: false,
                collection,
            };
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(GRACE_POLL_INTERVAL);
    }

    tracing::warn!(
        pid = pid.as_raw(),
        role = record.role.as_str(),
        "Worker survived the grace period, sending SIGKILL"
    );
    let _ = kill(pid, Signal::SIGKILL);
    TimeoutKill {
        pid,
        forced: true,
        collection: wait_collect(pid),
    }
}

/// Non-blocking targeted collection attempt.
///
/// `ECHILD` means the reaper drained this pid between our signal and our
/// wait; the status is already on the event queue.
fn try_collect(pid: Pid) -> Option<Collection> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => classify_status(status).map(|record| Collection::Collected(record.kind)),
        Err(Errno::ECHILD) => Some(Collection::CollectedElsewhere),
        Err(_) => None,
    }
}

/// Blocking targeted collection. SIGKILL cannot be caught, so this returns
/// promptly after a kill.
fn wait_collect(pid: Pid) -> Collection {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(record) = classify_status(status) {
                    return Collection::Collected(record.kind);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(_) => return Collection::CollectedElsewhere,
        }
    }
}
