//! Asynchronous termination collection.
//!
//! SIGCHLD work is split across three contexts. The async-signal handler
//! inside `signal_hook` only records the delivery. A dedicated watcher thread
//! turns each delivery into a full non-blocking drain, pushing one record per
//! collected pid onto the bounded event queue. The monitor loop drains the
//! queue on its own schedule and is the only code that updates worker state
//! or writes the log.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, TrySendError};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use signal_hook::iterator::backend::Handle;

use crate::error::{FifodError, Result};

/// Capacity of the handoff queue between signal handling and the monitor
/// loop. Termination records are bounded by pool capacity, so the headroom is
/// for control-signal bursts.
pub const EVENT_QUEUE_CAPACITY: usize = 32;

/// How a worker's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited on its own with this status code.
    Normal(i32),
    /// Ended by a signal.
    Killed(Signal),
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal(code) => write!(f, "exit code {}", code),
            Self::Killed(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// One collected termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationRecord {
    /// Pid the kernel reported.
    pub pid: Pid,
    /// How the process ended.
    pub kind: ExitKind,
}

/// Events flowing from the signal contexts to the monitor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A child's exit status was collected.
    Reaped(TerminationRecord),
    /// SIGTERM or SIGINT arrived; the raw signal number is kept for the log.
    ShutdownRequested(i32),
    /// SIGHUP arrived.
    ReloadRequested,
    /// SIGUSR1 arrived.
    StatusRequested,
}

/// Classify a wait status into a termination record.
///
/// Returns `None` for statuses that do not end the process, such as
/// `StillAlive` or a job-control stop.
pub fn classify_status(status: WaitStatus) -> Option<TerminationRecord> {
    match status {
        WaitStatus::Exited(pid, code) => Some(TerminationRecord {
            pid,
            kind: ExitKind::Normal(code),
        }),
        WaitStatus::Signaled(pid, signal, _core_dumped) => Some(TerminationRecord {
            pid,
            kind: ExitKind::Killed(signal),
        }),
        _ => None,
    }
}

/// Collect every termination the kernel currently has for us.
///
/// Loops `waitpid(-1, WNOHANG)` until nothing more is collectible; never
/// blocks. The kernel hands out each exit status once, so the returned
/// records are unique by pid.
pub fn drain_terminations() -> Vec<TerminationRecord> {
    let mut records = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            // Children exist but none are collectible right now.
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(record) = classify_status(status) {
                    records.push(record);
                }
            }
            // No children left at all.
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    records
}

/// Owns the signal watcher thread for the lifetime of a supervisor run.
///
/// Dropping the watcher closes the signal iterator, which ends the thread and
/// restores the previous signal dispositions.
pub struct SignalWatcher {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Install the handlers and start forwarding onto `events`.
    pub fn spawn(events: Sender<SupervisorEvent>) -> Result<Self> {
        let mut signals = Signals::new([SIGCHLD, SIGTERM, SIGINT, SIGHUP, SIGUSR1])
            .map_err(FifodError::SignalWatcher)?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || watcher_loop(&mut signals, &events))
            .map_err(FifodError::SignalWatcher)?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watcher_loop(signals: &mut Signals, events: &Sender<SupervisorEvent>) {
    let mut shutdown_sent = false;
    for signal in signals.forever() {
        match signal {
            SIGCHLD => {
                for record in drain_terminations() {
                    push(events, SupervisorEvent::Reaped(record));
                }
            }
            SIGTERM | SIGINT => {
                if !shutdown_sent {
                    shutdown_sent = true;
                    push(events, SupervisorEvent::ShutdownRequested(signal));
                }
            }
            SIGHUP => push(events, SupervisorEvent::ReloadRequested),
            SIGUSR1 => push(events, SupervisorEvent::StatusRequested),
            _ => {}
        }
    }
}

/// Non-blocking enqueue. A full queue can only be control-signal noise, and a
/// dropped control event is recoverable by repeating the signal.
fn push(events: &Sender<SupervisorEvent>, event: SupervisorEvent) {
    if let Err(TrySendError::Full(_)) = events.try_send(event) {
        // The sender can repeat the signal; nothing to do here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::test_support::child_lock;
    use crossbeam_channel::bounded;
    use nix::sys::signal::{kill, raise};
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn test_classify_normal_exit() {
        let status = WaitStatus::Exited(Pid::from_raw(42), 3);
        let record = classify_status(status).unwrap();
        assert_eq!(record.pid, Pid::from_raw(42));
        assert_eq!(record.kind, ExitKind::Normal(3));
    }

    #[test]
    fn test_classify_signaled() {
        let status = WaitStatus::Signaled(Pid::from_raw(42), Signal::SIGKILL, false);
        let record = classify_status(status).unwrap();
        assert_eq!(record.kind, ExitKind::Killed(Signal::SIGKILL));
    }

    #[test]
    fn test_classify_non_terminal() {
        assert!(classify_status(WaitStatus::StillAlive).is_none());
        let stopped = WaitStatus::Stopped(Pid::from_raw(42), Signal::SIGSTOP);
        assert!(classify_status(stopped).is_none());
    }

    #[test]
    fn test_exit_kind_display() {
        assert_eq!(ExitKind::Normal(0).to_string(), "exit code 0");
        assert_eq!(ExitKind::Normal(7).to_string(), "exit code 7");
        assert_eq!(
            ExitKind::Killed(Signal::SIGKILL).to_string(),
            "signal SIGKILL"
        );
    }

    #[test]
    fn test_drain_with_no_children_is_empty() {
        let _guard = child_lock();
        assert!(drain_terminations().is_empty());
    }

    #[test]
    fn test_drain_collects_exited_and_killed_children() {
        let _guard = child_lock();

        let exited = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let killed = Command::new("sleep").arg("30").spawn().unwrap();
        let exited_pid = Pid::from_raw(exited.id() as i32);
        let killed_pid = Pid::from_raw(killed.id() as i32);
        kill(killed_pid, Signal::SIGKILL).unwrap();

        let mut records = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while records.len() < 2 && Instant::now() < deadline {
            records.extend(drain_terminations());
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(records.len(), 2);
        let exited_record = records.iter().find(|r| r.pid == exited_pid).unwrap();
        assert_eq!(exited_record.kind, ExitKind::Normal(7));
        let killed_record = records.iter().find(|r| r.pid == killed_pid).unwrap();
        assert_eq!(killed_record.kind, ExitKind::Killed(Signal::SIGKILL));
    }

    #[test]
    fn test_watcher_forwards_events_and_dedupes_shutdown() {
        let _guard = child_lock();
        let (tx, rx) = bounded(EVENT_QUEUE_CAPACITY);
        let watcher = SignalWatcher::spawn(tx).unwrap();

        raise(Signal::SIGUSR1).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            SupervisorEvent::StatusRequested
        );

        raise(Signal::SIGTERM).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            SupervisorEvent::ShutdownRequested(SIGTERM)
        );

        // A second shutdown request is swallowed; the next event through is
        // the reload.
        raise(Signal::SIGTERM).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        raise(Signal::SIGHUP).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            SupervisorEvent::ReloadRequested
        );

        drop(watcher);
    }
}
