//! Supervisor core: startup, the monitor loop, shutdown, and teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use nix::sys::signal::Signal;

use crate::channel::{self, ChannelPair, InputPayload};
use crate::cli::WorkerRole;
use crate::error::{FifodError, Result};

use super::enforcer::{self, Collection, TimeoutKill};
use super::reaper::{
    EVENT_QUEUE_CAPACITY, ExitKind, SignalWatcher, SupervisorEvent, TerminationRecord,
};
use super::spawn::{SpawnConfig, spawn_worker};
use super::table::{POOL_CAPACITY, WorkerState, WorkerTable};

/// Seed-open retry interval for the feeder thread.
const FEED_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Per-run supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-worker time limit before escalation starts.
    pub worker_timeout: Duration,
    /// How long an escalated worker gets between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Monitor loop interval.
    pub tick: Duration,
    /// Settings inherited by every worker.
    pub spawn: SpawnConfig,
}

/// Why the monitor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every worker was accounted for.
    Completed { reaped: usize, timed_out: usize },
    /// An external shutdown request drained the pool early.
    ShutdownRequested { accounted: usize },
}

/// One supervisor run over a fixed set of workers.
///
/// Owns the worker table and the completion tally. Nothing outside the
/// monitor loop mutates either; the signal-driven side only feeds the event
/// queue.
pub struct Supervisor {
    config: SupervisorConfig,
    table: WorkerTable,
    /// Workers accounted for, by whichever path observed them first.
    completed: usize,
    reaped: usize,
    timed_out: usize,
    expected: usize,
    events: Receiver<SupervisorEvent>,
    _watcher: SignalWatcher,
    transport: ChannelPair,
    feeder: Option<JoinHandle<()>>,
    feeder_stop: Arc<AtomicBool>,
}

impl Supervisor {
    /// Create the channel endpoints, install the signal watcher, spawn one
    /// worker per role, and start seeding the input channel.
    ///
    /// On any failure after the first spawn, already-running workers are
    /// killed and collected before the error is returned.
    pub fn start(
        config: SupervisorConfig,
        roles: &[WorkerRole],
        input: InputPayload,
    ) -> Result<Self> {
        let transport = ChannelPair::create(&config.spawn.pipe_dir)?;
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let watcher = SignalWatcher::spawn(events_tx)?;

        let mut table = WorkerTable::new(POOL_CAPACITY);
        if let Err(e) = spawn_workers(&mut table, roles, &config) {
            abort_startup(&table, config.grace_period);
            return Err(e);
        }

        let feeder_stop = Arc::new(AtomicBool::new(false));
        let feeder = match spawn_feeder(
            channel::input_path(&config.spawn.pipe_dir),
            input,
            config.worker_timeout + config.grace_period,
            Arc::clone(&feeder_stop),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                abort_startup(&table, config.grace_period);
                return Err(e);
            }
        };

        let expected = roles.len();
        Ok(Self {
            config,
            table,
            completed: 0,
            reaped: 0,
            timed_out: 0,
            expected,
            events: events_rx,
            _watcher: watcher,
            transport,
            feeder: Some(feeder),
            feeder_stop,
        })
    }

    /// Drive the monitor loop until every worker is accounted for or a
    /// shutdown request arrives. Consumes the supervisor; teardown runs
    /// before returning.
    pub fn run(mut self) -> Result<RunOutcome> {
        tracing::info!(
            pid = std::process::id(),
            workers = self.expected,
            tick_ms = self.config.tick.as_millis() as u64,
            "Supervisor running"
        );
        let mut last_sweep = Instant::now();
        let outcome = loop {
            if self.completed >= self.expected {
                tracing::info!(
                    reaped = self.reaped,
                    timed_out = self.timed_out,
                    "All workers accounted for"
                );
                break RunOutcome::Completed {
                    reaped: self.reaped,
                    timed_out: self.timed_out,
                };
            }

            match self.events.recv_timeout(self.config.tick) {
                Ok(SupervisorEvent::Reaped(record)) => self.apply_reaped(record),
                Ok(SupervisorEvent::ShutdownRequested(signal)) => break self.shutdown(signal),
                Ok(SupervisorEvent::ReloadRequested) => {
                    tracing::info!("Reload requested; runtime settings are fixed for the run");
                }
                Ok(SupervisorEvent::StatusRequested) => {
                    tracing::info!(
                        active = self.table.count(),
                        completed = self.completed,
                        expected = self.expected,
                        "Status requested"
                    );
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::error!("Signal watcher is gone; relying on timeout sweeps only");
                    thread::sleep(self.config.tick);
                }
            }

            if last_sweep.elapsed() >= self.config.tick {
                self.sweep();
                last_sweep = Instant::now();
            }
        };
        self.teardown();
        Ok(outcome)
    }

    /// Apply one handed-off termination; count it unless another path already
    /// did.
    fn apply_reaped(&mut self, record: TerminationRecord) {
        match self.table.mark_terminal(record.pid, WorkerState::Reaped) {
            Some(entry) => {
                self.completed += 1;
                self.reaped += 1;
                match record.kind {
                    ExitKind::Normal(code) => tracing::info!(
                        pid = record.pid.as_raw(),
                        role = entry.role.as_str(),
                        code,
                        "Worker exited"
                    ),
                    ExitKind::Killed(signal) => tracing::info!(
                        pid = record.pid.as_raw(),
                        role = entry.role.as_str(),
                        signal = %signal,
                        "Worker killed"
                    ),
                }
                self.table.remove(record.pid);
            }
            None => {
                tracing::debug!(
                    pid = record.pid.as_raw(),
                    "Duplicate termination notification ignored"
                );
            }
        }
    }

    /// Escalate overdue workers and fold the outcomes into the tally.
    fn sweep(&mut self) {
        let kills = enforcer::sweep(
            &self.table,
            self.config.worker_timeout,
            self.config.grace_period,
            Instant::now(),
        );
        for kill in kills {
            self.apply_timeout(kill);
        }
    }

    fn apply_timeout(&mut self, kill: TimeoutKill) {
        match self.table.mark_terminal(kill.pid, WorkerState::TimedOut) {
            Some(entry) => {
                self.completed += 1;
                self.timed_out += 1;
                match kill.collection {
                    Collection::Collected(kind) => tracing::warn!(
                        pid = kill.pid.as_raw(),
                        role = entry.role.as_str(),
                        forced = kill.forced,
                        status = %kind,
                        "Worker timed out and was terminated"
                    ),
                    Collection::CollectedElsewhere => tracing::warn!(
                        pid = kill.pid.as_raw(),
                        role = entry.role.as_str(),
                        forced = kill.forced,
                        "Worker timed out and was terminated"
                    ),
                }
                self.table.remove(kill.pid);
            }
            None => tracing::debug!(
                pid = kill.pid.as_raw(),
                "Timed-out worker already accounted for"
            ),
        }
    }

    /// Honor an external shutdown request: stop feeding, escalate every
    /// remaining worker, then take one final pass over the event queue so the
    /// books close.
    fn shutdown(&mut self, signal: i32) -> RunOutcome {
        let name = Signal::try_from(signal)
            .map(Signal::as_str)
            .unwrap_or("signal");
        tracing::info!(signal = name, "Shutdown requested, draining worker pool");
        self.feeder_stop.store(true, Ordering::SeqCst);

        let pids = self.table.active_pids();
        for kill in enforcer::escalate_all(&pids, self.config.grace_period) {
            self.apply_shutdown_kill(kill);
        }

        while let Ok(event) = self.events.try_recv() {
            if let SupervisorEvent::Reaped(record) = event {
                self.apply_reaped(record);
            }
        }

        tracing::info!(
            accounted = self.completed,
            expected = self.expected,
            "Shutdown complete"
        );
        RunOutcome::ShutdownRequested {
            accounted: self.completed,
        }
    }

    fn apply_shutdown_kill(&mut self, kill: TimeoutKill) {
        match self.table.mark_terminal(kill.pid, WorkerState::TimedOut) {
            Some(entry) => {
                self.completed += 1;
                self.timed_out += 1;
                tracing::info!(
                    pid = kill.pid.as_raw(),
                    role = entry.role.as_str(),
                    forced = kill.forced,
                    "Worker terminated for shutdown"
                );
                self.table.remove(kill.pid);
            }
            None => tracing::debug!(
                pid = kill.pid.as_raw(),
                "Worker already accounted for at shutdown"
            ),
        }
    }

    /// Stop the feeder and remove the channel endpoints.
    fn teardown(&mut self) {
        self.feeder_stop.store(true, Ordering::SeqCst);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        self.transport.remove();
        tracing::info!(remaining = self.table.count(), "Supervisor exiting");
    }
}

/// Spawn and register one worker per role, stopping at the first failure.
fn spawn_workers(
    table: &mut WorkerTable,
    roles: &[WorkerRole],
    config: &SupervisorConfig,
) -> Result<()> {
    for role in roles {
        let handle = spawn_worker(*role, &config.spawn)?;
        if let Err(e) = table.register(handle.pid, *role, handle.started_at) {
            // No slot for it, so collect it before bailing out.
            enforcer::escalate_all(&[handle.pid], config.grace_period);
            return Err(e);
        }
    }
    Ok(())
}

/// Kill and collect whatever got spawned before a startup failure.
fn abort_startup(table: &WorkerTable, grace: Duration) {
    let pids = table.active_pids();
    if !pids.is_empty() {
        tracing::warn!(
            count = pids.len(),
            "Startup failed, collecting already-spawned workers"
        );
        enforcer::escalate_all(&pids, grace);
    }
}

fn spawn_feeder(
    path: PathBuf,
    payload: InputPayload,
    patience: Duration,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("input-feeder".to_string())
        .spawn(move || feed_input(&path, payload, patience, &stop))
        .map_err(FifodError::from)
}

/// Seed the input channel once a worker opens the read side.
///
/// Runs on its own thread so the monitor loop never parks on the rendezvous.
/// Gives up at the deadline, after which the unfed worker is the enforcer's
/// problem, or as soon as the supervisor starts tearing down.
fn feed_input(path: &Path, payload: InputPayload, patience: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + patience;
    let mut endpoint = loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match channel::try_open_write(path) {
            Ok(Some(endpoint)) => break endpoint,
            Ok(None) => {
                if Instant::now() >= deadline {
                    tracing::warn!(
                        path = %path.display(),
                        "No reader appeared on the input channel before the deadline"
                    );
                    return;
                }
                thread::sleep(FEED_RETRY_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Input channel seeding failed"
                );
                return;
            }
        }
    };
    match payload.write_to(&mut endpoint) {
        Ok(()) => tracing::debug!(
            first = payload.first,
            second = payload.second,
            "Input channel seeded"
        ),
        Err(e) => tracing::warn!(error = %e, "Input channel seeding failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use tempfile::TempDir;

    #[test]
    fn test_feed_input_delivers_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.fifo");
        mkfifo(&path, Mode::from_bits_truncate(0o644)).unwrap();

        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            let mut endpoint = channel::open_read(&reader_path).unwrap();
            InputPayload::read_from(&mut endpoint).unwrap()
        });

        let stop = AtomicBool::new(false);
        feed_input(&path, InputPayload::new(5, 2), Duration::from_secs(5), &stop);

        let payload = reader.join().unwrap();
        assert_eq!(payload, InputPayload::new(5, 2));
    }

    #[test]
    fn test_feed_input_gives_up_at_deadline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.fifo");
        mkfifo(&path, Mode::from_bits_truncate(0o644)).unwrap();

        let stop = AtomicBool::new(false);
        let start = Instant::now();
        feed_input(
            &path,
            InputPayload::new(1, 2),
            Duration::from_millis(150),
            &stop,
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_feed_input_honors_stop_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.fifo");
        mkfifo(&path, Mode::from_bits_truncate(0o644)).unwrap();

        let stop = AtomicBool::new(true);
        let start = Instant::now();
        feed_input(
            &path,
            InputPayload::new(1, 2),
            Duration::from_secs(30),
            &stop,
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
