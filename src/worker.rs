//! Worker subprocess entry points.
//!
//! This module runs when `fifod --internal-worker <role>` is invoked. A
//! worker walks `Spawned -> AwaitingChannel -> Processing -> Writing ->
//! Exited(code)`; external termination can cut in from any non-terminal state
//! (`Killed(signal)`). The in-process phases show up as fields on log lines
//! and in transport error messages.
//!
//! Transport failures are fatal to the worker only: it exits with
//! [`EXIT_CODE_TRANSPORT`] so the supervisor can tell them apart from clean
//! runs when the exit status is reaped.

use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::channel::{self, InputPayload, ResultPayload};
use crate::cli::WorkerRole;
use crate::error::{FifodError, Result};

/// Exit code for a clean worker run.
pub const EXIT_CODE_OK: i32 = 0;

/// Exit code distinguishing transport failures from everything else.
pub const EXIT_CODE_TRANSPORT: i32 = 2;

/// Env knob: sleep this many milliseconds before touching any channel.
/// Mirrors the artificial startup delay of the reference workload and lets
/// tests hold a worker in its pre-channel state deterministically.
pub const ENV_WORKER_DELAY_MS: &str = "FIFOD_WORKER_DELAY_MS";

/// Env knob: ignore SIGTERM so only SIGKILL can end the worker. Used to
/// exercise the forced-kill half of the timeout escalation.
pub const ENV_WORKER_IGNORE_TERM: &str = "FIFOD_WORKER_IGNORE_TERM";

/// In-process phase of the worker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingChannel,
    Processing,
    Writing,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingChannel => "awaiting channel",
            Self::Processing => "processing",
            Self::Writing => "writing",
        }
    }
}

/// Pick the larger of the two inputs.
///
/// Ties resolve to the first argument; for equal values the distinction is
/// only observable through this documented policy.
pub fn larger(first: i32, second: i32) -> i32 {
    if first >= second { first } else { second }
}

fn transport_err(phase: Phase) -> impl FnOnce(std::io::Error) -> FifodError {
    move |source| FifodError::Transport {
        phase: phase.as_str(),
        source,
    }
}

/// Compare workload: read the input pair, write the larger value to the
/// result channel.
fn run_compare(pipe_dir: &Path) -> Result<()> {
    let pid = std::process::id();

    tracing::debug!(pid, phase = Phase::AwaitingChannel.as_str(), "Opening input channel");
    let mut input = channel::open_read(&channel::input_path(pipe_dir))
        .map_err(transport_err(Phase::AwaitingChannel))?;

    let payload = InputPayload::read_from(&mut input).map_err(transport_err(Phase::Processing))?;
    tracing::debug!(
        pid,
        phase = Phase::Processing.as_str(),
        first = payload.first,
        second = payload.second,
        "Comparing inputs"
    );
    let result = ResultPayload(larger(payload.first, payload.second));

    tracing::debug!(pid, phase = Phase::Writing.as_str(), "Opening result channel");
    let mut out = channel::open_write(&channel::result_path(pipe_dir))
        .map_err(transport_err(Phase::Writing))?;
    result
        .write_to(&mut out)
        .map_err(transport_err(Phase::Writing))?;

    tracing::debug!(pid, value = result.0, "Result written");
    Ok(())
}

/// Report workload: read the result channel and report the value.
///
/// Returns the value so in-process tests can assert on it.
fn run_report(pipe_dir: &Path) -> Result<i32> {
    let pid = std::process::id();

    tracing::debug!(pid, phase = Phase::AwaitingChannel.as_str(), "Opening result channel");
    let mut input = channel::open_read(&channel::result_path(pipe_dir))
        .map_err(transport_err(Phase::AwaitingChannel))?;

    let payload = ResultPayload::read_from(&mut input).map_err(transport_err(Phase::Processing))?;

    println!("The larger number is: {}", payload.0);
    tracing::info!(pid, result = payload.0, "Result received");
    Ok(payload.0)
}

/// Apply the env fault-injection knobs before the workload starts.
fn apply_fault_knobs(role: WorkerRole) {
    let pid = std::process::id();

    if std::env::var_os(ENV_WORKER_IGNORE_TERM).is_some() {
        tracing::debug!(pid, role = role.as_str(), "Ignoring SIGTERM");
        unsafe {
            nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGTERM,
                nix::sys::signal::SigHandler::SigIgn,
            )
            .ok();
        }
    }

    if let Ok(val) = std::env::var(ENV_WORKER_DELAY_MS) {
        if let Ok(ms) = val.parse::<u64>() {
            if ms > 0 {
                tracing::debug!(pid, role = role.as_str(), delay_ms = ms, "Delaying startup");
                thread::sleep(Duration::from_millis(ms));
            }
        }
    }
}

/// Run the worker subprocess.
///
/// Never returns: exits 0 on success, [`EXIT_CODE_TRANSPORT`] on a transport
/// failure, 1 otherwise.
pub fn run(role: WorkerRole, pipe_dir: &Path) -> ! {
    // Ignore SIGPIPE so a vanished peer surfaces as EPIPE on the write
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let pid = std::process::id();
    tracing::info!(pid, role = role.as_str(), "Worker started");

    apply_fault_knobs(role);

    let outcome = match role {
        WorkerRole::Compare => run_compare(pipe_dir),
        WorkerRole::Report => run_report(pipe_dir).map(|_| ()),
    };

    match outcome {
        Ok(()) => {
            tracing::debug!(pid, role = role.as_str(), "Worker finished");
            std::process::exit(EXIT_CODE_OK);
        }
        Err(e @ FifodError::Transport { .. }) => {
            tracing::error!(pid, role = role.as_str(), error = %e, "Worker transport failure");
            std::process::exit(EXIT_CODE_TRANSPORT);
        }
        Err(e) => {
            tracing::error!(pid, role = role.as_str(), error = %e, "Worker failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelPair;

    #[test]
    fn test_larger_picks_the_bigger_value() {
        assert_eq!(larger(5, 2), 5);
        assert_eq!(larger(2, 5), 5);
        assert_eq!(larger(-7, -2), -2);
        assert_eq!(larger(0, -1), 0);
        assert_eq!(larger(i32::MIN, i32::MAX), i32::MAX);
    }

    #[test]
    fn test_larger_tie_returns_first_argument() {
        assert_eq!(larger(-3, -3), -3);
        assert_eq!(larger(0, 0), 0);
        assert_eq!(larger(7, 7), 7);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::AwaitingChannel.as_str(), "awaiting channel");
        assert_eq!(Phase::Processing.as_str(), "processing");
        assert_eq!(Phase::Writing.as_str(), "writing");
    }

    #[test]
    fn test_compare_workload_over_real_channels() {
        let dir = tempfile::tempdir().unwrap();
        let _pair = ChannelPair::create(dir.path()).unwrap();
        let pipe_dir = dir.path().to_path_buf();

        let compare = thread::spawn(move || run_compare(&pipe_dir));

        // Seed the input side once the compare worker has the channel open
        let input = channel::input_path(dir.path());
        let mut writer = loop {
            if let Some(f) = channel::try_open_write(&input).unwrap() {
                break f;
            }
            thread::sleep(Duration::from_millis(5));
        };
        InputPayload::new(5, 2).write_to(&mut writer).unwrap();
        drop(writer);

        // Read the result the way the report worker would
        let mut result = channel::open_read(&channel::result_path(dir.path())).unwrap();
        let payload = ResultPayload::read_from(&mut result).unwrap();
        assert_eq!(payload.0, 5);

        compare.join().unwrap().unwrap();
    }

    #[test]
    fn test_report_workload_over_real_channels() {
        let dir = tempfile::tempdir().unwrap();
        let _pair = ChannelPair::create(dir.path()).unwrap();
        let pipe_dir = dir.path().to_path_buf();

        let report = thread::spawn(move || run_report(&pipe_dir));

        let path = channel::result_path(dir.path());
        let mut writer = loop {
            if let Some(f) = channel::try_open_write(&path).unwrap() {
                break f;
            }
            thread::sleep(Duration::from_millis(5));
        };
        ResultPayload(-3).write_to(&mut writer).unwrap();
        drop(writer);

        assert_eq!(report.join().unwrap().unwrap(), -3);
    }

    #[test]
    fn test_compare_fails_without_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        // No FIFOs created: the open fails immediately with a transport error
        let err = run_compare(dir.path()).unwrap_err();
        match err {
            FifodError::Transport { phase, .. } => assert_eq!(phase, "awaiting channel"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
