//! Worker subprocess spawning.
//!
//! Workers are the supervisor binary re-executed with a hidden role flag, so
//! a single installed executable carries the whole process tree.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

use nix::unistd::Pid;

use crate::cli::{LogFormatArg, WorkerRole};
use crate::error::{FifodError, Result};

/// Spawn settings shared by every worker of one run.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Directory holding the channel endpoints.
    pub pipe_dir: PathBuf,
    /// Log file workers append to alongside the supervisor.
    pub log_file: PathBuf,
    /// Log format passed through to workers.
    pub log_format: LogFormatArg,
    /// Verbosity passed through to workers.
    pub verbose: u8,
    /// Whether workers run with errors-only logging.
    pub quiet: bool,
}

/// Handle returned by a successful spawn.
#[derive(Debug, Clone, Copy)]
pub struct WorkerHandle {
    /// Child process ID.
    pub pid: Pid,
    /// When the spawn call returned, the base for the time limit.
    pub started_at: Instant,
}

/// Argument vector for a worker process.
///
/// Kept separate from the spawn call so it can be checked without starting
/// anything.
fn worker_args(role: WorkerRole, config: &SpawnConfig) -> Vec<String> {
    let mut args = vec![
        "--internal-worker".to_string(),
        role.as_str().to_string(),
        "--pipe-dir".to_string(),
        config.pipe_dir.display().to_string(),
        "--log-file".to_string(),
        config.log_file.display().to_string(),
        "--log-format".to_string(),
        config.log_format.as_str().to_string(),
    ];
    if config.quiet {
        args.push("--quiet".to_string());
    }
    for _ in 0..config.verbose {
        args.push("-v".to_string());
    }
    args
}

/// Spawn one worker process.
///
/// The child gets a null stdin and shares the supervisor's stdout and stderr;
/// everything else it needs arrives through its argv and the channel
/// endpoints. The returned handle is not a `std::process::Child`, collection
/// happens through `waitpid` on the supervisor side.
pub fn spawn_worker(role: WorkerRole, config: &SpawnConfig) -> Result<WorkerHandle> {
    let exe_path = std::env::current_exe().map_err(|source| FifodError::Spawn {
        role: role.as_str(),
        source,
    })?;

    let mut cmd = Command::new(&exe_path);
    cmd.args(worker_args(role, config));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|source| FifodError::Spawn {
        role: role.as_str(),
        source,
    })?;

    let handle = WorkerHandle {
        pid: Pid::from_raw(child.id() as i32),
        started_at: Instant::now(),
    };
    tracing::info!(
        pid = handle.pid.as_raw(),
        role = role.as_str(),
        "Worker spawned"
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SpawnConfig {
        SpawnConfig {
            pipe_dir: PathBuf::from("/tmp/fifod-test"),
            log_file: PathBuf::from("/tmp/fifod-test/fifod.log"),
            log_format: LogFormatArg::Compact,
            verbose: 0,
            quiet: false,
        }
    }

    #[test]
    fn test_worker_args_carry_role_and_paths() {
        let args = worker_args(WorkerRole::Compare, &config());
        assert_eq!(args[0], "--internal-worker");
        assert_eq!(args[1], "compare");
        let dir_flag = args.iter().position(|a| a == "--pipe-dir").unwrap();
        assert_eq!(args[dir_flag + 1], "/tmp/fifod-test");
        let log_flag = args.iter().position(|a| a == "--log-file").unwrap();
        assert_eq!(args[log_flag + 1], "/tmp/fifod-test/fifod.log");
        assert!(!args.contains(&"--quiet".to_string()));
    }

    #[test]
    fn test_worker_args_forward_verbosity() {
        let mut cfg = config();
        cfg.verbose = 2;
        let args = worker_args(WorkerRole::Report, &cfg);
        assert_eq!(args[1], "report");
        assert_eq!(args.iter().filter(|a| *a == "-v").count(), 2);

        cfg.verbose = 0;
        cfg.quiet = true;
        let args = worker_args(WorkerRole::Report, &cfg);
        assert!(args.contains(&"--quiet".to_string()));
    }
}
