//! fifod - FIFO rendezvous worker supervisor.

mod channel;
mod cli;
mod daemonize;
mod error;
mod logging;
mod supervisor;
mod worker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use channel::InputPayload;
use cli::{Cli, WorkerRole};
use daemonize::ReadySignal;
use logging::LogConfig;
use supervisor::{SpawnConfig, Supervisor, SupervisorConfig};

/// The two workloads every run spawns, in spawn order.
const WORKLOAD_ROLES: [WorkerRole; 2] = [WorkerRole::Compare, WorkerRole::Report];

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = run(cli);

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Dispatch between worker mode, foreground supervision, and the default
/// daemonized run.
fn run(cli: Cli) -> Result<()> {
    // Worker mode: this process is one of the spawned children. The paths in
    // its argv were resolved by the supervisor.
    if let Some(role) = cli.internal_worker {
        logging::init_with_file(log_config(&cli, cli.log_file.clone()));
        worker::run(role, &cli.pipe_dir);
    }

    cli.validate().map_err(|message| anyhow::anyhow!(message))?;
    let input = match (cli.first, cli.second) {
        (Some(first), Some(second)) => InputPayload::new(first, second),
        _ => bail!("two integer arguments are required"),
    };

    // The daemon changes its working directory, so resolve everything first.
    let pipe_dir = absolutize(&cli.pipe_dir).with_context(|| {
        format!("Failed to resolve pipe directory {}", cli.pipe_dir.display())
    })?;
    if !pipe_dir.is_dir() {
        bail!("Pipe directory {} does not exist", pipe_dir.display());
    }
    let log_file = absolutize(&cli.log_file)
        .with_context(|| format!("Failed to resolve log file {}", cli.log_file.display()))?;
    probe_log_file(&log_file)?;

    let config = SupervisorConfig {
        worker_timeout: Duration::from_secs(cli.timeout),
        grace_period: Duration::from_secs(cli.grace),
        tick: Duration::from_millis(cli.tick_ms),
        spawn: SpawnConfig {
            pipe_dir,
            log_file: log_file.clone(),
            log_format: cli.log_format,
            verbose: cli.verbose,
            quiet: cli.quiet,
        },
    };

    if cli.foreground {
        logging::init_with_file(log_config(&cli, log_file));
        let supervisor = Supervisor::start(config, &WORKLOAD_ROLES, input)?;
        supervisor.run()?;
        Ok(())
    } else {
        let daemon_log = log_config(&cli, log_file);
        let handle = daemonize::launch(move |ready| daemon_main(daemon_log, config, input, ready))?;
        println!("fifod: supervisor started (pid {})", handle.pid);
        Ok(())
    }
}

/// Daemon-side continuation. The ready signal decides the launcher's exit
/// status, so it fires only after the supervisor is fully set up.
fn daemon_main(
    log: LogConfig,
    config: SupervisorConfig,
    input: InputPayload,
    ready: ReadySignal,
) -> i32 {
    logging::init_with_file(log);
    match Supervisor::start(config, &WORKLOAD_ROLES, input) {
        Ok(supervisor) => {
            ready.ready();
            match supervisor.run() {
                Ok(_outcome) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "Supervisor failed");
                    1
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Supervisor setup failed");
            ready.failed(&e.to_string());
            1
        }
    }
}

fn log_config(cli: &Cli, log_file: PathBuf) -> LogConfig {
    LogConfig::new()
        .with_level(cli.log_level())
        .with_format(cli.log_format.into())
        .with_file(log_file)
        .with_env_overrides()
}

/// Resolve a path against the current directory without requiring it to
/// exist yet.
fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Open the log file for append once, so an unwritable path fails the run
/// before any fork.
fn probe_log_file(path: &Path) -> Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
        .with_context(|| format!("Failed to open log file {}", path.display()))
}
