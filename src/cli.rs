//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::logging::LogFormat;

/// Supervisor daemon that hands two integers to a pool of worker processes
/// over named pipes and reports the larger one.
#[derive(Parser, Debug)]
#[command(name = "fifod")]
#[command(author, version, long_about = None)]
#[command(allow_negative_numbers = true)]
pub struct Cli {
    /// First workload input.
    #[arg(value_name = "FIRST", required_unless_present = "internal_worker")]
    pub first: Option<i32>,

    /// Second workload input.
    #[arg(value_name = "SECOND", required_unless_present = "internal_worker")]
    pub second: Option<i32>,

    /// Per-worker lifetime in seconds before the timeout escalation starts.
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL.
    #[arg(long, value_name = "SECS", default_value_t = 1)]
    pub grace: u64,

    /// Monitor loop interval in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    pub tick_ms: u64,

    /// Directory holding the named pipe endpoints.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub pipe_dir: PathBuf,

    /// Append-only lifecycle log file.
    #[arg(long, value_name = "PATH", env = "FIFOD_LOG_FILE", default_value = "fifod.log")]
    pub log_file: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, env = "FIFOD_LOG_FORMAT", default_value_t = LogFormatArg::Compact)]
    pub log_format: LogFormatArg,

    /// Run the supervisor in the foreground instead of daemonizing.
    #[arg(long)]
    pub foreground: bool,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Internal: run as a spawned worker process with the given role.
    #[arg(long, value_enum, value_name = "ROLE", hide = true)]
    pub internal_worker: Option<WorkerRole>,
}

/// Role a spawned worker process performs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerRole {
    /// Read the input pair, pick the larger value, write it to the result pipe.
    Compare,
    /// Read the result pipe and report the value.
    Report,
}

impl WorkerRole {
    /// Stable name used in spawn arguments, log fields, and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compare => "compare",
            Self::Report => "report",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormatArg {
    /// Human-readable multi-line output.
    Pretty,
    /// Single line per event.
    #[default]
    Compact,
    /// JSON lines.
    Json,
}

impl LogFormatArg {
    /// Value string accepted back by `--log-format`, for worker argv.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Tracing level derived from -v / --quiet.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }
        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }

    /// Cross-argument checks clap cannot express.
    ///
    /// The enforcer's grace wait must fit inside one monitor tick, otherwise a
    /// single escalation could stall the loop past its interval.
    pub fn validate(&self) -> Result<(), String> {
        if self.grace.saturating_mul(1000) >= self.tick_ms {
            return Err(format!(
                "--grace ({}s) must be shorter than --tick-ms ({}ms)",
                self.grace, self.tick_ms
            ));
        }
        Ok(())
    }
}
