//! Error types for fifod.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for fifod.
#[derive(Error, Debug)]
pub enum FifodError {
    #[error("Failed to create channel endpoint {path}: {source}")]
    ChannelSetup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Daemonization failed: {0}")]
    Daemonize(String),

    #[error("Worker table is full (capacity {capacity})")]
    TableFull { capacity: usize },

    #[error("Worker with pid {0} is already registered")]
    DuplicateWorker(i32),

    #[error("Failed to spawn {role} worker: {source}")]
    Spawn {
        role: &'static str,
        source: std::io::Error,
    },

    #[error("Transport failure while {phase}: {source}")]
    Transport {
        phase: &'static str,
        source: std::io::Error,
    },

    #[error("Failed to install signal watcher: {0}")]
    SignalWatcher(std::io::Error),

    #[error("Readiness handshake failed: {0}")]
    Handshake(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Result type alias for fifod operations.
pub type Result<T> = std::result::Result<T, FifodError>;
