//! Daemonization with an explicit readiness handshake.
//!
//! [`launch`] performs the classic detach (fork, new session, fork again,
//! stdio onto /dev/null, cwd to /) and runs the supplied continuation in the
//! detached process. The continuation receives a [`ReadySignal`] it must
//! consume once setup succeeds or fails; the launching process blocks on the
//! other end of that pipe, so setup failures surface as a nonzero launcher
//! exit even though they happen after the fork. If the daemon dies without
//! reporting, the launcher sees EOF and treats it the same way.
//!
//! Messages on the handshake pipe are JSON-serialized and newline-delimited.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;

use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, dup2, fork, getpid, pipe2, setsid};
use serde::{Deserialize, Serialize};

use crate::error::{FifodError, Result};

/// Handshake message the daemon writes to its launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReadyReport {
    /// Setup finished; the supervisor is running with this pid.
    #[serde(rename = "ready")]
    Ready { pid: i32 },

    /// Setup failed before the supervisor came up.
    #[serde(rename = "failed")]
    Failed { message: String },
}

impl ReadyReport {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ReadyReport serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Write end of the handshake pipe, held by the daemon continuation until
/// setup either succeeds or fails.
///
/// Dropping the signal without reporting closes the pipe, which the launcher
/// treats as a daemonization failure.
pub struct ReadySignal {
    pipe: File,
}

impl ReadySignal {
    /// Report successful setup and the daemon's pid to the launcher.
    pub fn ready(mut self) {
        let line = ReadyReport::Ready {
            pid: getpid().as_raw(),
        }
        .to_line();
        let _ = self.pipe.write_all(line.as_bytes());
    }

    /// Report a setup failure. The launcher relays the message and exits
    /// nonzero.
    pub fn failed(mut self, message: &str) {
        let line = ReadyReport::Failed {
            message: message.to_string(),
        }
        .to_line();
        let _ = self.pipe.write_all(line.as_bytes());
    }
}

/// Pid of a successfully started daemon, as seen by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonHandle {
    pub pid: Pid,
}

/// Fork into the background and run `daemon` there.
///
/// Returns in the launching process once the daemon has reported in. The
/// continuation runs in the detached process; its return value becomes the
/// daemon's exit code. This function never returns in the daemon itself.
///
/// Relative paths the daemon needs must be resolved before calling this: the
/// detached process changes its working directory to `/`.
pub fn launch<F>(daemon: F) -> Result<DaemonHandle>
where
    F: FnOnce(ReadySignal) -> i32,
{
    // CLOEXEC so worker processes spawned by the daemon cannot hold the
    // handshake pipe open past their exec
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| FifodError::Daemonize(format!("handshake pipe failed: {e}")))?;

    match unsafe { fork() }
        .map_err(|e| FifodError::Daemonize(format!("first fork failed: {e}")))?
    {
        ForkResult::Parent { child } => {
            drop(tx);
            let report = wait_for_report(BufReader::new(File::from(rx)));
            // The intermediate child exits as soon as it has forked the daemon
            let _ = waitpid(child, None);
            match report? {
                ReadyReport::Ready { pid } => Ok(DaemonHandle {
                    pid: Pid::from_raw(pid),
                }),
                ReadyReport::Failed { message } => Err(FifodError::Daemonize(message)),
            }
        }
        ForkResult::Child => {
            drop(rx);
            // New session, then a second fork so the daemon is not a session
            // leader and can never reacquire a controlling terminal
            if setsid().is_err() {
                unsafe { libc::_exit(1) }
            }
            match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                Ok(ForkResult::Child) => {}
                Err(_) => unsafe { libc::_exit(1) },
            }
            detach_stdio();
            let _ = std::env::set_current_dir("/");

            let code = daemon(ReadySignal {
                pipe: File::from(tx),
            });
            std::process::exit(code);
        }
    }
}

fn wait_for_report(mut reader: impl BufRead) -> Result<ReadyReport> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| FifodError::Daemonize(format!("reading readiness report: {e}")))?;
    if n == 0 {
        return Err(FifodError::Daemonize(
            "daemon exited before reporting readiness".to_string(),
        ));
    }
    Ok(ReadyReport::from_line(&line)?)
}

/// Point fds 0..2 at /dev/null so nothing in the daemon can touch the
/// launcher's terminal.
fn detach_stdio() {
    if let Ok(null) = File::options().read(true).write(true).open("/dev/null") {
        let fd = null.as_raw_fd();
        for target in 0..=2 {
            let _ = dup2(fd, target);
        }
    }
}
