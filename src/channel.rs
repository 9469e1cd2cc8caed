//! Named-pipe channel transport.
//!
//! Two FIFOs move the workload between processes: the input channel carries
//! the two integers from the supervisor to the compare worker, and the result
//! channel carries the larger value from the compare worker to the report
//! worker. Opening an endpoint blocks until the peer opens the other side, so
//! every transfer is a rendezvous.
//!
//! Payloads are fixed-size native-endian byte images (both ends always run on
//! the same host). They are far below PIPE_BUF, so a successful write is
//! atomic; `read_exact`/`write_all` turn any short transfer into a hard error.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::error::{FifodError, Result};

/// Input channel endpoint name under the pipe directory.
pub const INPUT_FIFO_NAME: &str = "input.fifo";

/// Result channel endpoint name under the pipe directory.
pub const RESULT_FIFO_NAME: &str = "result.fifo";

/// Byte length of the input payload (two i32 values).
pub const INPUT_PAYLOAD_LEN: usize = 8;

/// Byte length of the result payload (one i32 value).
pub const RESULT_PAYLOAD_LEN: usize = 4;

/// Path of the input channel endpoint.
pub fn input_path(pipe_dir: &Path) -> PathBuf {
    pipe_dir.join(INPUT_FIFO_NAME)
}

/// Path of the result channel endpoint.
pub fn result_path(pipe_dir: &Path) -> PathBuf {
    pipe_dir.join(RESULT_FIFO_NAME)
}

/// The two-integer payload seeded by the supervisor and read once by the
/// compare worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPayload {
    pub first: i32,
    pub second: i32,
}

impl InputPayload {
    pub fn new(first: i32, second: i32) -> Self {
        Self { first, second }
    }

    fn to_bytes(self) -> [u8; INPUT_PAYLOAD_LEN] {
        let mut buf = [0u8; INPUT_PAYLOAD_LEN];
        buf[..4].copy_from_slice(&self.first.to_ne_bytes());
        buf[4..].copy_from_slice(&self.second.to_ne_bytes());
        buf
    }

    fn from_bytes(buf: [u8; INPUT_PAYLOAD_LEN]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[..4]);
        let first = i32::from_ne_bytes(word);
        word.copy_from_slice(&buf[4..]);
        let second = i32::from_ne_bytes(word);
        Self { first, second }
    }

    /// Write the full payload, failing on any short transfer.
    pub fn write_to(self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Read the full payload, failing on any short transfer.
    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; INPUT_PAYLOAD_LEN];
        reader.read_exact(&mut buf)?;
        Ok(Self::from_bytes(buf))
    }
}

/// The single-integer result payload written once by the compare worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultPayload(pub i32);

impl ResultPayload {
    pub fn write_to(self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.0.to_ne_bytes())
    }

    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; RESULT_PAYLOAD_LEN];
        reader.read_exact(&mut buf)?;
        Ok(Self(i32::from_ne_bytes(buf)))
    }
}

/// Open an endpoint for reading. Blocks until a writer opens the same channel.
pub fn open_read(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

/// Open an endpoint for writing. Blocks until a reader opens the same channel.
pub fn open_write(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).open(path)
}

/// Attempt a non-blocking write open.
///
/// Returns `Ok(None)` while no reader has the channel open yet (ENXIO), so a
/// caller can poll without ever parking on the rendezvous. The returned file
/// keeps O_NONBLOCK set, which cannot bite for payloads this far under
/// PIPE_BUF.
pub fn try_open_write(path: &Path) -> io::Result<Option<File>> {
    match OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ENXIO as i32) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Both named endpoints of the transport, owned by the supervisor.
///
/// Creation removes stale endpoints from a previous run; dropping the pair
/// unlinks both paths.
#[derive(Debug)]
pub struct ChannelPair {
    input: PathBuf,
    result: PathBuf,
}

impl ChannelPair {
    /// Create both FIFOs under `pipe_dir`.
    pub fn create(pipe_dir: &Path) -> Result<Self> {
        let pair = Self {
            input: input_path(pipe_dir),
            result: result_path(pipe_dir),
        };
        create_endpoint(&pair.input)?;
        if let Err(e) = create_endpoint(&pair.result) {
            // Leave nothing half-created behind
            let _ = fs::remove_file(&pair.input);
            return Err(e);
        }
        Ok(pair)
    }

    /// Unlink both endpoints. Missing files are not an error.
    pub fn remove(&self) {
        for path in [&self.input, &self.result] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove channel endpoint");
                }
            }
        }
    }
}

impl Drop for ChannelPair {
    fn drop(&mut self) {
        self.remove();
    }
}

fn create_endpoint(path: &Path) -> Result<()> {
    // A FIFO left over from an earlier run would make mkfifo fail with EEXIST
    if path.exists() {
        fs::remove_file(path).map_err(|e| FifodError::ChannelSetup {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    mkfifo(path, Mode::from_bits_truncate(0o644)).map_err(|e| FifodError::ChannelSetup {
        path: path.to_path_buf(),
        source: io::Error::from_raw_os_error(e as i32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_input_payload_round_trip() {
        let mut buf = Vec::new();
        InputPayload::new(5, 2).write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), INPUT_PAYLOAD_LEN);
        let decoded = InputPayload::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, InputPayload::new(5, 2));

        let mut buf = Vec::new();
        InputPayload::new(i32::MIN, -3).write_to(&mut buf).unwrap();
        let decoded = InputPayload::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.first, i32::MIN);
        assert_eq!(decoded.second, -3);
    }

    #[test]
    fn test_result_payload_round_trip() {
        let mut buf = Vec::new();
        ResultPayload(-42).write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), RESULT_PAYLOAD_LEN);
        let decoded = ResultPayload::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, ResultPayload(-42));
    }

    #[test]
    fn test_short_read_is_an_error() {
        let buf = [0u8; 3];
        let err = ResultPayload::read_from(&mut buf.as_ref()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_create_makes_both_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let pair = ChannelPair::create(dir.path()).unwrap();

        for path in [&pair.input, &pair.result] {
            let meta = fs::metadata(path).unwrap();
            assert!(meta.file_type().is_fifo(), "{} is not a fifo", path.display());
        }
    }

    #[test]
    fn test_drop_removes_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let input;
        let result;
        {
            let pair = ChannelPair::create(dir.path()).unwrap();
            input = pair.input.clone();
            result = pair.result.clone();
        }
        assert!(!input.exists());
        assert!(!result.exists());
    }

    #[test]
    fn test_create_replaces_stale_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(input_path(dir.path()), b"stale").unwrap();

        let pair = ChannelPair::create(dir.path()).unwrap();
        let meta = fs::metadata(&pair.input).unwrap();
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn test_create_fails_in_missing_dir() {
        let err = ChannelPair::create(Path::new("/nonexistent-fifod-dir")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("input.fifo"));
    }

    #[test]
    fn test_try_open_write_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let pair = ChannelPair::create(dir.path()).unwrap();
        assert!(try_open_write(&pair.input).unwrap().is_none());
    }

    #[test]
    fn test_rendezvous_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let pair = ChannelPair::create(dir.path()).unwrap();
        let path = pair.input.clone();

        let reader = thread::spawn(move || {
            let mut file = open_read(&path).unwrap();
            InputPayload::read_from(&mut file).unwrap()
        });

        // Poll until the reader side has the channel open
        let mut writer = loop {
            if let Some(file) = try_open_write(&pair.input).unwrap() {
                break file;
            }
            thread::sleep(Duration::from_millis(5));
        };
        InputPayload::new(-7, 11).write_to(&mut writer).unwrap();
        drop(writer);

        assert_eq!(reader.join().unwrap(), InputPayload::new(-7, 11));
    }
}
