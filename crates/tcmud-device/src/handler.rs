//! The command-handler seam and the positional-I/O backend.
//!
//! A handler turns one command into one response. SCSI-level failures
//! (bad CDB, backend I/O error) are encoded into the response and never
//! escape; an `Err` from a handler means the process has lost something
//! it cannot continue without, and the dispatcher tears down.

use std::io;
use std::os::unix::fs::FileExt;

use async_trait::async_trait;
use tcmud_ring::{ScsiCmd, ScsiResponse};

/// A structural handler failure. Per-command errors never take this path.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler lost a resource it cannot operate without.
    #[error("handler failure: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Creates an internal handler failure.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Handles SCSI commands for one device.
///
/// Called once per command by a dispatcher worker. The worker lends the
/// command a reusable scratch buffer through [`ScsiCmd::scratch`]; the
/// handler may replace it with a larger one.
#[async_trait]
pub trait ScsiCmdHandler: Send + Sync + 'static {
    /// Produces the response for `cmd`.
    ///
    /// # Errors
    ///
    /// Only for process-terminating failures; see [`HandlerError`].
    async fn handle_command(&self, cmd: &mut ScsiCmd) -> Result<ScsiResponse, HandlerError>;
}

/// Positional reads and writes against the volume's backing store.
///
/// Both calls may block the worker that invokes them; that is the
/// expected shape of backend I/O here.
pub trait BlockBackend: Send + Sync + 'static {
    /// Reads into `buf` starting at byte `offset`, returning the byte
    /// count actually read. A count short of `buf.len()` means the
    /// backing store ended early.
    ///
    /// # Errors
    ///
    /// Any I/O failure of the backing store.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Writes `buf` starting at byte `offset`, returning the byte count
    /// actually written.
    ///
    /// # Errors
    ///
    /// Any I/O failure of the backing store.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

/// Files serve as backing stores directly; reads and writes are retried
/// across partial transfers so a short result only ever means end of
/// file.
impl BlockBackend for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match FileExt::read_at(self, &mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match FileExt::write_at(self, &buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_backend_roundtrip() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 4096]).unwrap();

        let n = BlockBackend::write_at(&file, b"hello", 1024).unwrap();
        assert_eq!(n, 5);

        let mut out = [0u8; 5];
        let n = BlockBackend::read_at(&file, &mut out, 1024).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_file_backend_short_read_at_eof() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[7u8; 100]).unwrap();

        let mut out = [0u8; 64];
        let n = BlockBackend::read_at(&file, &mut out, 90).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&out[..10], &[7u8; 10]);
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::internal("allocation failed");
        assert!(err.to_string().contains("allocation failed"));
    }
}
