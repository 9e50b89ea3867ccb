//! Completing commands back into the ring and waking the kernel.

use std::io::Write;
use std::os::fd::OwnedFd;

use tcmud_scsi::defs::status;

use crate::cmd::ScsiResponse;
use crate::error::{Result, RingError};
use crate::layout::{EntryOp, OffsetProfile, entry_len};
use crate::mailbox::Mailbox;

/// Writes responses into ring entries, advances the shared `cmd_tail`, and
/// wakes the kernel through the uio file descriptor.
///
/// Completions are applied in the order commands were pulled from the
/// ring: the oldest non-pad entry at the shared tail is the one being
/// completed. The entry's stored id is cross-checked against the response
/// and repaired if they ever disagree.
#[derive(Debug)]
pub struct RingWriter {
    mailbox: Mailbox,
    profile: OffsetProfile,
    wake_fd: std::fs::File,
}

impl RingWriter {
    /// Creates a writer that wakes the kernel through `wake_fd`.
    #[must_use]
    pub fn new(mailbox: Mailbox, profile: OffsetProfile, wake_fd: OwnedFd) -> Self {
        Self {
            mailbox,
            profile,
            wake_fd: std::fs::File::from(wake_fd),
        }
    }

    /// Fills in the response fields of the oldest pending entry and
    /// advances the shared tail past it (skipping pads on the way).
    ///
    /// All payload writes land before the tail store, which is
    /// release-ordered; the kernel may reclaim the entry as soon as it
    /// observes the new tail.
    ///
    /// # Errors
    ///
    /// Ring protocol violations, as for the reader.
    pub fn complete(&mut self, resp: &ScsiResponse) -> Result<()> {
        let size = self.mailbox.cmdr_size();
        let mut tail = self.mailbox.tail()?;
        loop {
            let len_op = self.mailbox.ent_len_op(tail)?;
            let len = entry_len(len_op);
            if len == 0 {
                return Err(RingError::BadEntryLength { ring_off: tail });
            }
            match EntryOp::decode(len_op, tail)? {
                EntryOp::Pad => {
                    tail = (tail + len) % size;
                    self.mailbox.set_tail(tail)?;
                }
                EntryOp::Cmd => {
                    let stored = self.mailbox.ent_cmd_id(tail)?;
                    if stored != resp.id() {
                        // Cannot happen while completions stay in pull
                        // order; repair the entry but make the anomaly
                        // loud.
                        tracing::warn!(
                            stored,
                            response = resp.id(),
                            ring_off = tail,
                            "completion id does not match ring entry, repairing"
                        );
                        self.mailbox.ent_set_cmd_id(tail, resp.id())?;
                    }
                    self.mailbox.ent_set_status(tail, &self.profile, resp.status())?;
                    if resp.status() != status::GOOD {
                        let sense = resp.sense().map_or(&[][..], |s| &s[..]);
                        self.mailbox.ent_write_sense(tail, &self.profile, sense)?;
                    }
                    self.mailbox.set_tail((tail + len) % size)?;
                    return Ok(());
                }
            }
        }
    }

    /// Wakes the kernel with a 4-byte write to the uio file descriptor.
    ///
    /// # Errors
    ///
    /// [`RingError::Wake`] when the write fails or comes up short.
    pub fn wake(&self) -> Result<()> {
        let buf = [0u8; 4];
        let n = (&self.wake_fd).write(&buf).map_err(RingError::Wake)?;
        if n != buf.len() {
            return Err(RingError::Wake(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write to uio fd",
            )));
        }
        Ok(())
    }
}
