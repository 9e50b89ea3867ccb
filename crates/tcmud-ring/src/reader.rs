//! Draining command entries from the ring.

use tcmud_scsi::{cdb, defs::op};

use crate::cmd::{IoVec, ScsiCmd};
use crate::error::{Result, RingError};
use crate::layout::{EntryOp, OffsetProfile, entry_len};
use crate::mailbox::Mailbox;

/// Walks the ring from a private tail up to the kernel's head, yielding
/// decoded commands and silently stepping over pad entries.
///
/// The reader never touches the shared `cmd_tail`: the kernel may reuse an
/// entry's storage only once the shared tail crosses it, and that happens
/// at completion time in the [`crate::RingWriter`].
#[derive(Debug)]
pub struct RingReader {
    mailbox: Mailbox,
    profile: OffsetProfile,
    local_tail: u32,
}

impl RingReader {
    /// Creates a reader starting at the current shared tail.
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn new(mailbox: Mailbox, profile: OffsetProfile) -> Result<Self> {
        let local_tail = mailbox.tail()?;
        Ok(Self {
            mailbox,
            profile,
            local_tail,
        })
    }

    /// The reader's private consumer index (ring-relative bytes).
    #[must_use]
    pub fn local_tail(&self) -> u32 {
        self.local_tail
    }

    fn advance(&mut self, len: u32) {
        self.local_tail = (self.local_tail + len) % self.mailbox.cmdr_size();
    }

    /// Returns the next command between the private tail and the kernel's
    /// head, or `None` when the ring is drained.
    ///
    /// # Errors
    ///
    /// Any [`RingError`] here is a protocol violation and fatal to the
    /// poll loop: an opcode this process does not speak, an entry that
    /// cannot advance the ring, or payload fields pointing outside the
    /// mapping.
    pub fn next_command(&mut self) -> Result<Option<ScsiCmd>> {
        loop {
            if self.local_tail == self.mailbox.head()? {
                return Ok(None);
            }
            let ring_off = self.local_tail;
            let len_op = self.mailbox.ent_len_op(ring_off)?;
            let len = entry_len(len_op);
            if len == 0 {
                return Err(RingError::BadEntryLength { ring_off });
            }
            match EntryOp::decode(len_op, ring_off)? {
                EntryOp::Pad => {
                    tracing::trace!(ring_off, len, "skipping pad entry");
                    self.advance(len);
                }
                EntryOp::Cmd => {
                    let cmd = self.decode_cmd(ring_off, len)?;
                    self.advance(len);
                    return Ok(Some(cmd));
                }
            }
        }
    }

    fn decode_cmd(&self, ring_off: u32, ent_len: u32) -> Result<ScsiCmd> {
        let region = self.mailbox.region();
        let id = self.mailbox.ent_cmd_id(ring_off)?;

        let cdb_off = usize::try_from(self.mailbox.ent_cdb_off(ring_off, &self.profile)?)
            .map_err(|_| RingError::MalformedEntry {
                ring_off,
                reason: "CDB offset exceeds the address width",
            })?;
        let cdb_len = self.cdb_len_at(cdb_off)?;
        let mut cdb_bytes = vec![0u8; cdb_len];
        region.read_bytes(cdb_off, &mut cdb_bytes)?;

        let iov_cnt = self.mailbox.ent_iov_cnt(ring_off, &self.profile)? as usize;
        if self.profile.iov_base(iov_cnt) > ent_len as usize {
            return Err(RingError::MalformedEntry {
                ring_off,
                reason: "iovec array exceeds the entry length",
            });
        }
        let mut vecs = Vec::with_capacity(iov_cnt);
        for idx in 0..iov_cnt {
            let (base, len) = self.mailbox.ent_iovec(ring_off, &self.profile, idx)?;
            let (offset, len) = match (usize::try_from(base), usize::try_from(len)) {
                (Ok(o), Ok(l)) => (o, l),
                _ => {
                    return Err(RingError::MalformedEntry {
                        ring_off,
                        reason: "iovec exceeds the address width",
                    });
                }
            };
            region.check(offset, len)?;
            vecs.push(IoVec { offset, len });
        }

        tracing::trace!(id, cdb_len, iov_cnt, "decoded command entry");
        Ok(ScsiCmd::new(id, cdb_bytes, vecs, std::sync::Arc::clone(region)))
    }

    /// Sizes the CDB at a mailbox offset: the first byte fixes the family,
    /// and variable-length CDBs carry their size in byte 7.
    fn cdb_len_at(&self, cdb_off: usize) -> Result<usize> {
        let region = self.mailbox.region();
        let mut probe = [0u8; 8];
        probe[0] = region.read_u8(cdb_off)?;
        if probe[0] == op::VARIABLE_LENGTH {
            probe[7] = region.read_u8(cdb_off + 7)?;
        }
        Ok(cdb::cdb_len(&probe)?)
    }
}
