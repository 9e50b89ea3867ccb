//! Typed access to the mailbox header and to ring entries.
//!
//! Entry field addresses are computed ring-relative and reduced modulo the
//! ring size, so an entry that straddles the ring boundary still reads and
//! writes correctly field by field (every field is 8-byte-aligned within
//! the entry and the ring size is a multiple of 8, so no single field is
//! split by the wrap).

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use crate::error::{Result, RingError};
use crate::layout::{self, OffsetProfile, ent_hdr};
use crate::region::SharedRegion;

/// The mailbox at the head of the shared mapping.
///
/// Cheap to clone; clones share the underlying region.
#[derive(Debug, Clone)]
pub struct Mailbox {
    region: Arc<SharedRegion>,
    cmdr_off: u32,
    cmdr_size: u32,
}

impl Mailbox {
    /// Reads and validates the mailbox header of `region`.
    ///
    /// # Errors
    ///
    /// [`RingError::MalformedMailbox`] when the advertised ring does not
    /// fit the mapping, is empty, or is not 8-byte-sized.
    pub fn new(region: Arc<SharedRegion>) -> Result<Self> {
        let cmdr_off = region.read_u32(layout::mailbox::CMDR_OFF)?;
        let cmdr_size = region.read_u32(layout::mailbox::CMDR_SIZE)?;
        if cmdr_size == 0 || cmdr_size % 8 != 0 {
            return Err(RingError::MalformedMailbox("bad command ring size"));
        }
        let end = u64::from(cmdr_off) + u64::from(cmdr_size);
        if end > region.len() as u64 {
            return Err(RingError::MalformedMailbox(
                "command ring extends past the mapping",
            ));
        }
        Ok(Self {
            region,
            cmdr_off,
            cmdr_size,
        })
    }

    /// Returns the shared region this mailbox lives in.
    #[must_use]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Mailbox protocol version.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn version(&self) -> Result<u16> {
        self.region.read_u16(layout::mailbox::VERSION)
    }

    /// Mailbox flags.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn flags(&self) -> Result<u16> {
        self.region.read_u16(layout::mailbox::FLAGS)
    }

    /// Byte offset of the command ring from the mailbox base.
    #[must_use]
    pub fn cmdr_offset(&self) -> u32 {
        self.cmdr_off
    }

    /// Byte size of the command ring.
    #[must_use]
    pub fn cmdr_size(&self) -> u32 {
        self.cmdr_size
    }

    /// Loads the kernel-owned producer index.
    ///
    /// Acquire-ordered: entries published before the head moved are
    /// visible after this returns.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn head(&self) -> Result<u32> {
        let head = self.region.read_u32(layout::mailbox::CMD_HEAD)?;
        fence(Ordering::Acquire);
        Ok(head)
    }

    /// Loads the shared consumer index.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn tail(&self) -> Result<u32> {
        self.region.read_u32(layout::mailbox::CMD_TAIL)
    }

    /// Stores the shared consumer index.
    ///
    /// Release-ordered: every response byte written before this call is
    /// visible to the kernel once the new tail is.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn set_tail(&self, tail: u32) -> Result<()> {
        fence(Ordering::Release);
        self.region.write_u32(layout::mailbox::CMD_TAIL, tail)
    }

    /// Absolute offset of an entry field, ring-relative and wrapped.
    fn ent_field(&self, ring_off: u32, field: usize) -> usize {
        let wrapped = (ring_off as usize + field) % self.cmdr_size as usize;
        self.cmdr_off as usize + wrapped
    }

    /// Reads the `len_op` word of the entry at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_len_op(&self, ring_off: u32) -> Result<u32> {
        self.region.read_u32(self.ent_field(ring_off, ent_hdr::LEN_OP))
    }

    /// Reads the command id of the entry at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_cmd_id(&self, ring_off: u32) -> Result<u16> {
        self.region.read_u16(self.ent_field(ring_off, ent_hdr::CMD_ID))
    }

    /// Overwrites the command id of the entry at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_set_cmd_id(&self, ring_off: u32, id: u16) -> Result<()> {
        self.region.write_u16(self.ent_field(ring_off, ent_hdr::CMD_ID), id)
    }

    /// Reads the kernel flags byte of the entry at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_kflags(&self, ring_off: u32) -> Result<u8> {
        self.region.read_u8(self.ent_field(ring_off, ent_hdr::KFLAGS))
    }

    /// Reads the userspace flags byte of the entry at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_uflags(&self, ring_off: u32) -> Result<u8> {
        self.region.read_u8(self.ent_field(ring_off, ent_hdr::UFLAGS))
    }

    /// Reads `req.iov_cnt` of the command entry at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_iov_cnt(&self, ring_off: u32, profile: &OffsetProfile) -> Result<u32> {
        self.region.read_u32(self.ent_field(ring_off, profile.iov_cnt))
    }

    /// Reads `req.cdb_off` (mailbox-relative CDB location) of the command
    /// entry at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_cdb_off(&self, ring_off: u32, profile: &OffsetProfile) -> Result<u64> {
        self.region.read_u64(self.ent_field(ring_off, profile.cdb_off))
    }

    /// Reads iovec `idx` of the command entry at `ring_off` as a
    /// `(mailbox offset, length)` pair.
    ///
    /// The base field carries a pointer-sized mailbox-relative offset.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_iovec(
        &self,
        ring_off: u32,
        profile: &OffsetProfile,
        idx: usize,
    ) -> Result<(u64, u64)> {
        let (base, len) = if profile.iov_size == 8 {
            (
                u64::from(self.region.read_u32(self.ent_field(ring_off, profile.iov_base(idx)))?),
                u64::from(self.region.read_u32(self.ent_field(ring_off, profile.iov_len(idx)))?),
            )
        } else {
            (
                self.region.read_u64(self.ent_field(ring_off, profile.iov_base(idx)))?,
                self.region.read_u64(self.ent_field(ring_off, profile.iov_len(idx)))?,
            )
        };
        Ok((base, len))
    }

    /// Writes the SCSI status byte of the response at `ring_off`.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_set_status(&self, ring_off: u32, profile: &OffsetProfile, status: u8) -> Result<()> {
        self.region.write_u8(self.ent_field(ring_off, profile.resp_status), status)
    }

    /// Copies sense data into the response at `ring_off`, zero-padding the
    /// unused tail of the 96-byte sense buffer.
    ///
    /// # Errors
    ///
    /// Propagates region bounds failures.
    pub fn ent_write_sense(
        &self,
        ring_off: u32,
        profile: &OffsetProfile,
        sense: &[u8],
    ) -> Result<()> {
        let n = sense.len().min(tcmud_scsi::SENSE_BUFFER_SIZE);
        let base = profile.resp_sense;
        // Field-by-field wrapping applies to the sense area too; write it
        // in two spans only if the ring boundary cuts it.
        let start = self.ent_field(ring_off, base);
        let linear_room = self.cmdr_size as usize - ((ring_off as usize + base) % self.cmdr_size as usize);
        if tcmud_scsi::SENSE_BUFFER_SIZE <= linear_room {
            self.region.write_bytes(start, &sense[..n])?;
            self.region.fill(start + n, tcmud_scsi::SENSE_BUFFER_SIZE - n, 0)?;
        } else {
            for (i, byte) in sense[..n]
                .iter()
                .copied()
                .chain(std::iter::repeat(0))
                .take(tcmud_scsi::SENSE_BUFFER_SIZE)
                .enumerate()
            {
                self.region.write_u8(self.ent_field(ring_off, base + i), byte)?;
            }
        }
        Ok(())
    }
}
