//! Byte offsets and packing rules for the mailbox and its ring entries.
//!
//! The kernel's `struct tcmu_cmd_entry` embeds `struct iovec`, whose two
//! fields are pointer-sized, so the request-payload offsets differ between
//! 32-bit and 64-bit architectures. Both profiles are carried here; the
//! one matching the build target is the default. To port to a new ABI,
//! dump the struct offsets from C and add a profile.

use crate::error::RingError;

/// Mailbox field offsets from the start of the mapping.
pub mod mailbox {
    /// `version : u16`.
    pub const VERSION: usize = 0;
    /// `flags : u16`.
    pub const FLAGS: usize = 2;
    /// `cmdr_off : u32` - ring start, bytes from mailbox base.
    pub const CMDR_OFF: usize = 4;
    /// `cmdr_size : u32` - ring size in bytes.
    pub const CMDR_SIZE: usize = 8;
    /// `cmd_head : u32` - kernel-owned producer index, ring-relative.
    pub const CMD_HEAD: usize = 12;
    /// `cmd_tail : u32` - userspace-owned consumer index, ring-relative.
    pub const CMD_TAIL: usize = 64;
}

/// Entry header field offsets from the start of an entry.
pub mod ent_hdr {
    /// `len_op : u32` - entry length in the high bits, opcode in the low 3.
    pub const LEN_OP: usize = 0;
    /// `cmd_id : u16`.
    pub const CMD_ID: usize = 4;
    /// `kflags : u8`.
    pub const KFLAGS: usize = 6;
    /// `uflags : u8`.
    pub const UFLAGS: usize = 7;
}

/// Set in `uflags` when userspace did not understand an entry's opcode.
pub const UFLAG_UNKNOWN_OP: u8 = 0x01;

/// Offset of the request/response union from the start of an entry.
pub const ENT_PAYLOAD_OFF: usize = 8;

/// Entry opcodes, carried in the low three bits of `len_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOp {
    /// Filler inserted by the kernel so commands need not wrap mid-entry.
    Pad,
    /// A SCSI command awaiting a response.
    Cmd,
}

impl EntryOp {
    /// Decodes the opcode bits of a `len_op` word.
    ///
    /// # Errors
    ///
    /// [`RingError::UnknownEntryOpcode`] for opcodes this process does not
    /// speak; `ring_off` is only for the error report.
    pub fn decode(len_op: u32, ring_off: u32) -> Result<Self, RingError> {
        match len_op & 0x7 {
            0 => Ok(Self::Pad),
            1 => Ok(Self::Cmd),
            op => Err(RingError::UnknownEntryOpcode { op, ring_off }),
        }
    }
}

/// Extracts the entry length in bytes from a `len_op` word.
#[must_use]
pub const fn entry_len(len_op: u32) -> u32 {
    len_op & !0x7
}

/// Packs an entry length and opcode into a `len_op` word. Used by tests
/// and ring tooling; the kernel is the producer in live operation.
#[must_use]
pub const fn pack_len_op(len: u32, op: u32) -> u32 {
    (len & !0x7) | (op & 0x7)
}

/// Request- and response-payload offsets for one pointer width.
///
/// All offsets are from the start of the entry (header included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetProfile {
    /// `req.iov_cnt : u32`.
    pub iov_cnt: usize,
    /// `req.iov_bidi_cnt : u32`.
    pub iov_bidi_cnt: usize,
    /// `req.iov_dif_cnt : u32`.
    pub iov_dif_cnt: usize,
    /// `req.cdb_off : u64` - CDB location, bytes from mailbox base.
    pub cdb_off: usize,
    /// `req.iov[0].iov_base`.
    pub iov0_base: usize,
    /// `req.iov[0].iov_len`.
    pub iov0_len: usize,
    /// `sizeof(struct iovec)`.
    pub iov_size: usize,
    /// `rsp.scsi_status : u8`.
    pub resp_status: usize,
    /// `rsp.sense_buffer : [u8; 96]`.
    pub resp_sense: usize,
}

/// Offsets for 64-bit pointer targets.
pub const PROFILE_64: OffsetProfile = OffsetProfile {
    iov_cnt: ENT_PAYLOAD_OFF,
    iov_bidi_cnt: ENT_PAYLOAD_OFF + 4,
    iov_dif_cnt: ENT_PAYLOAD_OFF + 8,
    cdb_off: ENT_PAYLOAD_OFF + 16,
    iov0_base: ENT_PAYLOAD_OFF + 40,
    iov0_len: ENT_PAYLOAD_OFF + 48,
    iov_size: 16,
    resp_status: ENT_PAYLOAD_OFF,
    resp_sense: ENT_PAYLOAD_OFF + 8,
};

/// Offsets for 32-bit pointer targets (verified on arm).
pub const PROFILE_32: OffsetProfile = OffsetProfile {
    iov_cnt: ENT_PAYLOAD_OFF,
    iov_bidi_cnt: ENT_PAYLOAD_OFF + 4,
    iov_dif_cnt: ENT_PAYLOAD_OFF + 8,
    cdb_off: ENT_PAYLOAD_OFF + 16,
    iov0_base: ENT_PAYLOAD_OFF + 40,
    iov0_len: ENT_PAYLOAD_OFF + 44,
    iov_size: 8,
    resp_status: ENT_PAYLOAD_OFF,
    resp_sense: ENT_PAYLOAD_OFF + 8,
};

impl OffsetProfile {
    /// Returns the profile matching the build target's pointer width.
    #[must_use]
    pub const fn native() -> Self {
        #[cfg(target_pointer_width = "64")]
        {
            PROFILE_64
        }
        #[cfg(target_pointer_width = "32")]
        {
            PROFILE_32
        }
    }

    /// Offset of iovec `idx`'s base field from the start of the entry.
    #[must_use]
    pub const fn iov_base(&self, idx: usize) -> usize {
        self.iov0_base + idx * self.iov_size
    }

    /// Offset of iovec `idx`'s length field from the start of the entry.
    #[must_use]
    pub const fn iov_len(&self, idx: usize) -> usize {
        self.iov0_len + idx * self.iov_size
    }
}

impl Default for OffsetProfile {
    fn default() -> Self {
        Self::native()
    }
}
