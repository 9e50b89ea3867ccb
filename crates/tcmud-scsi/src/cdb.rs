//! CDB decoding: command length, logical block address, transfer length.
//!
//! The length of a CDB is a function of its first byte (SPC-4 4.2.5.1); the
//! block address and transfer length then sit at family-specific offsets,
//! big-endian. The 6-byte family carries a quirk inherited from SBC: a block
//! address of zero means 256.

use crate::defs::op;

/// Errors produced while decoding a CDB.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CdbError {
    /// The first CDB byte falls in a range SPC-4 leaves undefined.
    #[error("operation code {0:#04x} has no defined CDB length")]
    UnsupportedOpcode(u8),

    /// The CDB slice is shorter than its own length field implies.
    #[error("CDB truncated: need {needed} bytes, have {len}")]
    Truncated {
        /// Bytes required to decode the field.
        needed: usize,
        /// Bytes actually present.
        len: usize,
    },

    /// The CDB family has no block address / transfer length fields.
    #[error("no block fields defined for a {0}-byte CDB")]
    UnsupportedLength(usize),
}

fn require(cdb: &[u8], needed: usize) -> Result<(), CdbError> {
    if cdb.len() < needed {
        return Err(CdbError::Truncated {
            needed,
            len: cdb.len(),
        });
    }
    Ok(())
}

/// Returns the length in bytes of the CDB starting at `cdb[0]`.
///
/// Variable-length CDBs (operation code `0x7f`) encode their total length
/// as `8 + cdb[7]`, so at least eight bytes must be present to size one.
///
/// # Errors
///
/// [`CdbError::UnsupportedOpcode`] for the undefined ranges
/// (`0x60..=0x7e`, `0xc0..=0xff`); [`CdbError::Truncated`] when the slice
/// is too short to carry the variable-length size byte.
pub fn cdb_len(cdb: &[u8]) -> Result<usize, CdbError> {
    require(cdb, 1)?;
    match cdb[0] {
        0x00..=0x1f => Ok(6),
        0x20..=0x5f => Ok(10),
        op::VARIABLE_LENGTH => {
            require(cdb, 8)?;
            Ok(8 + cdb[7] as usize)
        }
        0x80..=0x9f => Ok(16),
        0xa0..=0xbf => Ok(12),
        other => Err(CdbError::UnsupportedOpcode(other)),
    }
}

/// Returns the logical block address encoded in the CDB.
///
/// 6-byte CDBs store a 16-bit address at offset 2 where zero means block
/// 256; the 10- and 12-byte families store 32 bits at offset 2; the
/// 16-byte family stores 64 bits at offset 2.
///
/// # Errors
///
/// Propagates length decoding failures, and returns
/// [`CdbError::UnsupportedLength`] for families without block fields.
pub fn lba(cdb: &[u8]) -> Result<u64, CdbError> {
    require(cdb, 1)?;
    if cdb[0] == op::VARIABLE_LENGTH {
        // Variable-length CDBs carry no fixed-offset block fields, even
        // when their total length collides with a fixed family's.
        return Err(CdbError::UnsupportedLength(cdb_len(cdb)?));
    }
    match cdb_len(cdb)? {
        6 => {
            require(cdb, 4)?;
            let short = u16::from_be_bytes([cdb[2], cdb[3]]);
            Ok(if short == 0 { 256 } else { u64::from(short) })
        }
        10 | 12 => {
            require(cdb, 6)?;
            Ok(u64::from(u32::from_be_bytes([
                cdb[2], cdb[3], cdb[4], cdb[5],
            ])))
        }
        16 => {
            require(cdb, 10)?;
            Ok(u64::from_be_bytes([
                cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
            ]))
        }
        n => Err(CdbError::UnsupportedLength(n)),
    }
}

/// Returns the transfer length, in logical blocks, encoded in the CDB.
///
/// # Errors
///
/// Propagates length decoding failures, and returns
/// [`CdbError::UnsupportedLength`] for families without block fields.
pub fn transfer_len(cdb: &[u8]) -> Result<u32, CdbError> {
    require(cdb, 1)?;
    if cdb[0] == op::VARIABLE_LENGTH {
        return Err(CdbError::UnsupportedLength(cdb_len(cdb)?));
    }
    match cdb_len(cdb)? {
        6 => {
            require(cdb, 5)?;
            Ok(u32::from(cdb[4]))
        }
        10 => {
            require(cdb, 9)?;
            Ok(u32::from(u16::from_be_bytes([cdb[7], cdb[8]])))
        }
        12 => {
            require(cdb, 10)?;
            Ok(u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]))
        }
        16 => {
            require(cdb, 14)?;
            Ok(u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]))
        }
        n => Err(CdbError::UnsupportedLength(n)),
    }
}

/// Returns the service action code (low five bits of CDB byte 1).
///
/// # Errors
///
/// [`CdbError::Truncated`] when the CDB has no byte 1.
pub fn service_action(cdb: &[u8]) -> Result<u8, CdbError> {
    require(cdb, 2)?;
    Ok(cdb[1] & 0x1f)
}

/// CDB construction helpers.
///
/// Used by tests and by initiator-side tooling; the encodings mirror the
/// decoders above.
pub mod build {
    use crate::defs::{op, service_action};

    /// Builds a Test Unit Ready CDB.
    #[must_use]
    pub fn test_unit_ready() -> [u8; 6] {
        [op::TEST_UNIT_READY, 0, 0, 0, 0, 0]
    }

    /// Builds an Inquiry CDB with the given allocation length.
    #[must_use]
    pub fn inquiry(evpd: bool, page: u8, alloc_len: u16) -> [u8; 6] {
        let alloc = alloc_len.to_be_bytes();
        [
            op::INQUIRY,
            u8::from(evpd),
            page,
            alloc[0],
            alloc[1],
            0,
        ]
    }

    /// Builds a Read (6) CDB. The address is truncated to 16 bits and 256
    /// is encoded as zero, per the 6-byte family quirk.
    #[must_use]
    pub fn read_6(lba: u16, blocks: u8) -> [u8; 6] {
        let encoded = if lba == 256 { 0u16 } else { lba };
        let a = encoded.to_be_bytes();
        [op::READ_6, 0, a[0], a[1], blocks, 0]
    }

    /// Builds a Read (10) CDB.
    #[must_use]
    pub fn read_10(lba: u32, blocks: u16) -> [u8; 10] {
        let mut cdb = [0u8; 10];
        cdb[0] = op::READ_10;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        cdb
    }

    /// Builds a Read (12) CDB.
    #[must_use]
    pub fn read_12(lba: u32, blocks: u32) -> [u8; 12] {
        let mut cdb = [0u8; 12];
        cdb[0] = op::READ_12;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[6..10].copy_from_slice(&blocks.to_be_bytes());
        cdb
    }

    /// Builds a Read (16) CDB.
    #[must_use]
    pub fn read_16(lba: u64, blocks: u32) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = op::READ_16;
        cdb[2..10].copy_from_slice(&lba.to_be_bytes());
        cdb[10..14].copy_from_slice(&blocks.to_be_bytes());
        cdb
    }

    /// Builds a Write (10) CDB.
    #[must_use]
    pub fn write_10(lba: u32, blocks: u16) -> [u8; 10] {
        let mut cdb = read_10(lba, blocks);
        cdb[0] = op::WRITE_10;
        cdb
    }

    /// Builds a Write (16) CDB.
    #[must_use]
    pub fn write_16(lba: u64, blocks: u32) -> [u8; 16] {
        let mut cdb = read_16(lba, blocks);
        cdb[0] = op::WRITE_16;
        cdb
    }

    /// Builds a Mode Sense (6) CDB for the given page code.
    #[must_use]
    pub fn mode_sense_6(page: u8, alloc_len: u8) -> [u8; 6] {
        [op::MODE_SENSE_6, 0, page, 0, alloc_len, 0]
    }

    /// Builds a Mode Sense (10) CDB for the given page code.
    #[must_use]
    pub fn mode_sense_10(page: u8, alloc_len: u16) -> [u8; 10] {
        let mut cdb = [0u8; 10];
        cdb[0] = op::MODE_SENSE_10;
        cdb[2] = page;
        cdb[7..9].copy_from_slice(&alloc_len.to_be_bytes());
        cdb
    }

    /// Builds a Mode Select (6) CDB. `pf` and `sp` are the page-format and
    /// save-pages bits of byte 1.
    #[must_use]
    pub fn mode_select_6(pf: bool, sp: bool, param_len: u8) -> [u8; 6] {
        let flags = (u8::from(pf) << 4) | u8::from(sp);
        [op::MODE_SELECT_6, flags, 0, 0, param_len, 0]
    }

    /// Builds a Service Action In (16) CDB carrying Read Capacity (16).
    #[must_use]
    pub fn read_capacity_16(alloc_len: u32) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = op::SERVICE_ACTION_IN_16;
        cdb[1] = service_action::READ_CAPACITY_16;
        cdb[10..14].copy_from_slice(&alloc_len.to_be_bytes());
        cdb
    }
}
