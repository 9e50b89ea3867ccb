//! Error types for the ring protocol.
//!
//! Every variant here is a structural failure: either the kernel handed us
//! a region we cannot interpret, or the transport itself failed. Per-command
//! SCSI failures never surface as a `RingError`; they become check-condition
//! responses instead.

use tcmud_scsi::CdbError;

/// Result type alias for ring operations.
pub type Result<T> = std::result::Result<T, RingError>;

/// Errors raised while interpreting or updating the shared-memory ring.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// An access fell outside the mapped region.
    #[error("access at offset {offset} (+{len}) outside region of {size} bytes")]
    OutOfBounds {
        /// Starting byte offset of the access.
        offset: usize,
        /// Length of the access in bytes.
        len: usize,
        /// Total region size.
        size: usize,
    },

    /// The mailbox header describes a ring this process cannot use.
    #[error("malformed mailbox: {0}")]
    MalformedMailbox(&'static str),

    /// An entry carried an opcode this process does not understand.
    #[error("unknown entry opcode {op} at ring offset {ring_off}")]
    UnknownEntryOpcode {
        /// The low three bits of the entry's `len_op` word.
        op: u32,
        /// Ring-relative offset of the offending entry.
        ring_off: u32,
    },

    /// An entry declared a length that cannot advance the ring.
    #[error("zero-length entry at ring offset {ring_off}")]
    BadEntryLength {
        /// Ring-relative offset of the offending entry.
        ring_off: u32,
    },

    /// An entry's payload contradicts its own header.
    #[error("malformed entry at ring offset {ring_off}: {reason}")]
    MalformedEntry {
        /// Ring-relative offset of the offending entry.
        ring_off: u32,
        /// What did not add up.
        reason: &'static str,
    },

    /// The CDB a command points at cannot be sized.
    #[error("bad CDB in command entry: {0}")]
    Cdb(#[from] CdbError),

    /// Waking the kernel through the uio file descriptor failed.
    #[error("failed to wake kernel: {0}")]
    Wake(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RingError::OutOfBounds {
            offset: 100,
            len: 8,
            size: 64,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("64"));

        let err = RingError::UnknownEntryOpcode { op: 5, ring_off: 16 };
        assert!(err.to_string().contains("opcode 5"));
    }

    #[test]
    fn test_cdb_error_converts() {
        let err = RingError::from(CdbError::UnsupportedOpcode(0x60));
        assert!(matches!(err, RingError::Cdb(_)));
        assert!(err.to_string().contains("0x60"));
    }
}
