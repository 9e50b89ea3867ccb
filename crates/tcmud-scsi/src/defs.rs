//! SCSI operation codes, status codes, sense keys, and additional sense codes.
//!
//! Only the subset the emulator and its callers reference is carried here;
//! find the full catalogues in the SPC-4 and SBC-3 documents.

/// SCSI operation codes (the first CDB byte).
pub mod op {
    /// Test Unit Ready - check if the unit is ready (6-byte).
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// Request Sense (6-byte).
    pub const REQUEST_SENSE: u8 = 0x03;
    /// Read (6-byte).
    pub const READ_6: u8 = 0x08;
    /// Write (6-byte).
    pub const WRITE_6: u8 = 0x0a;
    /// Inquiry - device identification (6-byte).
    pub const INQUIRY: u8 = 0x12;
    /// Mode Select (6-byte).
    pub const MODE_SELECT_6: u8 = 0x15;
    /// Mode Sense (6-byte).
    pub const MODE_SENSE_6: u8 = 0x1a;
    /// Start Stop Unit (6-byte).
    pub const START_STOP: u8 = 0x1b;
    /// Read Capacity (10-byte).
    pub const READ_CAPACITY_10: u8 = 0x25;
    /// Read (10-byte).
    pub const READ_10: u8 = 0x28;
    /// Write (10-byte).
    pub const WRITE_10: u8 = 0x2a;
    /// Synchronize Cache (10-byte).
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    /// Unmap (10-byte).
    pub const UNMAP: u8 = 0x42;
    /// Mode Select (10-byte).
    pub const MODE_SELECT_10: u8 = 0x55;
    /// Mode Sense (10-byte).
    pub const MODE_SENSE_10: u8 = 0x5a;
    /// Variable-length CDB; actual length at byte 7.
    pub const VARIABLE_LENGTH: u8 = 0x7f;
    /// Read (16-byte).
    pub const READ_16: u8 = 0x88;
    /// Write (16-byte).
    pub const WRITE_16: u8 = 0x8a;
    /// Write Same (16-byte).
    pub const WRITE_SAME_16: u8 = 0x93;
    /// Service Action In (16-byte); action code in CDB byte 1.
    pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
    /// Report LUNs (12-byte).
    pub const REPORT_LUNS: u8 = 0xa0;
    /// Read (12-byte).
    pub const READ_12: u8 = 0xa8;
    /// Write (12-byte).
    pub const WRITE_12: u8 = 0xaa;
}

/// Service action codes for Service Action In (16).
pub mod service_action {
    /// Read Capacity (16).
    pub const READ_CAPACITY_16: u8 = 0x10;
    /// Get LBA Status.
    pub const GET_LBA_STATUS: u8 = 0x12;
}

/// SCSI Architecture Model (SAM-3) status codes.
pub mod status {
    /// Command completed without error.
    pub const GOOD: u8 = 0x00;
    /// Sense data is available describing the failure.
    pub const CHECK_CONDITION: u8 = 0x02;
    /// Condition met for a search-type command.
    pub const CONDITION_MET: u8 = 0x04;
    /// The logical unit is busy.
    pub const BUSY: u8 = 0x08;
    /// A reservation conflict blocked the command.
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    /// The task set is full.
    pub const TASK_SET_FULL: u8 = 0x28;
    /// The task was aborted.
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Sense keys (byte 2 of fixed-format sense data).
pub mod sense_key {
    /// No sense information.
    pub const NO_SENSE: u8 = 0x00;
    /// Recovered error.
    pub const RECOVERED_ERROR: u8 = 0x01;
    /// The unit is not ready.
    pub const NOT_READY: u8 = 0x02;
    /// Unrecoverable medium error.
    pub const MEDIUM_ERROR: u8 = 0x03;
    /// Non-recoverable hardware failure.
    pub const HARDWARE_ERROR: u8 = 0x04;
    /// Illegal request (bad CDB or parameter list).
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    /// Unit attention condition.
    pub const UNIT_ATTENTION: u8 = 0x06;
    /// The medium is write-protected.
    pub const DATA_PROTECT: u8 = 0x07;
    /// The command was aborted.
    pub const ABORTED_COMMAND: u8 = 0x0b;
}

/// Additional sense code / qualifier pairs, packed big-endian (ASC in the
/// high byte, ASCQ in the low byte) as they appear in sense bytes 12-13.
pub mod asc {
    /// Invalid command operation code.
    pub const INVALID_COMMAND_OPERATION_CODE: u16 = 0x2000;
    /// Unrecovered read error.
    pub const READ_ERROR: u16 = 0x1100;
    /// Parameter list length error.
    pub const PARAMETER_LIST_LENGTH_ERROR: u16 = 0x1a00;
    /// Invalid field in CDB.
    pub const INVALID_FIELD_IN_CDB: u16 = 0x2400;
    /// Invalid field in parameter list.
    pub const INVALID_FIELD_IN_PARAMETER_LIST: u16 = 0x2600;
    /// Internal target failure.
    pub const INTERNAL_TARGET_FAILURE: u16 = 0x4400;
}
