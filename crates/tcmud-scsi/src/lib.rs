// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # tcmud-scsi
//!
//! Pure SCSI material for the tcmud workspace: operation codes, SAM status
//! codes, sense keys and additional sense codes, CDB length/address/transfer
//! decoding, and fixed-format sense-buffer construction.
//!
//! Nothing in this crate touches the kernel or shared memory; it is the
//! reference vocabulary the transport (`tcmud-ring`) and the emulator
//! (`tcmud-device`) are written against.
//!
//! Codes follow SPC-4 / SBC-3; additional sense codes are catalogued at
//! <https://www.t10.org/lists/asc-num.txt>.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cdb;
pub mod defs;
pub mod sense;

pub use cdb::{CdbError, cdb_len, lba, service_action, transfer_len};
pub use sense::{SENSE_BUFFER_SIZE, fixed_sense};
