// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # tcmud-ring
//!
//! The shared-memory command-ring protocol spoken between the TCM-User
//! kernel module and this process.
//!
//! The kernel exposes a mailbox at the start of a memory-mapped region; the
//! mailbox describes a circular command ring of variable-length entries.
//! The kernel is the single producer (advancing `cmd_head`), this process
//! the single consumer (advancing `cmd_tail`). Entries are 8-byte aligned
//! and the low three bits of each entry's length word carry its opcode, so
//! a ring walk needs nothing but the mailbox and byte-offset arithmetic.
//!
//! Layout reference: `struct tcmu_mailbox` / `struct tcmu_cmd_entry` in
//! `include/uapi/linux/target_core_user.h`.
//!
//! # Safety
//!
//! The region is arranged by the kernel, not by this process, so all field
//! access goes through [`region::SharedRegion`]'s bounds-checked byte-offset
//! readers and writers rather than pointer casts. The only unsafe code in
//! this crate is the raw-pointer plumbing inside that type.

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod cmd;
pub mod error;
pub mod layout;
pub mod mailbox;
pub mod reader;
pub mod region;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
pub mod writer;

pub use cmd::{DataBufferError, IoVec, ScsiCmd, ScsiResponse};
pub use error::{Result, RingError};
pub use layout::{EntryOp, OffsetProfile};
pub use mailbox::Mailbox;
pub use reader::RingReader;
pub use region::SharedRegion;
pub use writer::RingWriter;
