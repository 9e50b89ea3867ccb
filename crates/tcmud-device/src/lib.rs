// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # tcmud-device
//!
//! The device side of the tcmud workspace: provisioning a TCM-User
//! backstore over configfs, discovering and mapping its uio node, running
//! the command pipeline, and emulating a SCSI direct-access device over
//! any positional-I/O backend.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tcmud_device::{BlockEmulator, DataSizes, Device, DeviceConfig};
//!
//! # async fn run() -> Result<(), tcmud_device::DeviceError> {
//! let file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("/var/lib/volumes/vol0.img")?;
//! let sizes = DataSizes { volume_size: 1 << 30, block_size: 512 };
//! let config = DeviceConfig::basic("vol0", sizes);
//! let emulator = Arc::new(BlockEmulator::new(file, Arc::new(config.clone())));
//!
//! let device = Device::open(config, emulator).await?;
//! // ... /dev/tcmud/vol0 now exists ...
//! device.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod dispatch;
pub mod emulate;
pub mod error;
pub mod handler;
mod provision;
pub mod uio;
pub mod wwn;

pub use config::{DataSizes, DeviceConfig, InquiryData};
pub use device::Device;
pub use dispatch::Dispatcher;
pub use emulate::BlockEmulator;
pub use error::{DeviceError, Result};
pub use handler::{BlockBackend, HandlerError, ScsiCmdHandler};
pub use uio::UioChannel;
pub use wwn::{NaaWwn, generate_serial};
