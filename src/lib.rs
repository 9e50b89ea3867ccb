//! tcmud: emulate SCSI block devices in userspace through the Linux
//! TCM-User (LIO) kernel interface.
//!
//! The kernel delivers SCSI commands over a shared-memory ring; this
//! workspace decodes them, emulates a direct-access device against any
//! positional-I/O backend, and completes the commands back to the kernel.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tcmud::prelude::*;
//!
//! // See `tcmud_device::Device::open` for serving a backing file as a
//! // block device.
//! ```

pub use tcmud_device as device;
pub use tcmud_ring as ring;
pub use tcmud_scsi as scsi;

/// Prelude module for common imports.
pub mod prelude {
    pub use tcmud_device::{
        BlockBackend, BlockEmulator, DataSizes, Device, DeviceConfig, DeviceError, InquiryData,
        NaaWwn, ScsiCmdHandler,
    };
    pub use tcmud_ring::{ScsiCmd, ScsiResponse};
}
