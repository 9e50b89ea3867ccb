//! Error types for device setup and operation.

use std::path::PathBuf;

use tcmud_ring::RingError;

use crate::handler::HandlerError;

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised while provisioning, attaching, or running a device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device configuration failed validation.
    #[error("invalid device configuration: {0}")]
    Config(String),

    /// No uio device advertises this device's config string.
    #[error("no uio device found for config {config:?} (is the target enabled?)")]
    Discovery {
        /// The config string discovery searched for.
        config: String,
    },

    /// A sysfs attribute could not be read or made sense of.
    #[error("failed to read sysfs attribute {}: {source}", .path.display())]
    Sysfs {
        /// The attribute path.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// A configfs write failed during provisioning.
    #[error("failed to write configfs entry {}: {source}", .path.display())]
    Configfs {
        /// The configfs path.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The uio character device could not be opened.
    #[error("failed to open uio device {}: {source}", .path.display())]
    OpenUio {
        /// The character device path.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Mapping the shared region failed.
    #[error("failed to map the shared region: {0}")]
    Mmap(#[source] nix::Error),

    /// Creating the block device node failed.
    #[error("mknod of {} failed: {source}", .path.display())]
    Mknod {
        /// The device node path.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: nix::Error,
    },

    /// The target block device node already exists.
    #[error("device {} already exists, can not create", .0.display())]
    DeviceExists(PathBuf),

    /// The kernel never surfaced the block device for this target.
    #[error("timed out waiting for a block device matching {pattern}")]
    BlockDeviceTimeout {
        /// The sysfs glob that was polled.
        pattern: String,
    },

    /// More than one block device answered to this target's address.
    #[error("found {count} block devices matching {pattern}, expected one")]
    AmbiguousBlockDevice {
        /// The sysfs glob that was polled.
        pattern: String,
        /// How many attributes matched.
        count: usize,
    },

    /// A provisioned path would not go away during teardown.
    #[error("timed out removing {}", .0.display())]
    RemoveTimeout(PathBuf),

    /// Reading the wake counter from the uio fd failed.
    #[error("uio poll failed: {0}")]
    Uio(#[source] std::io::Error),

    /// A ring protocol violation; fatal to the dispatcher.
    #[error(transparent)]
    Ring(#[from] RingError),

    /// The command handler failed structurally; fatal to the dispatcher.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// A dispatcher task aborted or panicked.
    #[error("dispatcher task failed: {0}")]
    Task(String),

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DeviceError::Discovery {
            config: "tcmud//vol".into(),
        };
        assert!(err.to_string().contains("tcmud//vol"));

        let err = DeviceError::Config("worker count must be at least 1".into());
        assert!(err.to_string().contains("worker count"));
    }

    #[test]
    fn test_ring_error_converts() {
        let err = DeviceError::from(RingError::MalformedMailbox("bad command ring size"));
        assert!(matches!(err, DeviceError::Ring(_)));
    }
}
