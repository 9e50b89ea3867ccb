//! Device configuration.
//!
//! Validated up front: a bad block size or volume name fails here with a
//! clear message instead of surfacing later as a kernel provisioning error.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};
use crate::wwn::NaaWwn;

/// Geometry of the emulated volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSizes {
    /// Total volume size in bytes.
    pub volume_size: u64,
    /// Logical block size in bytes.
    pub block_size: u32,
}

impl DataSizes {
    /// Number of logical blocks on the volume.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.volume_size / u64::from(self.block_size)
    }
}

/// Identity strings reported by the standard Inquiry response.
///
/// Fields are space-padded or truncated to their wire widths (8, 16, and
/// 4 bytes respectively).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InquiryData {
    /// T10 vendor identification.
    pub vendor_id: String,
    /// Product identification.
    pub product_id: String,
    /// Product revision level.
    pub product_rev: String,
}

impl Default for InquiryData {
    fn default() -> Self {
        Self {
            vendor_id: "tcmud".to_string(),
            product_id: "TCMU Device".to_string(),
            product_rev: "0001".to_string(),
        }
    }
}

/// Everything needed to provision and emulate one volume.
///
/// The emulator receives this record by shared reference; it is immutable
/// for the lifetime of the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Volume name; also the name of the created block device node.
    pub volume_name: String,

    /// Volume and block sizes.
    pub sizes: DataSizes,

    /// The loopback HBA number for the emulated device.
    #[serde(default = "default_hba")]
    pub hba: u32,

    /// The LUN under the loopback target.
    #[serde(default)]
    pub lun: u32,

    /// The SCSI World Wide Name of the device.
    pub wwn: NaaWwn,

    /// Identity strings for the standard Inquiry response.
    #[serde(default)]
    pub inquiry: InquiryData,

    /// Whether Mode Sense reports the Write Cache Enabled bit.
    #[serde(default)]
    pub write_cache: bool,

    /// Number of command workers (at least 1).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Directory for the created block device node.
    #[serde(default = "default_dev_path")]
    pub dev_path: PathBuf,
}

fn default_hba() -> u32 {
    30
}

fn default_workers() -> usize {
    2
}

fn default_dev_path() -> PathBuf {
    PathBuf::from("/dev/tcmud")
}

impl DeviceConfig {
    /// A configuration with stock identity for a volume of the given
    /// geometry: HBA 30, LUN 0, a WWN seeded from the volume name, two
    /// workers, write cache off.
    #[must_use]
    pub fn basic(volume_name: impl Into<String>, sizes: DataSizes) -> Self {
        let volume_name = volume_name.into();
        let wwn = NaaWwn::from_volume(&volume_name);
        Self {
            volume_name,
            sizes,
            hba: default_hba(),
            lun: 0,
            wwn,
            inquiry: InquiryData::default(),
            write_cache: false,
            workers: default_workers(),
            dev_path: default_dev_path(),
        }
    }

    /// The config string written to configfs and matched during uio
    /// discovery; it also appears in the vendor-specific EVPD descriptor.
    #[must_use]
    pub fn config_string(&self) -> String {
        format!("tcmud//{}", self.volume_name)
    }

    /// Checks the configuration for values the kernel or the emulator
    /// cannot work with.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.volume_name.is_empty() || self.volume_name.contains('/') {
            return Err(DeviceError::Config(
                "volume name must be non-empty and free of '/'".into(),
            ));
        }
        if self.sizes.block_size == 0 || !self.sizes.block_size.is_power_of_two() {
            return Err(DeviceError::Config(
                "block size must be a power of two".into(),
            ));
        }
        if self.sizes.volume_size == 0
            || self.sizes.volume_size % u64::from(self.sizes.block_size) != 0
        {
            return Err(DeviceError::Config(
                "volume size must be a non-zero multiple of the block size".into(),
            ));
        }
        if self.workers == 0 {
            return Err(DeviceError::Config("worker count must be at least 1".into()));
        }
        self.wwn.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> DataSizes {
        DataSizes {
            volume_size: 1024 * 1024 * 1024,
            block_size: 1024,
        }
    }

    #[test]
    fn test_basic_config_validates() {
        let config = DeviceConfig::basic("testvol", sizes());
        assert!(config.validate().is_ok());
        assert_eq!(config.config_string(), "tcmud//testvol");
        assert_eq!(config.sizes.block_count(), 1024 * 1024);
    }

    #[test]
    fn test_rejects_bad_volume_name() {
        let mut config = DeviceConfig::basic("testvol", sizes());
        config.volume_name = "a/b".into();
        assert!(config.validate().is_err());
        config.volume_name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let mut config = DeviceConfig::basic("testvol", sizes());
        config.sizes.block_size = 1000;
        assert!(config.validate().is_err());
        config.sizes.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_volume_size() {
        let mut config = DeviceConfig::basic("testvol", sizes());
        config.sizes.volume_size = 1024 * 1024 + 13;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = DeviceConfig::basic("testvol", sizes());
        config.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip_defaults() {
        let json = r#"{
            "volume_name": "vol0",
            "sizes": { "volume_size": 1048576, "block_size": 512 },
            "wwn": { "oui": "000000", "vendor_id": "2416c05f" }
        }"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hba, 30);
        assert_eq!(config.workers, 2);
        assert!(!config.write_cache);
        assert_eq!(config.inquiry.vendor_id, "tcmud");
        assert!(config.validate().is_ok());
    }
}
