//! World Wide Name generation for the emulated device and its loopback
//! nexus.

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// A World Wide Name in the Network Address Authority format.
///
/// Two identifiers derive from it: one names the device itself, the other
/// the loopback nexus the kernel creates for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaaWwn {
    /// The first six hex digits of an IEEE Organizationally Unique
    /// Identifier, in ASCII, e.g. `"05abcd"`.
    pub oui: String,
    /// Eight hex digits of vendor-specific identity, e.g. a serial number.
    pub vendor_id: String,
    /// Sixteen more hex digits, when the vendor needs them; selects the
    /// `naa.6` registered-extended format.
    #[serde(default)]
    pub vendor_id_ext: String,
}

impl NaaWwn {
    /// A WWN seeded from the volume name, for targets that do not carry
    /// an assigned identity.
    #[must_use]
    pub fn from_volume(volume_name: &str) -> Self {
        Self {
            oui: "000000".to_string(),
            vendor_id: generate_serial(volume_name),
            vendor_id_ext: String::new(),
        }
    }

    /// The identifier of the emulated device.
    #[must_use]
    pub fn device_id(&self) -> String {
        self.gen_id("0")
    }

    /// The identifier of the loopback nexus.
    #[must_use]
    pub fn nexus_id(&self) -> String {
        self.gen_id("1")
    }

    fn gen_id(&self, discriminator: &str) -> String {
        let naa = if self.vendor_id_ext.len() == 16 {
            "naa.6"
        } else {
            "naa.5"
        };
        format!(
            "{naa}{}{discriminator}{}{}",
            self.oui, self.vendor_id, self.vendor_id_ext
        )
    }

    /// Checks the field lengths and hex alphabet.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.oui.len() != 6 {
            return Err(DeviceError::Config(
                "WWN OUI needs to be exactly 6 hex characters".into(),
            ));
        }
        if self.vendor_id.len() != 8 {
            return Err(DeviceError::Config(
                "WWN vendor id needs to be exactly 8 hex characters".into(),
            ));
        }
        if !self.vendor_id_ext.is_empty() && self.vendor_id_ext.len() != 16 {
            return Err(DeviceError::Config(
                "WWN vendor id extension needs to be zero or 16 hex characters".into(),
            ));
        }
        let fields = [&self.oui, &self.vendor_id, &self.vendor_id_ext];
        if fields
            .iter()
            .any(|f| !f.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(DeviceError::Config(
                "WWN fields must be hex characters".into(),
            ));
        }
        Ok(())
    }
}

/// Derives a stable 8-hex-character serial from a name.
#[must_use]
pub fn generate_serial(name: &str) -> String {
    let digest = md5::compute(name.as_bytes());
    format!("{digest:x}")[..8].to_string()
}
