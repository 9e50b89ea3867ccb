//! Discovery and mapping of the TCM-User uio character device.
//!
//! The kernel surfaces each enabled TCM-User backstore as a uio node whose
//! sysfs `name` attribute reads `tcm-user/<hba>/<volume>/<config>`.
//! Discovery walks the uio class directory for the entry whose config
//! matches ours, opens the matching `/dev/uioN`, reads the map size from
//! sysfs, and maps the region read-write shared.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use nix::sys::mman::{MapFlags, ProtFlags, mmap};
use tcmud_ring::SharedRegion;
use tokio::io::unix::AsyncFd;

use crate::error::{DeviceError, Result};

/// Where the kernel lists uio devices.
pub const UIO_CLASS_DIR: &str = "/sys/class/uio";
/// Where the uio character devices live.
pub const UIO_DEV_DIR: &str = "/dev";

/// The parsed `name` attribute of a TCM-User uio node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UioName {
    /// The HBA component.
    pub hba: String,
    /// The volume component.
    pub volume: String,
    /// The device config string.
    pub config: String,
}

/// Parses a uio `name` attribute of the form
/// `tcm-user/<hba>/<volume>/<config>`. Returns `None` for nodes that
/// belong to other drivers.
#[must_use]
pub fn parse_uio_name(raw: &str) -> Option<UioName> {
    let mut parts = raw.trim_end_matches('\n').splitn(4, '/');
    if parts.next()? != "tcm-user" {
        return None;
    }
    Some(UioName {
        hba: parts.next()?.to_string(),
        volume: parts.next()?.to_string(),
        config: parts.next()?.to_string(),
    })
}

/// Parses the `maps/map0/size` attribute, which sysfs reports in hex
/// (`0x...`) but is also accepted in decimal.
#[must_use]
pub fn parse_map_size(raw: &str) -> Option<usize> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// A discovered TCM-User uio node, not yet opened.
#[derive(Debug, Clone)]
pub struct UioDevice {
    /// The node name, e.g. `uio3`.
    pub uio: String,
    /// The parsed name attribute.
    pub name: UioName,
}

/// Finds the uio node advertising `config_string`.
///
/// # Errors
///
/// [`DeviceError::Discovery`] when no node matches; I/O failures reading
/// the class directory itself.
pub fn find_device(config_string: &str) -> Result<UioDevice> {
    find_device_in(Path::new(UIO_CLASS_DIR), config_string)
}

fn find_device_in(class_dir: &Path, config_string: &str) -> Result<UioDevice> {
    for entry in std::fs::read_dir(class_dir)? {
        let entry = entry?;
        let uio = entry.file_name().to_string_lossy().into_owned();
        let name_path = class_dir.join(&uio).join("name");
        let Ok(raw) = std::fs::read_to_string(&name_path) else {
            continue;
        };
        let Some(name) = parse_uio_name(&raw) else {
            tracing::debug!(%uio, "not a tcm-user device");
            continue;
        };
        if name.config != config_string {
            tracing::debug!(%uio, config = %name.config, "not our tcm-user device");
            continue;
        }
        return Ok(UioDevice { uio, name });
    }
    Err(DeviceError::Discovery {
        config: config_string.to_string(),
    })
}

/// An opened uio device: the non-blocking poll fd, a duplicate for waking
/// the kernel, and the mapped shared region.
#[derive(Debug)]
pub struct UioChannel {
    pub(crate) poll_fd: AsyncFd<File>,
    pub(crate) wake_fd: OwnedFd,
    pub(crate) region: Arc<SharedRegion>,
}

impl UioChannel {
    /// Wraps an already-open descriptor and region. The descriptor must
    /// be non-blocking; tests hand in one end of a socketpair here.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Failures duplicating or registering the descriptor.
    pub fn from_parts(fd: OwnedFd, region: Arc<SharedRegion>) -> Result<Self> {
        let wake_fd = fd.try_clone().map_err(DeviceError::Uio)?;
        let poll_fd = AsyncFd::new(File::from(fd)).map_err(DeviceError::Uio)?;
        Ok(Self {
            poll_fd,
            wake_fd,
            region,
        })
    }

    /// The shared region this channel maps.
    #[must_use]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

/// Opens and maps a discovered uio device.
///
/// # Errors
///
/// Failures opening the character device, reading the map size, or
/// mapping the region.
pub fn open_device(dev: &UioDevice) -> Result<UioChannel> {
    open_device_at(Path::new(UIO_DEV_DIR), Path::new(UIO_CLASS_DIR), dev)
}

fn open_device_at(dev_dir: &Path, class_dir: &Path, dev: &UioDevice) -> Result<UioChannel> {
    let dev_path = dev_dir.join(&dev.uio);
    // O_CLOEXEC comes with std; O_NONBLOCK keeps the poll loop async.
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&dev_path)
        .map_err(|source| DeviceError::OpenUio {
            path: dev_path.clone(),
            source,
        })?;

    let size_path = class_dir.join(&dev.uio).join("maps/map0/size");
    let raw = std::fs::read_to_string(&size_path).map_err(|source| DeviceError::Sysfs {
        path: size_path.clone(),
        source,
    })?;
    let map_size = parse_map_size(&raw).ok_or_else(|| DeviceError::Sysfs {
        path: size_path,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable map size"),
    })?;

    let region = map_shared(&file, map_size)?;
    tracing::debug!(uio = %dev.uio, map_size, "mapped tcm-user device");
    UioChannel::from_parts(OwnedFd::from(file), region)
}

fn map_shared(file: &File, map_size: usize) -> Result<Arc<SharedRegion>> {
    let len = NonZeroUsize::new(map_size)
        .ok_or_else(|| DeviceError::Mmap(nix::Error::EINVAL))?;
    // SAFETY: mapping a fresh range chosen by the kernel; nothing else in
    // this process references it yet.
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(DeviceError::Mmap)?;
    // SAFETY: `ptr` is a live MAP_SHARED mapping of `map_size` bytes and
    // the region becomes its sole owner.
    let region = unsafe { SharedRegion::from_mmap(ptr.cast(), map_size) };
    Ok(Arc::new(region))
}
