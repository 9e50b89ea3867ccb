//! Configfs provisioning of the TCM-User backstore, the loopback SCSI
//! target in front of it, and the block device node.
//!
//! The kernel creates and destroys objects as directories appear and
//! disappear under configfs, so "writing a file" here has side effects
//! well beyond the file. Everything this module creates is remembered and
//! unwound in reverse during teardown, with a per-path timeout because
//! configfs removal can hang on a wedged target.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::stat::{Mode, SFlag, makedev, mknod};

use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};

const CONFIGFS_CORE_DIR: &str = "/sys/kernel/config/target/core";
const LOOPBACK_DIR: &str = "/sys/kernel/config/target/loopback";
const SCSI_DEVICES_DIR: &str = "/sys/bus/scsi/devices";

const BLOCK_DEVICE_WAIT: Duration = Duration::from_secs(1);
const BLOCK_DEVICE_ATTEMPTS: u32 = 30;
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates and tears down the kernel-side plumbing for one device.
#[derive(Debug)]
pub(crate) struct Provisioner {
    config: Arc<DeviceConfig>,
    hba_dir: PathBuf,
    to_clean: HashSet<PathBuf>,
}

impl Provisioner {
    pub(crate) fn new(config: Arc<DeviceConfig>) -> Self {
        let hba_dir = PathBuf::from(format!("{CONFIGFS_CORE_DIR}/user_{}", config.hba));
        Self {
            config,
            hba_dir,
            to_clean: HashSet::new(),
        }
    }

    fn volume_dir(&self) -> PathBuf {
        self.hba_dir.join(&self.config.volume_name)
    }

    fn tpgt_dir(&self) -> PathBuf {
        Path::new(LOOPBACK_DIR)
            .join(self.config.wwn.device_id())
            .join("tpgt_1")
    }

    fn lun_dir(&self) -> PathBuf {
        self.tpgt_dir()
            .join("lun")
            .join(format!("lun_{}", self.config.lun))
    }

    fn dev_node(&self) -> PathBuf {
        self.config.dev_path.join(&self.config.volume_name)
    }

    /// Creates the backstore and enables it, at which point the kernel
    /// surfaces the uio device.
    pub(crate) fn pre_enable(&mut self) -> Result<()> {
        let control = self.volume_dir().join("control");
        self.write_lines(
            &control,
            &[
                format!("dev_size={}", self.config.sizes.volume_size),
                format!("dev_config={}", self.config.config_string()),
                format!("hw_block_size={}", self.config.sizes.block_size),
                "async=1".to_string(),
            ],
        )?;
        let enable = self.volume_dir().join("enable");
        self.write_lines(&enable, &["1".to_string()])
    }

    /// Builds the loopback target over the enabled backstore and creates
    /// the block device node once the kernel surfaces the SCSI device.
    pub(crate) async fn post_enable(&mut self) -> Result<()> {
        let tpgt = self.tpgt_dir();
        let nexus = self.config.wwn.nexus_id();
        self.write_lines(&tpgt.join("nexus"), &[nexus])?;

        let lun_dir = self.lun_dir();
        let link = lun_dir.join(&self.config.volume_name);
        if !lun_dir.exists() {
            tracing::debug!(path = %lun_dir.display(), "creating lun directory");
            std::fs::create_dir_all(&lun_dir).map_err(|source| DeviceError::Configfs {
                path: lun_dir.clone(),
                source,
            })?;
            self.to_clean.insert(lun_dir.clone());
            self.to_clean.insert(link.clone());
        }

        tracing::debug!(
            link = %link.display(),
            target = %self.volume_dir().display(),
            "linking lun to the backstore"
        );
        std::os::unix::fs::symlink(self.volume_dir(), &link).map_err(|source| {
            DeviceError::Configfs {
                path: link.clone(),
                source,
            }
        })?;
        self.to_clean.insert(self.volume_dir());

        self.create_dev_entry().await
    }

    async fn create_dev_entry(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.dev_path)?;
        let dev = self.dev_node();
        if dev.exists() {
            return Err(DeviceError::DeviceExists(dev));
        }
        self.to_clean.insert(dev.clone());

        let address_path = self.tpgt_dir().join("address");
        let address = std::fs::read_to_string(&address_path).map_err(|source| {
            DeviceError::Sysfs {
                path: address_path,
                source,
            }
        })?;
        let address = address.trim().to_string();
        let pattern = format!("{SCSI_DEVICES_DIR}/{address}*/block/*/dev");

        let mut matches = Vec::new();
        for attempt in 0..BLOCK_DEVICE_ATTEMPTS {
            matches = find_block_dev_attrs(Path::new(SCSI_DEVICES_DIR), &address);
            if !matches.is_empty() {
                break;
            }
            tracing::debug!(%address, attempt, "waiting for the SCSI block device");
            tokio::time::sleep(BLOCK_DEVICE_WAIT).await;
        }
        if matches.is_empty() {
            return Err(DeviceError::BlockDeviceTimeout { pattern });
        }
        if matches.len() > 1 {
            return Err(DeviceError::AmbiguousBlockDevice {
                pattern,
                count: matches.len(),
            });
        }

        let raw = std::fs::read_to_string(&matches[0]).map_err(|source| DeviceError::Sysfs {
            path: matches[0].clone(),
            source,
        })?;
        let (major, minor) = parse_major_minor(&raw).ok_or_else(|| DeviceError::Sysfs {
            path: matches[0].clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid major:minor string {raw:?}"),
            ),
        })?;

        tracing::debug!(dev = %dev.display(), major, minor, "creating block device node");
        make_block_node(&dev, major, minor)
    }

    /// Unwinds everything this provisioner created, leaf first. Individual
    /// failures are logged and do not stop the rest of the unwind.
    pub(crate) async fn teardown(&mut self) -> Result<()> {
        let lun_dir = self.lun_dir();
        let tpgt = self.tpgt_dir();
        let naa_dir = Path::new(LOOPBACK_DIR).join(self.config.wwn.device_id());
        let paths = [
            lun_dir.join(&self.config.volume_name),
            lun_dir,
            tpgt,
            naa_dir,
            self.volume_dir(),
        ];

        for path in paths {
            if self.to_clean.contains(&path) {
                if let Err(err) = remove_with_timeout(&path).await {
                    tracing::error!(%err, path = %path.display(), "failed to remove");
                }
            }
        }

        // The node should disappear with the target; take it out if the
        // kernel left it behind.
        let dev = self.dev_node();
        if dev.exists() && self.to_clean.contains(&dev) {
            remove_with_timeout(&dev).await?;
        }
        Ok(())
    }

    /// Writes `lines` to `target` one write per line, creating (and
    /// remembering) the parent directory when configfs has not made it
    /// yet.
    fn write_lines(&mut self, target: &Path, lines: &[String]) -> Result<()> {
        if let Some(dir) = target.parent() {
            match std::fs::metadata(dir) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %dir.display(), "creating directory");
                    std::fs::create_dir_all(dir).map_err(|source| DeviceError::Configfs {
                        path: dir.to_path_buf(),
                        source,
                    })?;
                    self.to_clean.insert(dir.to_path_buf());
                }
                Err(source) => {
                    return Err(DeviceError::Configfs {
                        path: dir.to_path_buf(),
                        source,
                    });
                }
                Ok(meta) if !meta.is_dir() => {
                    return Err(DeviceError::Configfs {
                        path: dir.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "not a directory",
                        ),
                    });
                }
                Ok(_) => {}
            }
        }

        for line in lines {
            tracing::debug!(path = %target.display(), line, "setting configfs attribute");
            std::fs::write(target, format!("{line}\n")).map_err(|source| {
                tracing::error!(path = %target.display(), line, "configfs write failed");
                DeviceError::Configfs {
                    path: target.to_path_buf(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

/// Resolves `<devices>/<address>*/block/*/dev`, the sysfs attribute
/// carrying the block device's major:minor pair.
fn find_block_dev_attrs(devices_dir: &Path, address: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(devices_dir) else {
        return found;
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(address) {
            continue;
        }
        let block_dir = entry.path().join("block");
        let Ok(blocks) = std::fs::read_dir(&block_dir) else {
            continue;
        };
        for block in blocks.flatten() {
            let dev_attr = block.path().join("dev");
            if dev_attr.exists() {
                found.push(dev_attr);
            }
        }
    }
    found
}

fn parse_major_minor(raw: &str) -> Option<(u64, u64)> {
    let (major, minor) = raw.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn make_block_node(path: &Path, major: u64, minor: u64) -> Result<()> {
    mknod(
        path,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o600),
        makedev(major, minor),
    )
    .map_err(|source| DeviceError::Mknod {
        path: path.to_path_buf(),
        source,
    })
}

async fn remove_with_timeout(path: &Path) -> Result<()> {
    tracing::debug!(path = %path.display(), "removing");
    let target = path.to_path_buf();
    let task = tokio::task::spawn_blocking(move || remove_path(&target));
    match tokio::time::timeout(REMOVE_TIMEOUT, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(DeviceError::Task(join.to_string())),
        Err(_elapsed) => Err(DeviceError::RemoveTimeout(path.to_path_buf())),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSizes;

    fn provisioner() -> Provisioner {
        Provisioner::new(Arc::new(DeviceConfig::basic(
            "testvol",
            DataSizes {
                volume_size: 1 << 20,
                block_size: 512,
            },
        )))
    }

    #[test]
    fn test_paths_follow_config() {
        let prov = provisioner();
        assert_eq!(
            prov.volume_dir(),
            PathBuf::from("/sys/kernel/config/target/core/user_30/testvol")
        );
        assert!(prov.tpgt_dir().starts_with("/sys/kernel/config/target/loopback/naa.5"));
        assert!(prov.tpgt_dir().ends_with("tpgt_1"));
        assert!(prov.lun_dir().ends_with("lun/lun_0"));
        assert_eq!(prov.dev_node(), PathBuf::from("/dev/tcmud/testvol"));
    }

    #[test]
    fn test_write_lines_creates_parent_and_writes_each_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut prov = provisioner();
        let target = dir.path().join("nested").join("control");

        prov.write_lines(&target, &["dev_size=1048576".to_string(), "async=1".to_string()])
            .unwrap();

        // Each line is a separate truncating write, so the last one is
        // what remains on a plain filesystem.
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "async=1\n");
        assert!(prov.to_clean.contains(&dir.path().join("nested")));
    }

    #[test]
    fn test_write_lines_rejects_non_directory_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, "x").unwrap();
        let mut prov = provisioner();
        let result = prov.write_lines(&file.join("control"), &["1".to_string()]);
        assert!(matches!(result, Err(DeviceError::Configfs { .. })));
    }

    #[test]
    fn test_parse_major_minor() {
        assert_eq!(parse_major_minor("8:16\n"), Some((8, 16)));
        assert_eq!(parse_major_minor(" 259:3 "), Some((259, 3)));
        assert_eq!(parse_major_minor("816"), None);
        assert_eq!(parse_major_minor("a:b"), None);
    }

    #[test]
    fn test_find_block_dev_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let attr = dir.path().join("2:0:0:0").join("block").join("sdb").join("dev");
        std::fs::create_dir_all(attr.parent().unwrap()).unwrap();
        std::fs::write(&attr, "8:16\n").unwrap();
        // A neighbour on another address must not match.
        let other = dir.path().join("3:0:0:0").join("block").join("sdc").join("dev");
        std::fs::create_dir_all(other.parent().unwrap()).unwrap();
        std::fs::write(&other, "8:32\n").unwrap();

        let found = find_block_dev_attrs(dir.path(), "2:0:0");
        assert_eq!(found, vec![attr]);
        assert!(find_block_dev_attrs(dir.path(), "9:0:0").is_empty());
    }

    #[tokio::test]
    async fn test_remove_with_timeout_handles_files_dirs_and_absences() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        remove_with_timeout(&file).await.unwrap();
        assert!(!file.exists());

        let sub = dir.path().join("d");
        std::fs::create_dir(&sub).unwrap();
        remove_with_timeout(&sub).await.unwrap();
        assert!(!sub.exists());

        remove_with_timeout(&dir.path().join("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_skips_unmarked_paths() {
        // Nothing was provisioned, so teardown must touch nothing and
        // succeed.
        let mut prov = provisioner();
        prov.teardown().await.unwrap();
    }
}
