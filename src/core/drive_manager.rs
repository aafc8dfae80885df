//! Discovery, mounting, unlocking and capacity checks for backup drives.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::devices::DeviceTree;
use crate::core::hardware::{DriveAdapter, FsUsage};
use crate::core::home::{HomeSelection, directory_size};
use crate::core::models::DriveInfo;
use crate::error::{Error, MountError, Result};

/// What a backup is going to copy, for capacity planning.
#[derive(Debug, Clone)]
pub enum SpaceScope {
    /// Used bytes of the root filesystem.
    System,
    Home(PathBuf),
    Selective(HomeSelection),
}

/// A drive ready for use. `mounted_here` is false when it was already
/// mounted before we touched it.
#[derive(Debug, Clone)]
pub struct MountedDrive {
    pub drive: DriveInfo,
    pub mount_point: PathBuf,
    pub mapping: Option<String>,
    pub mounted_here: bool,
}

pub struct DriveManager {
    adapter: Arc<dyn DriveAdapter>,
    mount_base: PathBuf,
}

/// Compare required bytes with what the destination can hold.
pub fn check_capacity(required: u64, available: u64) -> Result<()> {
    if required > available {
        return Err(Error::Space {
            required,
            available,
        });
    }
    Ok(())
}

/// Device-mapper name for an encrypted drive.
pub fn mapping_name(drive: &DriveInfo) -> String {
    let id = if drive.uuid.is_empty() {
        drive
            .device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "drive".to_string())
    } else {
        drive.uuid.clone()
    };
    let id: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("bkmirror-{}", id)
}

impl DriveManager {
    pub fn new(adapter: Arc<dyn DriveAdapter>, mount_base: impl Into<PathBuf>) -> Self {
        Self {
            adapter,
            mount_base: mount_base.into(),
        }
    }

    fn device_tree(&self) -> DeviceTree {
        match self.adapter.block_devices() {
            Ok(tree) => tree,
            Err(e) => {
                warn!(error = %e, "Block device enumeration failed");
                DeviceTree::default()
            }
        }
    }

    /// Ordered candidate list. Enumeration failures yield an empty list.
    pub fn list_drives(&self) -> Vec<DriveInfo> {
        let drives = self.device_tree().candidates();
        debug!(count = drives.len(), "Discovered candidate drives");
        drives
    }

    /// Pick a drive by its position in [`DriveManager::list_drives`].
    pub fn select(&self, index: usize) -> Result<DriveInfo> {
        let drives = self.list_drives();
        let count = drives.len();
        drives.into_iter().nth(index).ok_or_else(|| {
            if count == 0 {
                Error::Config("no removable drives found".to_string())
            } else {
                Error::Config(format!(
                    "drive index {} out of range (found {} drive(s))",
                    index, count
                ))
            }
        })
    }

    /// Refuse any device whose disk carries the running root filesystem,
    /// re-checked against a fresh enumeration.
    fn ensure_safe(&self, tree: &DeviceTree, device: &Path) -> Result<()> {
        match tree.find(device) {
            Some(idx) if tree.shares_disk_with_root(idx) => Err(Error::DriveSafety {
                device: device.to_path_buf(),
            }),
            Some(_) => Ok(()),
            None => Err(MountError::Mount {
                device: device.to_path_buf(),
                target: self.mount_base.clone(),
                reason: "device is no longer present".to_string(),
            }
            .into()),
        }
    }

    /// Mount a drive, unlocking it first when encrypted. Already-mounted
    /// drives are returned as they are.
    pub fn mount(&self, drive: &DriveInfo, passphrase: Option<&str>) -> Result<MountedDrive> {
        let tree = self.device_tree();
        self.ensure_safe(&tree, &drive.device)?;

        // Prefer the live view over the caller's possibly stale copy.
        let current = tree
            .candidates()
            .into_iter()
            .find(|d| d.device == drive.device)
            .unwrap_or_else(|| drive.clone());

        if let Some(mount_point) = &current.mount_point {
            info!(device = %current.device.display(), mount_point = %mount_point.display(), "Drive already mounted");
            return Ok(MountedDrive {
                mount_point: mount_point.clone(),
                mapping: current.mapped_device.as_ref().and_then(|_| {
                    current.encrypted.then(|| mapping_name(&current))
                }),
                drive: current,
                mounted_here: false,
            });
        }

        let mut opened_mapping = None;
        let mount_device = if current.encrypted {
            match &current.mapped_device {
                Some(mapped) => mapped.clone(),
                None => {
                    let passphrase = passphrase.ok_or_else(|| MountError::Unlock {
                        device: current.device.clone(),
                        reason: "passphrase required for encrypted drive".to_string(),
                    })?;
                    let name = mapping_name(&current);
                    let mapped = self.adapter.unlock(&current.device, &name, passphrase)?;
                    info!(device = %current.device.display(), mapped = %mapped.display(), "Unlocked encrypted drive");
                    opened_mapping = Some(name);
                    mapped
                }
            }
        } else {
            current.device.clone()
        };

        let dir_name = if current.uuid.is_empty() {
            mapping_name(&current)
        } else {
            current.uuid.clone()
        };
        let target = self.mount_base.join(dir_name);

        let mounted = fs::create_dir_all(&target)
            .map_err(|e| MountError::Mount {
                device: mount_device.clone(),
                target: target.clone(),
                reason: format!("cannot create mount point: {}", e),
            })
            .and_then(|()| self.adapter.mount(&mount_device, &target));

        if let Err(e) = mounted {
            if let Some(name) = &opened_mapping {
                if let Err(close_err) = self.adapter.close_mapping(name) {
                    warn!(mapping = %name, error = %close_err, "Failed to close mapping after mount failure");
                }
            }
            return Err(e.into());
        }

        info!(device = %mount_device.display(), target = %target.display(), "Mounted drive");
        Ok(MountedDrive {
            drive: current.clone(),
            mount_point: target,
            mapping: opened_mapping.or_else(|| current.encrypted.then(|| mapping_name(&current))),
            mounted_here: true,
        })
    }

    /// Sync, unmount and close any encryption mapping. Busy devices are
    /// reported, not retried.
    pub fn unmount(&self, mounted: &MountedDrive) -> Result<()> {
        self.adapter.unmount(&mounted.mount_point)?;
        info!(target = %mounted.mount_point.display(), "Unmounted drive");

        if let Some(name) = &mounted.mapping {
            self.adapter.close_mapping(name)?;
            info!(mapping = %name, "Closed encryption mapping");
        }

        if mounted.mount_point.starts_with(&self.mount_base) {
            if let Err(e) = fs::remove_dir(&mounted.mount_point) {
                debug!(path = %mounted.mount_point.display(), error = %e, "Mount point left in place");
            }
        }
        Ok(())
    }

    pub fn usage(&self, path: &Path) -> Result<FsUsage> {
        Ok(self.adapter.usage(path)?)
    }

    /// Bytes the backup will need on the destination.
    pub fn required_space(&self, scope: &SpaceScope) -> Result<u64> {
        match scope {
            SpaceScope::System => Ok(self.adapter.usage(Path::new("/"))?.used),
            SpaceScope::Home(home) => Ok(directory_size(home)),
            SpaceScope::Selective(selection) => Ok(selection.required_bytes()),
        }
    }

    /// Reject the run before any write when the drive is too small.
    pub fn validate_space(&self, required: u64, mounted: &MountedDrive) -> Result<FsUsage> {
        let usage = self.adapter.usage(&mounted.mount_point)?;
        check_capacity(required, usage.total)?;
        info!(
            required,
            capacity = usage.total,
            "Destination capacity is sufficient"
        );
        Ok(usage)
    }
}
