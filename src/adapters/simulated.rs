use anyhow::Result;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::core::devices::DeviceTree;
use crate::core::hardware::{DriveAdapter, LUKS_FSTYPE};
use crate::error::MountError;

/// Passphrase accepted by simulated encrypted partitions.
pub const SIMULATED_PASSPHRASE: &str = "bkmirror";

const GIB: u64 = 1 << 30;

#[derive(Debug, Clone)]
pub struct SimPartition {
    pub name: String,
    pub uuid: String,
    pub label: String,
    /// Filesystem inside the partition (inside the LUKS container when
    /// encrypted).
    pub fstype: String,
    pub size: u64,
    pub encrypted: bool,
    pub mounts_root: bool,
}

impl SimPartition {
    pub fn new(name: &str, uuid: &str, fstype: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid.to_string(),
            label: String::new(),
            fstype: fstype.to_string(),
            size,
            encrypted: false,
            mounts_root: false,
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// The running system's `/` lives here.
    pub fn root(mut self) -> Self {
        self.mounts_root = true;
        self
    }

    fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.name))
    }
}

#[derive(Debug, Clone)]
pub struct SimDisk {
    pub name: String,
    pub size: u64,
    pub removable: bool,
    pub partitions: Vec<SimPartition>,
}

impl SimDisk {
    pub fn removable(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            removable: true,
            partitions: Vec::new(),
        }
    }

    pub fn fixed(name: &str, size: u64) -> Self {
        Self {
            removable: false,
            ..Self::removable(name, size)
        }
    }

    pub fn with_partition(mut self, partition: SimPartition) -> Self {
        self.partitions.push(partition);
        self
    }
}

#[derive(Debug, Default)]
struct SimState {
    disks: Vec<SimDisk>,
    /// device path -> mount target
    mounts: HashMap<PathBuf, PathBuf>,
    /// mapping name -> encrypted partition path
    mappings: HashMap<String, PathBuf>,
    busy: HashSet<PathBuf>,
}

impl SimState {
    fn partition(&self, device: &Path) -> Option<&SimPartition> {
        self.disks
            .iter()
            .flat_map(|d| d.partitions.iter())
            .find(|p| p.path() == device)
    }

    fn mapping_for(&self, device: &Path) -> Option<&String> {
        self.mappings
            .iter()
            .find(|(_, dev)| dev.as_path() == device)
            .map(|(name, _)| name)
    }

    fn mountable(&self, device: &Path) -> bool {
        if let Some(p) = self.partition(device) {
            return !p.encrypted;
        }
        device
            .strip_prefix("/dev/mapper")
            .ok()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.mappings.contains_key(n))
    }

    fn mountpoints(&self, device: &Path) -> Value {
        match self.mounts.get(device) {
            Some(target) => json!([target.display().to_string()]),
            None => json!([null]),
        }
    }

    /// Render the model the way `lsblk -J -b` would.
    fn to_lsblk_json(&self) -> Value {
        let disks: Vec<Value> = self
            .disks
            .iter()
            .map(|disk| {
                let parts: Vec<Value> = disk
                    .partitions
                    .iter()
                    .map(|p| {
                        let path = p.path();
                        let mountpoints = if p.mounts_root {
                            json!(["/"])
                        } else {
                            self.mountpoints(&path)
                        };
                        let fstype = if p.encrypted {
                            LUKS_FSTYPE
                        } else {
                            p.fstype.as_str()
                        };
                        let mut node = json!({
                            "name": p.name,
                            "path": path.display().to_string(),
                            "size": p.size,
                            "label": p.label,
                            "uuid": p.uuid,
                            "fstype": fstype,
                            "type": "part",
                            "rm": disk.removable,
                            "hotplug": disk.removable,
                            "mountpoints": mountpoints,
                        });
                        if let Some(name) = self.mapping_for(&path) {
                            let mapped = PathBuf::from("/dev/mapper").join(name);
                            node["children"] = json!([{
                                "name": name,
                                "path": mapped.display().to_string(),
                                "size": p.size,
                                "uuid": format!("{}-inner", p.uuid),
                                "fstype": p.fstype,
                                "type": "crypt",
                                "rm": false,
                                "hotplug": false,
                                "mountpoints": self.mountpoints(&mapped),
                            }]);
                        }
                        node
                    })
                    .collect();
                json!({
                    "name": disk.name,
                    "path": format!("/dev/{}", disk.name),
                    "size": disk.size,
                    "type": "disk",
                    "rm": disk.removable,
                    "hotplug": disk.removable,
                    "mountpoints": [null],
                    "children": parts,
                })
            })
            .collect();
        json!({ "blockdevices": disks })
    }
}

/// In-memory stand-in for block devices, mounts and encryption mappings.
///
/// Mount targets are ordinary directories, so whatever is written to a
/// "mounted" drive stays in that directory between runs.
#[derive(Debug, Default)]
pub struct SimulatedAdapter {
    state: Mutex<SimState>,
}

impl SimulatedAdapter {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fixed system disk, one plain and one encrypted USB drive.
    pub fn new() -> Self {
        let adapter = Self::empty();
        adapter.add_disk(
            SimDisk::fixed("sda", 512 * GIB)
                .with_partition(SimPartition::new("sda1", "sim-root", "ext4", 512 * GIB).root()),
        );
        adapter.add_disk(
            SimDisk::removable("sdb", 64 * GIB).with_partition(
                SimPartition::new("sdb1", "sim-usb-0001", "ext4", 64 * GIB).label("SIMBACKUP"),
            ),
        );
        adapter.add_disk(
            SimDisk::removable("sdc", 256 * GIB).with_partition(
                SimPartition::new("sdc1", "sim-luks-0002", "ext4", 256 * GIB)
                    .label("SIMVAULT")
                    .encrypted(),
            ),
        );
        adapter
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_disk(&self, disk: SimDisk) {
        debug!(disk = %disk.name, "Simulated disk attached");
        self.state().disks.push(disk);
    }

    pub fn remove_disk(&self, name: &str) {
        let mut state = self.state();
        state.disks.retain(|d| d.name != name);
        debug!(disk = %name, "Simulated disk detached");
    }

    /// Make unmounting `target` fail with a busy error.
    pub fn mark_busy(&self, target: &Path) {
        self.state().busy.insert(target.to_path_buf());
    }

    pub fn mount_target(&self, device: &Path) -> Option<PathBuf> {
        self.state().mounts.get(device).cloned()
    }

    pub fn open_mappings(&self) -> Vec<String> {
        self.state().mappings.keys().cloned().collect()
    }
}

impl DriveAdapter for SimulatedAdapter {
    fn block_devices(&self) -> Result<DeviceTree> {
        let json = self.state().to_lsblk_json().to_string();
        Ok(DeviceTree::from_lsblk_json(&json)?)
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<(), MountError> {
        let mut state = self.state();
        let fail = |reason: &str| MountError::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            reason: reason.to_string(),
        };
        if !state.mountable(device) {
            return Err(fail("no mountable filesystem on device"));
        }
        if state.mounts.contains_key(device) {
            return Err(fail("already mounted"));
        }
        if !target.is_dir() {
            return Err(fail("mount point does not exist"));
        }
        state
            .mounts
            .insert(device.to_path_buf(), target.to_path_buf());
        debug!(device = %device.display(), target = %target.display(), "Simulated mount");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let mut state = self.state();
        if state.busy.contains(target) {
            return Err(MountError::Busy {
                target: target.to_path_buf(),
            });
        }
        let device = state
            .mounts
            .iter()
            .find(|(_, t)| t.as_path() == target)
            .map(|(d, _)| d.clone());
        match device {
            Some(device) => {
                state.mounts.remove(&device);
                Ok(())
            }
            None => Err(MountError::Unmount {
                target: target.to_path_buf(),
                reason: "not mounted".to_string(),
            }),
        }
    }

    fn unlock(&self, device: &Path, name: &str, passphrase: &str) -> Result<PathBuf, MountError> {
        let mut state = self.state();
        let encrypted = state.partition(device).is_some_and(|p| p.encrypted);
        if !encrypted {
            return Err(MountError::Unlock {
                device: device.to_path_buf(),
                reason: "not a LUKS device".to_string(),
            });
        }
        if passphrase != SIMULATED_PASSPHRASE {
            return Err(MountError::Unlock {
                device: device.to_path_buf(),
                reason: "No key available with this passphrase".to_string(),
            });
        }
        state
            .mappings
            .insert(name.to_string(), device.to_path_buf());
        Ok(PathBuf::from("/dev/mapper").join(name))
    }

    fn close_mapping(&self, name: &str) -> Result<(), MountError> {
        let mut state = self.state();
        let mapped = PathBuf::from("/dev/mapper").join(name);
        if state.mounts.contains_key(&mapped) {
            return Err(MountError::Busy { target: mapped });
        }
        state.mappings.remove(name);
        Ok(())
    }
}
