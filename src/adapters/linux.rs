use anyhow::{Context, Result};
use nix::errno::Errno;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

use crate::core::devices::DeviceTree;
use crate::core::hardware::DriveAdapter;
use crate::error::MountError;

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,LABEL,UUID,FSTYPE,TYPE,RM,HOTPLUG,MOUNTPOINT,MOUNTPOINTS";
/// Older util-linux releases lack MOUNTPOINTS.
const LSBLK_COLUMNS_LEGACY: &str = "NAME,PATH,SIZE,LABEL,UUID,FSTYPE,TYPE,RM,HOTPLUG,MOUNTPOINT";

const MAPPER_DIR: &str = "/dev/mapper";

/// Drives real hardware through `lsblk`, `mount`, `cryptsetup` and umount(2).
#[derive(Debug, Default, Clone)]
pub struct LinuxAdapter;

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

impl LinuxAdapter {
    pub fn new() -> Self {
        Self
    }

    fn run_lsblk(columns: &str) -> Result<String> {
        let output = Command::new("lsblk")
            .args(["-J", "-b", "-o", columns])
            .output()
            .context("Failed to run lsblk")?;
        if !output.status.success() {
            anyhow::bail!("lsblk failed: {}", stderr_of(&output));
        }
        String::from_utf8(output.stdout).context("lsblk produced non-UTF-8 output")
    }

    pub fn mapper_path(name: &str) -> PathBuf {
        Path::new(MAPPER_DIR).join(name)
    }
}

impl DriveAdapter for LinuxAdapter {
    fn block_devices(&self) -> Result<DeviceTree> {
        let json = match Self::run_lsblk(LSBLK_COLUMNS) {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, "Retrying lsblk without MOUNTPOINTS");
                Self::run_lsblk(LSBLK_COLUMNS_LEGACY)?
            }
        };
        Ok(DeviceTree::parse_lenient(&json))
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<(), MountError> {
        let output = Command::new("mount")
            .arg(device)
            .arg(target)
            .output()
            .map_err(|e| MountError::Mount {
                device: device.to_path_buf(),
                target: target.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(MountError::Mount {
                device: device.to_path_buf(),
                target: target.to_path_buf(),
                reason: stderr_of(&output),
            });
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        nix::unistd::sync();
        match nix::mount::umount(target) {
            Ok(()) => Ok(()),
            Err(Errno::EBUSY) => Err(MountError::Busy {
                target: target.to_path_buf(),
            }),
            Err(e) => Err(MountError::Unmount {
                target: target.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn unlock(&self, device: &Path, name: &str, passphrase: &str) -> Result<PathBuf, MountError> {
        let mapped = Self::mapper_path(name);
        if mapped.exists() {
            debug!(mapping = %name, "Encryption mapping already open");
            return Ok(mapped);
        }

        let unlock_err = |reason: String| MountError::Unlock {
            device: device.to_path_buf(),
            reason,
        };

        let mut child = Command::new("cryptsetup")
            .args(["open", "--key-file=-"])
            .arg(device)
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| unlock_err(format!("cannot run cryptsetup: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(passphrase.as_bytes())
                .map_err(|e| unlock_err(format!("cannot pass passphrase: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| unlock_err(e.to_string()))?;
        if !output.status.success() {
            return Err(unlock_err(stderr_of(&output)));
        }
        Ok(mapped)
    }

    fn close_mapping(&self, name: &str) -> Result<(), MountError> {
        let mapped = Self::mapper_path(name);
        if !mapped.exists() {
            return Ok(());
        }
        let output = Command::new("cryptsetup")
            .args(["close", name])
            .output()
            .map_err(|e| MountError::Unmount {
                target: mapped.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            let reason = stderr_of(&output);
            warn!(mapping = %name, %reason, "cryptsetup close failed");
            if reason.contains("busy") {
                return Err(MountError::Busy { target: mapped });
            }
            return Err(MountError::Unmount {
                target: mapped,
                reason,
            });
        }
        Ok(())
    }
}
