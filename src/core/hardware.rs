use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::core::devices::DeviceTree;
use crate::error::MountError;

/// Filesystem usage as reported by `statvfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub inodes_used: u64,
}

impl FsUsage {
    pub fn of(path: &Path) -> anyhow::Result<Self> {
        let stats = nix::sys::statvfs::statvfs(path)
            .with_context(|| format!("Failed to get filesystem statistics for {}", path.display()))?;

        let fragment = stats.fragment_size() as u64;
        let total = stats.blocks() as u64 * fragment;
        let free = stats.blocks_free() as u64 * fragment;
        let available = stats.blocks_available() as u64 * fragment;
        let inodes_used = (stats.files() as u64).saturating_sub(stats.files_free() as u64);

        Ok(Self {
            total,
            used: total.saturating_sub(free),
            available,
            inodes_used,
        })
    }
}

/// Filesystems a backup drive may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFilesystem {
    Ext4,
    Ext3,
    Btrfs,
    Xfs,
    F2fs,
    Exfat,
    Vfat,
    Ntfs,
}

impl SupportedFilesystem {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ext4" => Some(Self::Ext4),
            "ext3" => Some(Self::Ext3),
            "btrfs" => Some(Self::Btrfs),
            "xfs" => Some(Self::Xfs),
            "f2fs" => Some(Self::F2fs),
            "exfat" => Some(Self::Exfat),
            "vfat" | "fat32" | "fat16" => Some(Self::Vfat),
            "ntfs" | "ntfs3" => Some(Self::Ntfs),
            _ => None,
        }
    }

    /// Seconds of mtime slack needed on this filesystem. FAT stores
    /// modification times with two-second resolution.
    pub fn modify_window_secs(&self) -> u64 {
        match self {
            Self::Vfat => 1,
            _ => 0,
        }
    }

    /// Whether owners and permission bits survive a round trip.
    pub fn preserves_unix_metadata(&self) -> bool {
        !matches!(self, Self::Exfat | Self::Vfat | Self::Ntfs)
    }
}

pub const LUKS_FSTYPE: &str = "crypto_LUKS";

/// Platform operations the drive manager depends on.
///
/// Mount-layer calls block; run them from a blocking worker.
pub trait DriveAdapter: Send + Sync {
    /// Enumerate block devices with their parent/child relations.
    fn block_devices(&self) -> anyhow::Result<DeviceTree>;

    fn mount(&self, device: &Path, target: &Path) -> Result<(), MountError>;

    /// Flush buffers and unmount.
    fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Open an encrypted device, returning the mapped device path.
    fn unlock(&self, device: &Path, name: &str, passphrase: &str) -> Result<PathBuf, MountError>;

    fn close_mapping(&self, name: &str) -> Result<(), MountError>;

    fn usage(&self, path: &Path) -> anyhow::Result<FsUsage> {
        FsUsage::of(path)
    }
}
