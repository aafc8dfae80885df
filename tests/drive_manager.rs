//! Drive discovery, mounting and capacity checks against simulated hardware.

use bkmirror::adapters::{SIMULATED_PASSPHRASE, SimDisk, SimPartition, SimulatedAdapter};
use bkmirror::core::{DriveManager, SpaceScope};
use bkmirror::error::{Error, MountError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const GIB: u64 = 1 << 30;

fn manager(adapter: &Arc<SimulatedAdapter>) -> (DriveManager, TempDir) {
    let base = tempdir().unwrap();
    let manager = DriveManager::new(adapter.clone(), base.path());
    (manager, base)
}

#[test]
fn lists_removable_drives_in_order() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);

    let drives = manager.list_drives();

    assert_eq!(drives.len(), 2);
    assert_eq!(drives[0].device, PathBuf::from("/dev/sdb1"));
    assert_eq!(drives[0].display_name(), "SIMBACKUP");
    assert!(!drives[0].encrypted);
    assert!(drives[1].encrypted);
}

#[test]
fn removable_disk_hosting_root_is_never_offered() {
    let adapter = Arc::new(SimulatedAdapter::empty());
    adapter.add_disk(
        SimDisk::removable("sdd", 32 * GIB)
            .with_partition(SimPartition::new("sdd1", "live-esp", "vfat", GIB))
            .with_partition(SimPartition::new("sdd2", "live-root", "ext4", 31 * GIB).root()),
    );
    let (manager, _base) = manager(&adapter);

    assert!(manager.list_drives().is_empty());
}

#[test]
fn select_out_of_range_is_a_config_error() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);

    assert_eq!(manager.select(1).unwrap().device, PathBuf::from("/dev/sdc1"));
    assert!(matches!(manager.select(2), Err(Error::Config(_))));
}

#[test]
fn select_with_no_drives_fails() {
    let adapter = Arc::new(SimulatedAdapter::empty());
    let (manager, _base) = manager(&adapter);

    assert!(matches!(manager.select(0), Err(Error::Config(_))));
}

#[test]
fn mount_is_idempotent_and_unmount_releases() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, base) = manager(&adapter);
    let drive = manager.select(0).unwrap();

    let first = manager.mount(&drive, None).unwrap();
    assert!(first.mounted_here);
    assert_eq!(first.mount_point, base.path().join("sim-usb-0001"));
    assert!(first.mount_point.is_dir());

    let second = manager.mount(&drive, None).unwrap();
    assert!(!second.mounted_here);
    assert_eq!(second.mount_point, first.mount_point);

    manager.unmount(&first).unwrap();
    assert!(adapter.mount_target(Path::new("/dev/sdb1")).is_none());
}

#[test]
fn encrypted_drive_needs_a_passphrase() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);
    let drive = manager.select(1).unwrap();

    let err = manager.mount(&drive, None).unwrap_err();
    assert!(matches!(err, Error::Mount(MountError::Unlock { .. })));

    let err = manager.mount(&drive, Some("wrong")).unwrap_err();
    assert!(matches!(err, Error::Mount(MountError::Unlock { .. })));
    assert!(adapter.open_mappings().is_empty());
}

#[test]
fn encrypted_drive_unlocks_mounts_and_closes() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);
    let drive = manager.select(1).unwrap();

    let mounted = manager.mount(&drive, Some(SIMULATED_PASSPHRASE)).unwrap();
    assert_eq!(mounted.mapping.as_deref(), Some("bkmirror-sim-luks-0002"));
    assert_eq!(adapter.open_mappings(), vec!["bkmirror-sim-luks-0002".to_string()]);

    // The live listing now shows the opened mapping's filesystem and mount.
    let listed = manager.select(1).unwrap();
    assert_eq!(listed.filesystem, "ext4");
    assert_eq!(listed.mount_point.as_deref(), Some(mounted.mount_point.as_path()));

    manager.unmount(&mounted).unwrap();
    assert!(adapter.open_mappings().is_empty());
}

#[test]
fn busy_unmount_is_reported() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);
    let drive = manager.select(0).unwrap();
    let mounted = manager.mount(&drive, None).unwrap();

    adapter.mark_busy(&mounted.mount_point);
    let err = manager.unmount(&mounted).unwrap_err();

    assert!(matches!(err, Error::Mount(MountError::Busy { .. })));
    assert!(adapter.mount_target(Path::new("/dev/sdb1")).is_some());
}

#[test]
fn vanished_drive_cannot_be_mounted() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);
    let drive = manager.select(0).unwrap();

    adapter.remove_disk("sdb");

    assert!(manager.mount(&drive, None).is_err());
}

#[test]
fn home_scope_requires_its_directory_size() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);
    let home = tempdir().unwrap();
    std::fs::write(home.path().join("a"), vec![0u8; 4096]).unwrap();
    std::fs::write(home.path().join("b"), vec![0u8; 1024]).unwrap();

    let required = manager
        .required_space(&SpaceScope::Home(home.path().to_path_buf()))
        .unwrap();

    assert_eq!(required, 5120);
}

#[test]
fn space_check_uses_destination_capacity() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let (manager, _base) = manager(&adapter);
    let mounted = manager.mount(&manager.select(0).unwrap(), None).unwrap();

    let usage = manager.validate_space(1024, &mounted).unwrap();
    assert!(usage.total >= 1024);

    let err = manager.validate_space(u64::MAX, &mounted).unwrap_err();
    assert!(matches!(err, Error::Space { .. }));
}
