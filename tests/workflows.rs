//! Backup, verify and restore driven through the orchestrator on simulated drives.

use bkmirror::adapters::{SIMULATED_PASSPHRASE, SimulatedAdapter};
use bkmirror::config::AppConfig;
use bkmirror::context::AppContext;
use bkmirror::core::home::{HomeSelection, scan_home};
use bkmirror::core::{
    BackupRequest, BackupType, DriveInfo, Orchestrator, RestoreRequest, VerifyRequest,
};
use bkmirror::error::Error;
use bkmirror::lock::InstanceLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

struct Fixture {
    _root: TempDir,
    home: PathBuf,
    mount_base: PathBuf,
    lock_path: PathBuf,
    orchestrator: Orchestrator,
}

impl Fixture {
    fn new() -> Self {
        let root = tempdir().unwrap();
        let home = root.path().join("home");
        let mount_base = root.path().join("mnt");
        fs::create_dir_all(home.join("Documents/taxes")).unwrap();
        fs::create_dir_all(home.join("Music")).unwrap();
        fs::write(home.join(".bashrc"), "export EDITOR=vi\n").unwrap();
        fs::write(home.join("Documents/cv.txt"), "curriculum vitae").unwrap();
        fs::write(home.join("Documents/taxes/2025.csv"), "year,amount\n").unwrap();
        fs::write(home.join("Music/song.flac"), vec![7u8; 8192]).unwrap();

        let lock_path = root.path().join("bkmirror.lock");
        let config = AppConfig {
            lock_path: lock_path.clone(),
            mount_base: mount_base.clone(),
            home_dir: Some(home.clone()),
            progress_interval_ms: 20,
            sample_budget_secs: 1,
            simulation: true,
            ..AppConfig::default()
        };
        let ctx = AppContext::with_adapter(config, Arc::new(SimulatedAdapter::new()));

        Self {
            _root: root,
            home,
            mount_base,
            lock_path,
            orchestrator: Orchestrator::new(ctx),
        }
    }

    fn drive(&self, index: usize) -> DriveInfo {
        self.orchestrator.drives().select(index).unwrap()
    }

    /// Where the simulated drive's contents live between mounts.
    fn drive_dir(&self, drive: &DriveInfo) -> PathBuf {
        self.mount_base.join(&drive.uuid)
    }

    async fn backup(&self, backup_type: BackupType, selection: Option<HomeSelection>) {
        let handle = self.orchestrator.backup(BackupRequest {
            drive: self.drive(0),
            backup_type,
            selection,
            passphrase: None,
        });
        handle.wait().await.unwrap();
    }

    async fn verify(&self) -> bkmirror::core::VerificationReport {
        self.orchestrator
            .verify(VerifyRequest {
                drive: self.drive(0),
                source: None,
                checksum: true,
                passphrase: None,
                seed: Some(11),
            })
            .wait()
            .await
            .unwrap()
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn home_backup_writes_mirror_and_manifest() {
    let fx = Fixture::new();
    let drive = fx.drive(0);

    let handle = fx.orchestrator.backup(BackupRequest {
        drive: drive.clone(),
        backup_type: BackupType::Home,
        selection: None,
        passphrase: None,
    });
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.stats.files_copied, 4);
    assert!(outcome.unmount_error.is_none());

    let dir = fx.drive_dir(&drive);
    assert_eq!(read(&dir.join("Documents/cv.txt")), "curriculum vitae");
    assert!(read(&dir.join("backup-manifest.txt")).contains("home"));
}

#[tokio::test]
async fn progress_ends_with_a_single_done_update() {
    let fx = Fixture::new();
    let handle = fx.orchestrator.backup(BackupRequest {
        drive: fx.drive(0),
        backup_type: BackupType::Home,
        selection: None,
        passphrase: None,
    });
    let mut rx = handle.subscribe();

    let mut last = rx.borrow().clone();
    while rx.changed().await.is_ok() {
        let update = rx.borrow_and_update().clone();
        assert!(!last.done, "update after done: {:?}", update);
        last = update;
    }

    assert!(last.done);
    assert!(last.error.is_none());
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn clean_backup_verifies_and_drift_is_reported() {
    let fx = Fixture::new();
    fx.backup(BackupType::Home, None).await;

    let report = fx.verify().await;
    assert!(report.is_final);
    assert!(report.is_clean(), "{}", report.details(10));
    assert!(report.sampled > 0);

    fs::remove_file(fx.home.join(".bashrc")).unwrap();
    fs::write(fx.home.join("Documents/new.txt"), "new").unwrap();

    let report = fx.verify().await;
    assert!(!report.is_clean());
    assert!(report.extra.contains(&PathBuf::from(".bashrc")));
    assert!(report.missing.contains(&PathBuf::from("Documents/new.txt")));
}

#[tokio::test]
async fn selective_backup_skips_deselected_folders() {
    let fx = Fixture::new();
    let selection = HomeSelection::with_selected(scan_home(&fx.home), &["Documents".to_string()]);
    fx.backup(BackupType::SelectiveHome, Some(selection)).await;

    let dir = fx.drive_dir(&fx.drive(0));
    assert!(dir.join("Documents/taxes/2025.csv").exists());
    assert!(!dir.join("Music/song.flac").exists());
    assert!(read(&dir.join("backup-manifest.txt")).contains("selective-home"));
}

#[tokio::test]
async fn selective_backup_without_selection_fails() {
    let fx = Fixture::new();
    let handle = fx.orchestrator.backup(BackupRequest {
        drive: fx.drive(0),
        backup_type: BackupType::SelectiveHome,
        selection: None,
        passphrase: None,
    });

    assert!(matches!(handle.wait().await, Err(Error::Config(_))));
}

#[tokio::test]
async fn restore_mirrors_backup_into_target() {
    let fx = Fixture::new();
    fx.backup(BackupType::Home, None).await;

    let target = fx.home.parent().unwrap().join("restored");
    fs::create_dir_all(&target).unwrap();
    fs::write(target.join("stray.txt"), "not in backup").unwrap();

    let outcome = fx
        .orchestrator
        .restore(RestoreRequest {
            drive: fx.drive(0),
            target: Some(target.clone()),
            passphrase: None,
        })
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.destination, target);
    assert_eq!(read(&target.join("Documents/cv.txt")), "curriculum vitae");
    assert_eq!(fs::read(target.join("Music/song.flac")).unwrap().len(), 8192);
    assert!(!target.join("stray.txt").exists());
    assert!(!target.join("backup-manifest.txt").exists());
}

#[tokio::test]
async fn home_restore_brings_back_folders_named_like_system_roots() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.home.join("dev/project")).unwrap();
    fs::write(fx.home.join("dev/project/main.rs"), "fn main() {}").unwrap();
    fs::create_dir_all(fx.home.join("run")).unwrap();
    fs::write(fx.home.join("run/log.txt"), "5k").unwrap();
    fx.backup(BackupType::Home, None).await;

    let target = fx.home.parent().unwrap().join("restored");
    fs::create_dir_all(&target).unwrap();
    fx.orchestrator
        .restore(RestoreRequest {
            drive: fx.drive(0),
            target: Some(target.clone()),
            passphrase: None,
        })
        .wait()
        .await
        .unwrap();

    assert_eq!(read(&target.join("dev/project/main.rs")), "fn main() {}");
    assert_eq!(read(&target.join("run/log.txt")), "5k");
}

#[tokio::test]
async fn restore_without_manifest_fails() {
    let fx = Fixture::new();
    let handle = fx.orchestrator.restore(RestoreRequest {
        drive: fx.drive(0),
        target: Some(fx.home.clone()),
        passphrase: None,
    });

    assert!(handle.wait().await.is_err());
}

#[tokio::test]
async fn second_operation_is_refused_while_lock_is_held() {
    let fx = Fixture::new();
    let _held = InstanceLock::acquire(&fx.lock_path).unwrap();

    let result = fx
        .orchestrator
        .backup(BackupRequest {
            drive: fx.drive(0),
            backup_type: BackupType::Home,
            selection: None,
            passphrase: None,
        })
        .wait()
        .await;

    assert!(matches!(result, Err(Error::InstanceConflict { .. })));
}

#[tokio::test]
async fn encrypted_drive_round_trip() {
    let fx = Fixture::new();
    let drive = fx.drive(1);
    assert!(drive.encrypted);

    fx.orchestrator
        .backup(BackupRequest {
            drive: drive.clone(),
            backup_type: BackupType::Home,
            selection: None,
            passphrase: Some(SIMULATED_PASSPHRASE.to_string()),
        })
        .wait()
        .await
        .unwrap();

    assert!(fx.drive_dir(&drive).join(".bashrc").exists());
    // Mapping is closed again, so the listing shows the LUKS container.
    assert!(fx.drive(1).mapped_device.is_none());
}
