//! Backup, restore and verify workflows.
//!
//! Each workflow takes the instance lock, mounts the drive, does its work on
//! a blocking worker while this task polls progress on a fixed tick, and
//! unmounts again whatever the outcome.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::drive_manager::{DriveManager, MountedDrive, SpaceScope};
use crate::core::exclusion::ProtectedSet;
use crate::core::hardware::{DriveAdapter, FsUsage, SupportedFilesystem};
use crate::core::home::HomeSelection;
use crate::core::manifest::Manifest;
use crate::core::models::{BackupConfig, BackupType, DriveInfo, OperationPhase, ProgressUpdate};
use crate::core::operation::{OperationContext, OperationHandle, Outcome};
use crate::core::ownership::resolve_home;
use crate::core::progress::ProgressEstimator;
use crate::core::sync_engine::{SyncOptions, SyncStats, Synchronizer};
use crate::core::verifier::{VerificationReport, Verifier};
use crate::error::{Error, Result, format_bytes};
use crate::lock::InstanceLock;

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub drive: DriveInfo,
    pub backup_type: BackupType,
    /// Required for [`BackupType::SelectiveHome`].
    pub selection: Option<HomeSelection>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub drive: DriveInfo,
    /// Overrides the manifest's routing.
    pub target: Option<PathBuf>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub drive: DriveInfo,
    /// Overrides the manifest's routing.
    pub source: Option<PathBuf>,
    pub checksum: bool,
    pub passphrase: Option<String>,
    pub seed: Option<u64>,
}

/// Result of a backup or restore.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorOutcome {
    pub backup_type: BackupType,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub stats: SyncStats,
    /// Set when the drive could not be released afterwards.
    pub unmount_error: Option<String>,
}

impl Outcome for MirrorOutcome {
    fn summary(&self) -> String {
        let mut summary = format!(
            "{} mirror complete: {} file(s) copied ({}), {} up to date, {} removed, {} error(s)",
            self.backup_type.title(),
            self.stats.files_copied,
            format_bytes(self.stats.bytes_copied),
            self.stats.files_up_to_date,
            self.stats.files_deleted + self.stats.dirs_deleted,
            self.stats.errors
        );
        if let Some(e) = &self.unmount_error {
            summary.push_str(&format!("; drive left mounted: {}", e));
        }
        summary
    }
}

impl Outcome for VerificationReport {
    fn summary(&self) -> String {
        VerificationReport::summary(self)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("blocking task failed: {}", e)))?
}

fn stage(op: &OperationContext, message: impl Into<String>) {
    op.report(ProgressUpdate::running(
        OperationPhase::Idle,
        crate::core::models::INDETERMINATE,
        message,
    ));
}

fn modify_window_for(configured: u64, drive: &DriveInfo) -> u64 {
    let fs_window = SupportedFilesystem::from_str(&drive.filesystem)
        .map(|fs| fs.modify_window_secs())
        .unwrap_or(0);
    configured.max(fs_window)
}

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn drives(&self) -> DriveManager {
        self.ctx.drive_manager()
    }

    fn home(&self) -> Result<PathBuf> {
        resolve_home(self.ctx.config.home_dir.as_deref())
            .ok_or_else(|| Error::Config("cannot determine the home directory".to_string()))
    }

    pub fn backup(&self, request: BackupRequest) -> OperationHandle<MirrorOutcome> {
        let ctx = self.ctx.clone();
        let home = self.home();
        OperationHandle::spawn("backup", move |op| async move {
            let _lock = InstanceLock::acquire(&ctx.config.lock_path)?;
            let manager = Arc::new(ctx.drive_manager());
            let mounted = mount(&op, &manager, &request.drive, request.passphrase.clone()).await?;

            let result = run_backup(&op, &ctx, &manager, &mounted, &request, home).await;
            finish(&manager, mounted, result).await
        })
    }

    pub fn restore(&self, request: RestoreRequest) -> OperationHandle<MirrorOutcome> {
        let ctx = self.ctx.clone();
        let home = self.home();
        OperationHandle::spawn("restore", move |op| async move {
            let _lock = InstanceLock::acquire(&ctx.config.lock_path)?;
            let manager = Arc::new(ctx.drive_manager());
            let mounted = mount(&op, &manager, &request.drive, request.passphrase.clone()).await?;

            let result = run_restore(&op, &ctx, &mounted, &request, home).await;
            finish(&manager, mounted, result).await
        })
    }

    pub fn verify(&self, request: VerifyRequest) -> OperationHandle<VerificationReport> {
        let ctx = self.ctx.clone();
        let home = self.home();
        OperationHandle::spawn("verify", move |op| async move {
            let _lock = InstanceLock::acquire(&ctx.config.lock_path)?;
            let manager = Arc::new(ctx.drive_manager());
            let mounted = mount(&op, &manager, &request.drive, request.passphrase.clone()).await?;

            let result = run_verify(&op, &ctx, &mounted, &request, home).await;
            let unmounted = release(&manager, &mounted).await;
            let report = result?;
            if let Err(e) = unmounted {
                warn!(error = %e, "Drive left mounted after verification");
            }
            Ok(report)
        })
    }
}

async fn mount(
    op: &OperationContext,
    manager: &Arc<DriveManager>,
    drive: &DriveInfo,
    passphrase: Option<String>,
) -> Result<MountedDrive> {
    stage(op, format!("Mounting {}", drive.display_name()));
    let manager = Arc::clone(manager);
    let drive = drive.clone();
    blocking(move || manager.mount(&drive, passphrase.as_deref())).await
}

/// Unmount only what this run mounted.
async fn release(manager: &Arc<DriveManager>, mounted: &MountedDrive) -> Result<()> {
    if !mounted.mounted_here {
        return Ok(());
    }
    let manager = Arc::clone(manager);
    let mounted = mounted.clone();
    blocking(move || manager.unmount(&mounted)).await
}

async fn finish(
    manager: &Arc<DriveManager>,
    mounted: MountedDrive,
    result: Result<MirrorOutcome>,
) -> Result<MirrorOutcome> {
    let unmounted = release(manager, &mounted).await;
    let mut outcome = result?;
    if let Err(e) = unmounted {
        warn!(error = %e, "Drive left mounted");
        outcome.unmount_error = Some(e.to_string());
    }
    Ok(outcome)
}

async fn run_backup(
    op: &OperationContext,
    ctx: &AppContext,
    manager: &Arc<DriveManager>,
    mounted: &MountedDrive,
    request: &BackupRequest,
    home: Result<PathBuf>,
) -> Result<MirrorOutcome> {
    let config = &ctx.config;
    let (source, exclusions, scope) = match request.backup_type {
        BackupType::System => (
            PathBuf::from("/"),
            config.system_exclusions.clone(),
            SpaceScope::System,
        ),
        BackupType::Home => {
            let home = home?;
            (
                home.clone(),
                config.home_exclusions.clone(),
                SpaceScope::Home(home),
            )
        }
        BackupType::SelectiveHome => {
            let home = home?;
            let selection = request.selection.clone().ok_or_else(|| {
                Error::Config("selective home backup needs a folder selection".to_string())
            })?;
            let mut exclusions = config.home_exclusions.clone();
            exclusions.extend(selection.exclusions());
            (home, exclusions, SpaceScope::Selective(selection))
        }
    };

    let backup = BackupConfig::new(
        source,
        mounted.mount_point.clone(),
        exclusions,
        request.backup_type,
    );
    backup.validate()?;

    if backup.backup_type == BackupType::System
        && SupportedFilesystem::from_str(&mounted.drive.filesystem)
            .is_some_and(|fs| !fs.preserves_unix_metadata())
    {
        warn!(
            filesystem = %mounted.drive.filesystem,
            "Drive cannot store ownership or permissions; a restored system will not boot"
        );
    }

    stage(op, "Checking destination capacity");
    let required = {
        let manager = Arc::clone(manager);
        let mounted = mounted.clone();
        blocking(move || {
            let required = manager.required_space(&scope)?;
            manager.validate_space(required, &mounted)?;
            Ok(required)
        })
        .await?
    };

    Manifest::for_current_host(request.backup_type).write_to(&backup.destination)?;

    let options = SyncOptions {
        modify_window_secs: modify_window_for(config.modify_window_secs, &mounted.drive),
        ..SyncOptions::default()
    };
    let stats = run_mirror(op, ctx, &backup, options, required).await?;
    Ok(MirrorOutcome {
        backup_type: backup.backup_type,
        source: backup.source,
        destination: backup.destination,
        stats,
        unmount_error: None,
    })
}

async fn run_restore(
    op: &OperationContext,
    ctx: &AppContext,
    mounted: &MountedDrive,
    request: &RestoreRequest,
    home: Result<PathBuf>,
) -> Result<MirrorOutcome> {
    let manifest = Manifest::read_from(&mounted.mount_point)?;
    let target = match &request.target {
        Some(target) => target.clone(),
        None => match manifest.backup_type {
            BackupType::System => PathBuf::from("/"),
            BackupType::Home | BackupType::SelectiveHome => manifest.restore_target(&home?),
        },
    };
    info!(
        backup_type = %manifest.backup_type,
        hostname = %manifest.hostname,
        target = %target.display(),
        "Restoring backup"
    );

    // Never write into pseudo-filesystems or carry the manifest over.
    let restore = BackupConfig::new(
        mounted.mount_point.clone(),
        target,
        ProtectedSet::for_backup(manifest.backup_type).as_exclusions(),
        manifest.backup_type,
    );
    restore.validate()?;

    let source_used = ctx
        .adapter
        .usage(&restore.source)
        .map(|u| u.used)
        .unwrap_or(0);
    let options = SyncOptions {
        modify_window_secs: modify_window_for(ctx.config.modify_window_secs, &mounted.drive),
        ..SyncOptions::default()
    };
    let stats = run_mirror(op, ctx, &restore, options, source_used).await?;
    Ok(MirrorOutcome {
        backup_type: restore.backup_type,
        source: restore.source,
        destination: restore.destination,
        stats,
        unmount_error: None,
    })
}

async fn run_verify(
    op: &OperationContext,
    ctx: &AppContext,
    mounted: &MountedDrive,
    request: &VerifyRequest,
    home: Result<PathBuf>,
) -> Result<VerificationReport> {
    let manifest = Manifest::read_from(&mounted.mount_point)?;
    let source = match &request.source {
        Some(source) => source.clone(),
        None => match manifest.backup_type {
            BackupType::System => PathBuf::from("/"),
            BackupType::Home | BackupType::SelectiveHome => manifest.restore_target(&home?),
        },
    };

    let mut options = ctx.config.verify_options(request.checksum);
    options.modify_window_secs = modify_window_for(options.modify_window_secs, &mounted.drive);
    options.seed = request.seed;

    let verifier = Verifier::new(source, mounted.mount_point.clone(), manifest.backup_type, options)
        .with_cancellation(op.cancel.clone())
        .with_progress(op.progress.clone());
    blocking(move || verifier.run()).await
}

fn destination_used(adapter: &Arc<dyn DriveAdapter>, path: &Path) -> Option<u64> {
    adapter.usage(path).ok().map(|u: FsUsage| u.used)
}

/// Run copy then delete on a blocking worker, publishing an estimate on
/// every tick until it finishes.
async fn run_mirror(
    op: &OperationContext,
    ctx: &AppContext,
    config: &BackupConfig,
    options: SyncOptions,
    source_used: u64,
) -> Result<SyncStats> {
    let adapter = Arc::clone(&ctx.adapter);
    let destination = config.destination.clone();
    let dest_start = destination_used(&adapter, &destination).unwrap_or(0);
    let mut estimator = ProgressEstimator::new(source_used, dest_start, ctx.config.eta_warmup());

    let synchronizer = Synchronizer::new(config, options).with_cancellation(op.cancel.clone());
    let phase = synchronizer.subscribe_phase();
    let counters = synchronizer.counters();
    let title = config.backup_type.title();

    let mut worker = tokio::task::spawn_blocking(move || synchronizer.run());
    let mut ticker = tokio::time::interval(ctx.config.progress_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();

    loop {
        tokio::select! {
            joined = &mut worker => {
                return joined
                    .map_err(|e| Error::Other(anyhow::anyhow!("mirror worker failed: {}", e)))?;
            }
            _ = ticker.tick() => {
                let current = *phase.borrow();
                if matches!(current, OperationPhase::Completed | OperationPhase::Failed) {
                    continue;
                }
                let estimate = estimator.estimate(
                    destination_used(&adapter, &destination),
                    started.elapsed(),
                );
                let (shown, message) = match current {
                    OperationPhase::Deleting => (
                        OperationPhase::Deleting,
                        format!(
                            "Removing entries no longer in source ({} removed)",
                            counters.deletions()
                        ),
                    ),
                    _ => (
                        OperationPhase::Copying,
                        format!(
                            "{}: {} of {} entries copied, {}, {}",
                            title,
                            counters.files_copied(),
                            counters.entries_seen(),
                            format_bytes(counters.bytes_copied()),
                            estimate.describe()
                        ),
                    ),
                };
                op.report(ProgressUpdate::running(shown, estimate.percentage(), message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(fs: &str) -> DriveInfo {
        DriveInfo {
            device: PathBuf::from("/dev/sdz1"),
            size: 0,
            label: String::new(),
            uuid: "u".to_string(),
            filesystem: fs.to_string(),
            encrypted: false,
            mount_point: None,
            mapped_device: None,
        }
    }

    #[test]
    fn fat_drives_widen_modify_window() {
        assert_eq!(modify_window_for(0, &drive("vfat")), 1);
        assert_eq!(modify_window_for(0, &drive("ext4")), 0);
        assert_eq!(modify_window_for(3, &drive("vfat")), 3);
    }

    #[test]
    fn mirror_summary_mentions_unmount_problem() {
        let outcome = MirrorOutcome {
            backup_type: BackupType::Home,
            source: PathBuf::from("/home/u"),
            destination: PathBuf::from("/mnt/bkmirror/u"),
            stats: SyncStats {
                files_copied: 2,
                bytes_copied: 2048,
                ..Default::default()
            },
            unmount_error: Some("/mnt/bkmirror/u is busy".to_string()),
        };
        let summary = outcome.summary();
        assert!(summary.contains("2 file(s) copied"));
        assert!(summary.contains("drive left mounted"));
    }
}
