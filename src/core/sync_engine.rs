//! Native mirror engine: incremental copy followed by mirror deletion.
//!
//! `Synchronizer::run` performs both phases on the calling thread, in order,
//! so deletion never overlaps copying for the same destination. Callers run
//! it on a blocking worker and observe it through [`SyncCounters`] and the
//! phase watch channel.

pub mod copy;
pub mod delete;

use serde::Serialize;
use std::cell::Cell;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use walkdir::WalkDir;

use crate::core::exclusion::{ExclusionMatcher, ProtectedSet};
use crate::core::models::{BackupConfig, OperationPhase, normalize};
use crate::error::{Error, Result};
use crate::logging::LogThrottle;
use copy::{EntryOutcome, PendingDir};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Seconds of mtime slack before a source file counts as newer.
    pub modify_window_secs: u64,
    /// fsync every copied file (slower, survives power loss mid-run).
    pub sync_files: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            modify_window_secs: 0,
            sync_files: false,
        }
    }
}

/// Aggregate outcome of a run. Per-file failures only show up here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub files_copied: u64,
    pub files_up_to_date: u64,
    pub bytes_copied: u64,
    pub dirs_created: u64,
    pub symlinks_created: u64,
    /// Special files and directories on other filesystems.
    pub entries_skipped: u64,
    pub errors: u64,
    pub files_deleted: u64,
    pub dirs_deleted: u64,
}

/// Scalars written by the worker and read by the polling layer.
#[derive(Debug, Default)]
pub struct SyncCounters {
    files_copied: AtomicU64,
    bytes_copied: AtomicU64,
    entries_seen: AtomicU64,
    deletions: AtomicU64,
}

impl SyncCounters {
    fn record_copy(&self, bytes: u64) {
        self.files_copied.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_entry(&self) {
        self.entries_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deletion(&self) {
        self.deletions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_copied(&self) -> u64 {
        self.files_copied.load(Ordering::Relaxed)
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    pub fn entries_seen(&self) -> u64 {
        self.entries_seen.load(Ordering::Relaxed)
    }

    pub fn deletions(&self) -> u64 {
        self.deletions.load(Ordering::Relaxed)
    }
}

pub struct Synchronizer {
    source: PathBuf,
    destination: PathBuf,
    exclusions: ExclusionMatcher,
    protected: ProtectedSet,
    options: SyncOptions,
    cancel: CancellationToken,
    counters: Arc<SyncCounters>,
    phase: watch::Sender<OperationPhase>,
}

impl Synchronizer {
    pub fn new(config: &BackupConfig, options: SyncOptions) -> Self {
        let (phase, _) = watch::channel(OperationPhase::Idle);
        Self {
            source: config.source.clone(),
            destination: config.destination.clone(),
            exclusions: ExclusionMatcher::new(&config.exclusions),
            protected: ProtectedSet::for_backup(config.backup_type),
            options,
            cancel: CancellationToken::new(),
            counters: Arc::new(SyncCounters::default()),
            phase,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn counters(&self) -> Arc<SyncCounters> {
        Arc::clone(&self.counters)
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<OperationPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> OperationPhase {
        *self.phase.borrow()
    }

    /// Copy phase, then deletion phase. Both must succeed for a faithful mirror.
    pub fn run(&self) -> Result<SyncStats> {
        let span = info_span!(
            "mirror",
            source = %self.source.display(),
            destination = %self.destination.display()
        );
        let _enter = span.enter();

        let start = Instant::now();
        let mut stats = SyncStats::default();

        let result = self
            .copy_into(&mut stats)
            .and_then(|()| self.delete_into(&mut stats));

        match result {
            Ok(()) => {
                self.phase.send_replace(OperationPhase::Completed);
                info!(
                    files_copied = stats.files_copied,
                    bytes_copied = stats.bytes_copied,
                    up_to_date = stats.files_up_to_date,
                    deleted = stats.files_deleted + stats.dirs_deleted,
                    errors = stats.errors,
                    duration_secs = start.elapsed().as_secs(),
                    "Mirror complete"
                );
                Ok(stats)
            }
            Err(e) => {
                self.phase.send_replace(OperationPhase::Failed);
                warn!(error = %e, "Mirror failed");
                Err(e)
            }
        }
    }

    /// Copy phase only.
    pub fn sync(&self) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        self.copy_into(&mut stats)?;
        Ok(stats)
    }

    /// Deletion phase only. Run after [`Synchronizer::sync`].
    pub fn delete_extra(&self) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        self.delete_into(&mut stats)?;
        Ok(stats)
    }

    fn copy_into(&self, stats: &mut SyncStats) -> Result<()> {
        self.phase.send_replace(OperationPhase::Copying);
        info!("Copy phase started");
        copy_tree(
            &self.source,
            &self.destination,
            &self.exclusions,
            &self.options,
            &self.cancel,
            &self.counters,
            stats,
        )
    }

    fn delete_into(&self, stats: &mut SyncStats) -> Result<()> {
        self.phase.send_replace(OperationPhase::Deleting);
        info!("Deletion phase started");
        delete::delete_extra(
            &self.source,
            &self.destination,
            &self.protected,
            &self.cancel,
            &self.counters,
            stats,
        )
    }
}

/// Make sure the destination root exists and is writable.
fn prepare_destination(destination: &Path) -> Result<()> {
    fs::create_dir_all(destination).map_err(|e| Error::io(destination, e))?;
    nix::unistd::access(destination, nix::unistd::AccessFlags::W_OK)
        .map_err(|errno| Error::io(destination, errno.into()))?;
    Ok(())
}

fn copy_tree(
    source: &Path,
    destination: &Path,
    exclusions: &ExclusionMatcher,
    options: &SyncOptions,
    cancel: &CancellationToken,
    counters: &SyncCounters,
    stats: &mut SyncStats,
) -> Result<()> {
    let source = normalize(source);
    let root_meta = fs::metadata(&source).map_err(|e| Error::io(&source, e))?;
    if !root_meta.is_dir() {
        return Err(Error::Config(format!(
            "source {} is not a directory",
            source.display()
        )));
    }
    fs::read_dir(&source).map_err(|e| Error::io(&source, e))?;

    prepare_destination(destination)?;
    let destination_norm = normalize(destination);
    let root_dev = root_meta.dev();

    let pruned = Cell::new(0u64);
    let walker = WalkDir::new(&source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let path = entry.path();
            if path == destination_norm {
                debug!(path = %path.display(), "Skipping destination inside source");
                pruned.set(pruned.get() + 1);
                return false;
            }
            if let Ok(relative) = path.strip_prefix(&source) {
                if exclusions.matches(relative) {
                    return false;
                }
            }
            if entry.file_type().is_dir() {
                match entry.metadata() {
                    Ok(meta) if meta.dev() != root_dev => {
                        debug!(path = %path.display(), "Skipping directory on another filesystem");
                        pruned.set(pruned.get() + 1);
                        return false;
                    }
                    _ => {}
                }
            }
            true
        });

    let mut progress_log = LogThrottle::new(Duration::from_secs(5));
    let mut error_log = LogThrottle::new(Duration::from_secs(1));
    let mut pending_dirs: Vec<PendingDir> = Vec::new();

    for next in walker {
        if cancel.is_cancelled() {
            finish_dirs(&pending_dirs);
            stats.entries_skipped += pruned.get();
            return Err(Error::Cancelled);
        }

        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(Error::Other(anyhow::anyhow!(
                        "cannot walk {}: {}",
                        source.display(),
                        e
                    )));
                }
                if let Some(dropped) = error_log.admit() {
                    warn!(error = %e, dropped, "Failed to read source entry");
                }
                stats.errors += 1;
                continue;
            }
        };

        counters.record_entry();
        let Ok(relative) = entry.path().strip_prefix(&source) else {
            continue;
        };
        let dest_path = destination.join(relative);
        let file_type = entry.file_type();

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "Entry vanished before copy");
                continue;
            }
        };

        let result = if file_type.is_dir() {
            copy::ensure_dir(&dest_path, &meta).map(|(outcome, pending)| {
                pending_dirs.push(pending);
                outcome
            })
        } else if file_type.is_file() {
            copy::sync_file(
                entry.path(),
                &dest_path,
                &meta,
                options.modify_window_secs,
                options.sync_files,
            )
        } else if file_type.is_symlink() {
            copy::sync_symlink(entry.path(), &dest_path, &meta)
        } else {
            debug!(path = %entry.path().display(), "Skipping special file");
            stats.entries_skipped += 1;
            continue;
        };

        match result {
            Ok(EntryOutcome::Copied(bytes)) => {
                stats.files_copied += 1;
                stats.bytes_copied += bytes;
                counters.record_copy(bytes);
            }
            Ok(EntryOutcome::Created) if file_type.is_dir() => stats.dirs_created += 1,
            Ok(EntryOutcome::Created) => stats.symlinks_created += 1,
            Ok(EntryOutcome::UpToDate) => {
                if file_type.is_file() {
                    stats.files_up_to_date += 1;
                }
            }
            Err(e) if e.is_vanished() && entry.path().symlink_metadata().is_err() => {
                debug!(path = %relative.display(), "Entry vanished during copy");
            }
            Err(e) => {
                if e.is_device_error() && fs::metadata(destination).is_err() {
                    finish_dirs(&pending_dirs);
                    return Err(Error::io(destination, e.source));
                }
                if let Some(dropped) = error_log.admit() {
                    warn!(path = %relative.display(), error = %e.message, dropped, "Failed to copy entry");
                }
                stats.errors += 1;
            }
        }

        if progress_log.admit().is_some() {
            info!(
                files_copied = stats.files_copied,
                bytes_copied = stats.bytes_copied,
                up_to_date = stats.files_up_to_date,
                errors = stats.errors,
                "Copy progress"
            );
        }
    }

    finish_dirs(&pending_dirs);
    stats.entries_skipped += pruned.get();
    if error_log.suppressed() > 0 {
        warn!(
            dropped = error_log.suppressed(),
            errors = stats.errors,
            "Further copy failures were not logged individually"
        );
    }
    Ok(())
}

/// Deepest directories first so parents' timestamps are set last.
fn finish_dirs(pending: &[PendingDir]) {
    for dir in pending.iter().rev() {
        copy::finish_dir(dir);
    }
}
