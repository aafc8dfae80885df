//! Mirror deletion: remove destination entries that no longer exist in the source.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{SyncCounters, SyncStats};
use crate::core::exclusion::ProtectedSet;
use crate::core::models::normalize;
use crate::error::{Error, Result};

/// Walk `destination` and remove everything absent from `source`.
///
/// Copy-time exclusions are deliberately not consulted; only the protected
/// set is exempt. A directory that is removed is not descended into.
pub fn delete_extra(
    source: &Path,
    destination: &Path,
    protected: &ProtectedSet,
    cancel: &CancellationToken,
    counters: &SyncCounters,
    stats: &mut SyncStats,
) -> Result<()> {
    // An unreadable source would make every destination entry look extra.
    fs::read_dir(source).map_err(|e| Error::io(source, e))?;
    let root_dev = fs::metadata(destination)
        .map_err(|e| Error::io(destination, e))?
        .dev();
    fs::read_dir(destination).map_err(|e| Error::io(destination, e))?;

    // When the source is mounted beneath the destination, it and its
    // ancestors must survive even though the source tree does not hold them.
    let source_within = normalize(source)
        .strip_prefix(normalize(destination))
        .ok()
        .map(Path::to_path_buf);

    let mut walker = WalkDir::new(destination)
        .min_depth(1)
        .follow_links(false)
        .same_file_system(true)
        .into_iter();

    while let Some(next) = walker.next() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Failed to read destination entry");
                stats.errors += 1;
                continue;
            }
        };

        let is_dir = entry.file_type().is_dir();
        let Ok(relative) = entry.path().strip_prefix(destination) else {
            continue;
        };

        if protected.contains(relative) {
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }

        if let Some(keep) = &source_within {
            if keep.starts_with(relative) {
                if keep == relative {
                    walker.skip_current_dir();
                }
                continue;
            }
        }

        // Mount points below the destination belong to other filesystems.
        if is_dir && entry.metadata().is_ok_and(|m| m.dev() != root_dev) {
            debug!(path = %relative.display(), "Skipping mount point in destination");
            walker.skip_current_dir();
            continue;
        }

        let source_path = source.join(relative);
        let remove = match fs::symlink_metadata(&source_path) {
            Ok(source_meta) => is_dir && !source_meta.is_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %source_path.display(), error = %e, "Cannot stat source entry, keeping destination copy");
                stats.errors += 1;
                false
            }
        };

        if !remove {
            continue;
        }

        if is_dir {
            walker.skip_current_dir();
            match remove_tree(entry.path()) {
                Ok(()) => {
                    debug!(path = %relative.display(), "Removed extra directory");
                    stats.dirs_deleted += 1;
                    counters.record_deletion();
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to remove extra directory");
                    stats.errors += 1;
                }
            }
        } else {
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %relative.display(), "Removed extra file");
                    stats.files_deleted += 1;
                    counters.record_deletion();
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to remove extra file");
                    stats.errors += 1;
                }
            }
        }
    }

    Ok(())
}

/// Remove a directory tree without crossing into other filesystems. A
/// mount point inside the tree makes the removal fail instead of emptying
/// the mounted volume.
fn remove_tree(root: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(root)
        .contents_first(true)
        .follow_links(false)
        .same_file_system(true)
    {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"))
        })?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
