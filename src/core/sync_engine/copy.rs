//! Per-entry copy primitives for the synchronizer.

use filetime::FileTime;
use nix::unistd::{Gid, Uid, chown};
use std::fs::{self, DirBuilder, File, Metadata, Permissions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt, lchown, symlink};
use std::path::{Path, PathBuf};
use tracing::debug;

const SMALL_FILE: u64 = 1024 * 1024;
const MEDIUM_FILE: u64 = 64 * 1024 * 1024;

/// Copy buffer size for a file of `len` bytes. Small files get a small
/// buffer, large sequential copies a bigger one.
pub fn buffer_size_for(len: u64) -> usize {
    if len < SMALL_FILE {
        64 * 1024
    } else if len < MEDIUM_FILE {
        1024 * 1024
    } else {
        4 * 1024 * 1024
    }
}

/// Incremental decision: copy when the destination is missing or not a
/// regular file, when sizes differ, or when the source mtime is strictly
/// newer (whole seconds, beyond `modify_window` seconds).
///
/// Equal size with an equal-or-newer destination mtime means up to date;
/// no content is read.
pub fn needs_copy(source: &Metadata, dest: Option<&Metadata>, modify_window: u64) -> bool {
    let Some(dest) = dest else {
        return true;
    };
    if !dest.file_type().is_file() {
        return true;
    }
    if dest.len() != source.len() {
        return true;
    }
    source.mtime() > dest.mtime().saturating_add(modify_window as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Copied(u64),
    Created,
    UpToDate,
}

/// Error from a single entry. Never fatal on its own.
#[derive(Debug)]
pub struct EntryError {
    pub message: String,
    pub source: io::Error,
}

impl EntryError {
    fn new(context: &str, source: io::Error) -> Self {
        Self {
            message: format!("{}: {}", context, source),
            source,
        }
    }

    /// The entry disappeared between listing and copying. Normal on a live system.
    pub fn is_vanished(&self) -> bool {
        self.source.kind() == ErrorKind::NotFound
    }

    pub fn is_device_error(&self) -> bool {
        is_device_removed_error(&self.source)
    }
}

/// Synchronize one regular file.
pub fn sync_file(
    source: &Path,
    dest: &Path,
    source_meta: &Metadata,
    modify_window: u64,
    sync_files: bool,
) -> Result<EntryOutcome, EntryError> {
    let dest_meta = fs::symlink_metadata(dest).ok();

    if let Some(meta) = &dest_meta {
        if meta.is_dir() {
            fs::remove_dir_all(dest)
                .map_err(|e| EntryError::new("Failed to replace directory with file", e))?;
        } else if meta.file_type().is_symlink() {
            fs::remove_file(dest)
                .map_err(|e| EntryError::new("Failed to replace symlink with file", e))?;
        }
    }

    let dest_meta = dest_meta.filter(|m| m.is_file());
    if !needs_copy(source_meta, dest_meta.as_ref(), modify_window) {
        return Ok(EntryOutcome::UpToDate);
    }

    let bytes = copy_contents(source, dest, source_meta.len(), sync_files)?;
    apply_metadata(dest, source_meta, false);
    Ok(EntryOutcome::Copied(bytes))
}

fn copy_contents(
    source: &Path,
    dest: &Path,
    len: u64,
    sync_file: bool,
) -> Result<u64, EntryError> {
    let buffer_size = buffer_size_for(len);

    let source_file =
        File::open(source).map_err(|e| EntryError::new("Failed to open source file", e))?;
    let mut reader = BufReader::with_capacity(buffer_size, source_file);

    let dest_file = match File::create(dest) {
        Ok(f) => f,
        // A read-only leftover from an earlier run.
        Err(e) if e.kind() == ErrorKind::PermissionDenied && dest.exists() => {
            fs::remove_file(dest)
                .map_err(|e| EntryError::new("Failed to remove read-only destination", e))?;
            File::create(dest).map_err(|e| EntryError::new("Failed to create destination file", e))?
        }
        Err(e) => return Err(EntryError::new("Failed to create destination file", e)),
    };
    let mut writer = BufWriter::with_capacity(buffer_size, dest_file);

    let mut buffer = vec![0u8; buffer_size];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| EntryError::new("Failed to read from source", e))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| EntryError::new("Failed to write to destination", e))?;
        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| EntryError::new("Failed to flush destination file", e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| EntryError::new("Failed to get inner file handle", e.into_error()))?;
        inner
            .sync_all()
            .map_err(|e| EntryError::new("Failed to sync file", e))?;
    }

    Ok(bytes_written)
}

/// Recreate a symlink verbatim. The target is never dereferenced.
pub fn sync_symlink(source: &Path, dest: &Path, source_meta: &Metadata) -> Result<EntryOutcome, EntryError> {
    let target = fs::read_link(source).map_err(|e| EntryError::new("Failed to read link", e))?;

    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(dest).ok().as_deref() == Some(target.as_path()) {
                return Ok(EntryOutcome::UpToDate);
            }
            fs::remove_file(dest).map_err(|e| EntryError::new("Failed to replace symlink", e))?;
        }
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(dest)
                .map_err(|e| EntryError::new("Failed to replace directory with symlink", e))?;
        }
        Ok(_) => {
            fs::remove_file(dest)
                .map_err(|e| EntryError::new("Failed to replace file with symlink", e))?;
        }
        Err(_) => {}
    }

    symlink(&target, dest).map_err(|e| EntryError::new("Failed to create symlink", e))?;
    apply_metadata(dest, source_meta, true);
    Ok(EntryOutcome::Created)
}

/// Metadata of a directory whose ownership and times are applied once its
/// contents have been written.
#[derive(Debug, Clone)]
pub struct PendingDir {
    pub dest: PathBuf,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: FileTime,
    mtime: FileTime,
}

/// Make sure `dest` is a directory. Created directories stay owner-writable
/// until [`finish_dir`] applies the exact source mode.
pub fn ensure_dir(dest: &Path, source_meta: &Metadata) -> Result<(EntryOutcome, PendingDir), EntryError> {
    let mode = source_meta.mode() & 0o7777;

    let outcome = match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => EntryOutcome::UpToDate,
        Ok(_) => {
            fs::remove_file(dest)
                .map_err(|e| EntryError::new("Failed to replace file with directory", e))?;
            create_dir(dest, mode)?;
            EntryOutcome::Created
        }
        Err(_) => {
            create_dir(dest, mode)?;
            EntryOutcome::Created
        }
    };

    let pending = PendingDir {
        dest: dest.to_path_buf(),
        mode,
        uid: source_meta.uid(),
        gid: source_meta.gid(),
        atime: FileTime::from_last_access_time(source_meta),
        mtime: FileTime::from_last_modification_time(source_meta),
    };
    Ok((outcome, pending))
}

fn create_dir(dest: &Path, mode: u32) -> Result<(), EntryError> {
    DirBuilder::new()
        .mode(mode | 0o700)
        .create(dest)
        .map_err(|e| EntryError::new("Failed to create directory", e))
}

pub fn finish_dir(dir: &PendingDir) {
    if let Err(e) = fs::set_permissions(&dir.dest, Permissions::from_mode(dir.mode)) {
        debug!(dest = %dir.dest.display(), error = %e, "Failed to set directory permissions");
    }
    if let Err(e) = chown(
        &dir.dest,
        Some(Uid::from_raw(dir.uid)),
        Some(Gid::from_raw(dir.gid)),
    ) {
        debug!(dest = %dir.dest.display(), error = %e, "Failed to set directory ownership");
    }
    if let Err(e) = filetime::set_file_times(&dir.dest, dir.atime, dir.mtime) {
        debug!(dest = %dir.dest.display(), error = %e, "Failed to set directory timestamps");
    }
}

/// Apply mode, ownership and both timestamps. Failures are logged only:
/// ownership cannot be set without privileges and some filesystems reject
/// permission bits entirely.
fn apply_metadata(dest: &Path, source_meta: &Metadata, is_symlink: bool) {
    let uid = source_meta.uid();
    let gid = source_meta.gid();
    let atime = FileTime::from_last_access_time(source_meta);
    let mtime = FileTime::from_last_modification_time(source_meta);

    if is_symlink {
        if let Err(e) = lchown(dest, Some(uid), Some(gid)) {
            debug!(dest = %dest.display(), error = %e, "Failed to set symlink ownership");
        }
        if let Err(e) = filetime::set_symlink_file_times(dest, atime, mtime) {
            debug!(dest = %dest.display(), error = %e, "Failed to set symlink timestamps");
        }
        return;
    }

    // chown may clear setuid/setgid bits, so it goes before chmod.
    if let Err(e) = chown(dest, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file ownership");
    }
    if let Err(e) = fs::set_permissions(dest, source_meta.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }
}

/// Check if an I/O error indicates the underlying device has gone away.
pub fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => true,
        _ => error.raw_os_error().is_some_and(|errno| {
            matches!(
                errno,
                libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::EMEDIUMTYPE
            )
        }),
    }
}
