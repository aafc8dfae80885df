//! Error taxonomy for backup, restore and verification operations.
//!
//! Per-file I/O failures never surface here: the walkers log and count them.
//! Everything in this enum is terminal for the operation that produced it.

use std::io;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or overlapping source/destination paths, unreadable manifest.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "insufficient space on destination: {} required, {} available",
        format_bytes(*required),
        format_bytes(*available)
    )]
    Space { required: u64, available: u64 },

    #[error(transparent)]
    Mount(#[from] MountError),

    /// The device (or something nested below it) hosts the running root filesystem.
    #[error("refusing to use {}: it hosts the running root filesystem", device.display())]
    DriveSafety { device: PathBuf },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another operation is already running (pid {pid}, lock {})", path.display())]
    InstanceConflict { pid: i32, path: PathBuf },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Mount-layer failures. Unlock and mount are kept apart so callers can tell
/// a wrong passphrase from a broken filesystem.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("failed to unlock {}: {reason}", device.display())]
    Unlock { device: PathBuf, reason: String },

    #[error("failed to mount {} at {}: {reason}", device.display(), target.display())]
    Mount {
        device: PathBuf,
        target: PathBuf,
        reason: String,
    },

    #[error("{} is busy", target.display())]
    Busy { target: PathBuf },

    #[error("failed to unmount {}: {reason}", target.display())]
    Unmount { target: PathBuf, reason: String },
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
