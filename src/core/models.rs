use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Scope of a backup. Drives default source selection, restore routing and
/// the critical-file set used by verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    System,
    Home,
    SelectiveHome,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Home => "home",
            Self::SelectiveHome => "selective-home",
        }
    }

    /// Upper-case title used in the manifest header line.
    pub fn title(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Home => "HOME",
            Self::SelectiveHome => "SELECTIVE HOME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "system" => Some(Self::System),
            "home" => Some(Self::Home),
            "selective-home" | "selectivehome" => Some(Self::SelectiveHome),
            _ => None,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one operation. Built once per invocation and never mutated.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub exclusions: Vec<String>,
    pub backup_type: BackupType,
}

impl BackupConfig {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        exclusions: Vec<String>,
        backup_type: BackupType,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            exclusions,
            backup_type,
        }
    }

    /// Reject identical paths and a source nested inside the destination on
    /// the same filesystem.
    ///
    /// A destination nested inside the source is allowed: the walk prunes it.
    /// A source mounted beneath the destination (restoring a drive into `/`)
    /// is allowed too, since the destination walks never cross into it.
    pub fn validate(&self) -> Result<()> {
        if !self.source.is_absolute() || !self.destination.is_absolute() {
            return Err(Error::Config(format!(
                "source and destination must be absolute paths ({} -> {})",
                self.source.display(),
                self.destination.display()
            )));
        }

        let source = normalize(&self.source);
        let destination = normalize(&self.destination);

        if source == destination {
            return Err(Error::Config(format!(
                "source and destination are the same path: {}",
                source.display()
            )));
        }

        if source.starts_with(&destination) && same_filesystem(&source, &destination) {
            return Err(Error::Config(format!(
                "source {} lies inside destination {}",
                source.display(),
                destination.display()
            )));
        }

        Ok(())
    }
}

/// Unreadable paths count as the same filesystem.
fn same_filesystem(a: &Path, b: &Path) -> bool {
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => true,
    }
}

/// Canonicalize when possible, otherwise fall back to the lexical path.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// A candidate block device as offered to the caller for selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveInfo {
    pub device: PathBuf,
    pub size: u64,
    pub label: String,
    pub uuid: String,
    pub filesystem: String,
    pub encrypted: bool,
    /// Mount point of the device, or of its open encryption mapping.
    pub mount_point: Option<PathBuf>,
    /// Already-open `/dev/mapper/*` device for encrypted drives.
    pub mapped_device: Option<PathBuf>,
}

impl DriveInfo {
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            self.device.to_str().unwrap_or("unnamed")
        } else {
            &self.label
        }
    }
}

/// Phase of a running operation, reported alongside progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationPhase {
    Idle,
    Copying,
    Deleting,
    Structural,
    Sampling,
    Reverse,
    Completed,
    Failed,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Copying => "copying",
            Self::Deleting => "deleting",
            Self::Structural => "structural check",
            Self::Sampling => "sampling",
            Self::Reverse => "reverse check",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of an operation's status, as seen by the polling layer.
///
/// `percentage` is a fraction in `[0, 1]`, or `-1.0` when indeterminate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub phase: OperationPhase,
    pub percentage: f64,
    pub message: String,
    pub done: bool,
    pub error: Option<String>,
}

pub const INDETERMINATE: f64 = -1.0;

impl ProgressUpdate {
    pub fn idle() -> Self {
        Self {
            phase: OperationPhase::Idle,
            percentage: INDETERMINATE,
            message: "Waiting to start".to_string(),
            done: false,
            error: None,
        }
    }

    pub fn running(phase: OperationPhase, percentage: f64, message: impl Into<String>) -> Self {
        Self {
            phase,
            percentage: clamp_percentage(percentage),
            message: message.into(),
            done: false,
            error: None,
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            phase: OperationPhase::Completed,
            percentage: 1.0,
            message: message.into(),
            done: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            phase: OperationPhase::Failed,
            percentage: INDETERMINATE,
            message: format!("Failed: {}", error),
            done: true,
            error: Some(error),
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.percentage < 0.0
    }
}

fn clamp_percentage(p: f64) -> f64 {
    if p.is_nan() || p < 0.0 {
        INDETERMINATE
    } else {
        p.min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backup_type_parses_variants() {
        assert_eq!(BackupType::parse("System"), Some(BackupType::System));
        assert_eq!(
            BackupType::parse("selective home"),
            Some(BackupType::SelectiveHome)
        );
        assert_eq!(
            BackupType::parse("selective-home"),
            Some(BackupType::SelectiveHome)
        );
        assert_eq!(BackupType::parse("bogus"), None);
    }

    #[test]
    fn validate_rejects_same_path() {
        let temp = tempdir().unwrap();
        let cfg = BackupConfig::new(temp.path(), temp.path(), vec![], BackupType::Home);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_source_inside_destination() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("inner");
        std::fs::create_dir(&src).unwrap();
        let cfg = BackupConfig::new(&src, temp.path(), vec![], BackupType::Home);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_allows_destination_inside_source() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("mnt");
        std::fs::create_dir(&dest).unwrap();
        let cfg = BackupConfig::new(temp.path(), &dest, vec![], BackupType::System);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_relative_paths() {
        let cfg = BackupConfig::new("src", "/dest", vec![], BackupType::Home);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn progress_update_clamps() {
        let p = ProgressUpdate::running(OperationPhase::Copying, 1.7, "x");
        assert_eq!(p.percentage, 1.0);
        let p = ProgressUpdate::running(OperationPhase::Copying, f64::NAN, "x");
        assert!(p.is_indeterminate());
    }

    #[test]
    fn failed_update_is_terminal() {
        let p = ProgressUpdate::failed("boom");
        assert!(p.done);
        assert_eq!(p.error.as_deref(), Some("boom"));
        assert_eq!(p.phase, OperationPhase::Failed);
    }
}
