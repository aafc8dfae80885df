//! Backup manifest stored at the destination root.
//!
//! Plain text, one `Key: value` per line. Written when a backup starts and
//! read back by restore and verify to detect the backup type.

use chrono::{DateTime, Local};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::core::models::BackupType;
use crate::error::{Error, Result};

pub const MANIFEST_FILE_NAME: &str = "backup-manifest.txt";

static LINE_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z][A-Za-z ]*?)\s*:\s*(.*?)\s*$"));

fn line_pattern() -> Result<&'static Regex> {
    LINE_RE
        .as_ref()
        .map_err(|e| Error::Other(anyhow::anyhow!("invalid manifest line pattern: {}", e)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub hostname: String,
    pub kernel: String,
    pub architecture: String,
    pub created: DateTime<Local>,
    pub backup_type: BackupType,
}

impl Manifest {
    /// Describe the running host.
    pub fn for_current_host(backup_type: BackupType) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let (kernel, architecture) = match nix::sys::utsname::uname() {
            Ok(uts) => (
                uts.release().to_string_lossy().into_owned(),
                uts.machine().to_string_lossy().into_owned(),
            ),
            Err(_) => ("unknown".to_string(), std::env::consts::ARCH.to_string()),
        };

        Self {
            hostname,
            kernel,
            architecture,
            created: Local::now(),
            backup_type,
        }
    }

    pub fn path_in(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE_NAME)
    }

    pub fn render(&self) -> String {
        format!(
            "BACKUP TYPE: {}\nCreated: {}\nHostname: {}\nKernel: {}\nArchitecture: {}\nBackup Type: {}\n",
            self.backup_type.title(),
            self.created.to_rfc3339(),
            self.hostname,
            self.kernel,
            self.architecture,
            self.backup_type.as_str(),
        )
    }

    /// Parse manifest text. Unknown lines are ignored; the backup type is the
    /// only required field (`Backup Type`, falling back to the header line).
    pub fn parse(text: &str) -> Result<Self> {
        let mut hostname = None;
        let mut kernel = None;
        let mut architecture = None;
        let mut created = None;
        let mut backup_type = None;
        let mut header_type = None;
        let pattern = line_pattern()?;

        for line in text.lines() {
            let Some(caps) = pattern.captures(line) else {
                continue;
            };
            let value = caps[2].to_string();
            match &caps[1] {
                "BACKUP TYPE" => header_type = BackupType::parse(&value),
                "Backup Type" => backup_type = BackupType::parse(&value),
                "Hostname" => hostname = Some(value),
                "Kernel" => kernel = Some(value),
                "Architecture" => architecture = Some(value),
                "Created" => {
                    created = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|dt| dt.with_timezone(&Local));
                }
                other => debug!(key = other, "Ignoring unknown manifest key"),
            }
        }

        let backup_type = backup_type
            .or(header_type)
            .ok_or_else(|| Error::Config("manifest does not declare a backup type".to_string()))?;

        Ok(Self {
            hostname: hostname.unwrap_or_default(),
            kernel: kernel.unwrap_or_default(),
            architecture: architecture.unwrap_or_default(),
            created: created.unwrap_or_else(Local::now),
            backup_type,
        })
    }

    pub fn write_to(&self, root: &Path) -> Result<()> {
        let path = Self::path_in(root);
        fs::write(&path, self.render()).map_err(|e| Error::io(&path, e))?;
        info!(path = %path.display(), backup_type = %self.backup_type, "Wrote backup manifest");
        Ok(())
    }

    pub fn read_from(root: &Path) -> Result<Self> {
        let path = Self::path_in(root);
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "no readable backup manifest at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    /// Where a restore of this backup lands by default.
    pub fn restore_target(&self, home: &Path) -> PathBuf {
        match self.backup_type {
            BackupType::System => PathBuf::from("/"),
            BackupType::Home | BackupType::SelectiveHome => home.to_path_buf(),
        }
    }
}
