use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::progress::EtaWarmup;
use crate::core::verifier::VerifyOptions;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bkmirror/config.toml";
pub const ENV_PREFIX: &str = "BKMIRROR_";

/// Copy-time exclusions for a full-system backup. Mount points and
/// pseudo-filesystems keep their directory but lose their contents.
pub fn default_system_exclusions() -> Vec<String> {
    [
        "/proc/*",
        "/sys/*",
        "/dev/*",
        "/run/*",
        "/tmp/*",
        "/mnt/*",
        "/media/*",
        "/lost+found",
        ".cache/*",
        "/swapfile",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_home_exclusions() -> Vec<String> {
    vec![".cache/*".to_string(), ".local/share/Trash".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub lock_path: PathBuf,
    pub mount_base: PathBuf,
    pub progress_interval_ms: u64,
    pub sample_budget_secs: u64,
    pub max_samples: usize,
    pub modify_window_secs: u64,
    pub eta_warmup_secs: u64,
    pub eta_warmup_bytes: u64,
    pub system_exclusions: Vec<String>,
    pub home_exclusions: Vec<String>,
    /// Overrides home directory detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<PathBuf>,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from("/run/bkmirror.lock"),
            mount_base: PathBuf::from("/mnt/bkmirror"),
            progress_interval_ms: 200,
            sample_budget_secs: 10,
            max_samples: 5000,
            modify_window_secs: 0,
            eta_warmup_secs: 5,
            eta_warmup_bytes: 16 * 1024 * 1024,
            system_exclusions: default_system_exclusions(),
            home_exclusions: default_home_exclusions(),
            home_dir: None,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Defaults, then the system config file, then `BKMIRROR_*` variables,
    /// then CLI overrides.
    pub fn new<T: Serialize>(cli_overrides: Option<&T>) -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH), cli_overrides)
    }

    pub fn load<T: Serialize>(file: &Path, cli_overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_interval_ms == 0 {
            anyhow::bail!("progress_interval_ms must be greater than zero");
        }
        if !self.mount_base.is_absolute() {
            anyhow::bail!(
                "mount_base must be an absolute path: {}",
                self.mount_base.display()
            );
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn eta_warmup(&self) -> EtaWarmup {
        EtaWarmup {
            min_elapsed: Duration::from_secs(self.eta_warmup_secs),
            min_bytes: self.eta_warmup_bytes,
        }
    }

    pub fn verify_options(&self, checksum: bool) -> VerifyOptions {
        VerifyOptions {
            sample_budget: Duration::from_secs(self.sample_budget_secs),
            max_samples: self.max_samples,
            modify_window_secs: self.modify_window_secs,
            checksum,
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_samples: Option<usize>,
    }

    #[test]
    fn defaults_without_file() {
        let temp = tempdir().unwrap();
        let config =
            AppConfig::load(&temp.path().join("absent.toml"), None::<&Overrides>).unwrap();
        assert_eq!(config.progress_interval_ms, 200);
        assert_eq!(config.mount_base, PathBuf::from("/mnt/bkmirror"));
        assert!(config.system_exclusions.contains(&"/proc/*".to_string()));
    }

    #[test]
    fn file_then_cli_layering() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "max_samples = 100\nverbose = false\nsample_budget_secs = 3\n")
            .unwrap();

        let overrides = Overrides {
            verbose: Some(true),
            max_samples: None,
        };
        let config = AppConfig::load(&path, Some(&overrides)).unwrap();
        assert_eq!(config.max_samples, 100);
        assert_eq!(config.sample_budget_secs, 3);
        assert!(config.verbose);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "progress_interval_ms = 0\n").unwrap();
        assert!(AppConfig::load(&path, None::<&Overrides>).is_err());
    }

    #[test]
    fn toml_round_trip_of_defaults() {
        let text = AppConfig::default().to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, AppConfig::default());
    }
}
