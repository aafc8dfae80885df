//! Post-hoc integrity audit of a completed mirror.
//!
//! Three phases run in order and accumulate into one [`VerificationReport`]:
//!
//! 1. structural: top-level directories and critical files exist,
//! 2. sampling: a time-bounded random sample of source files matches,
//! 3. reverse: nothing in the destination is absent from the source.
//!
//! Mismatches never abort the audit. Cancellation returns the partial report
//! with `is_final == false`.

pub mod sampler;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::fmt;
use std::fs::{self, Metadata};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use walkdir::WalkDir;

use crate::core::exclusion::ProtectedSet;
use crate::core::hardware::FsUsage;
use crate::core::models::{BackupType, OperationPhase, ProgressUpdate};
use crate::error::{Error, Result};
use sampler::Sampler;

/// Files whose absence makes a restored system unusable.
pub const SYSTEM_CRITICAL_FILES: &[&str] = &[
    "etc/fstab",
    "etc/passwd",
    "etc/group",
    "etc/shadow",
    "etc/hostname",
    "etc/os-release",
];

pub const HOME_CRITICAL_FILES: &[&str] = &[".bashrc", ".profile"];

pub fn critical_files(backup_type: BackupType) -> &'static [&'static str] {
    match backup_type {
        BackupType::System => SYSTEM_CRITICAL_FILES,
        BackupType::Home | BackupType::SelectiveHome => HOME_CRITICAL_FILES,
    }
}

const STRUCTURAL_WEIGHT: f64 = 0.05;
const SAMPLING_WEIGHT: f64 = 0.45;
const REVERSE_WEIGHT: f64 = 0.50;

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Wall-clock target for the sampling phase.
    pub sample_budget: Duration,
    pub max_samples: usize,
    pub modify_window_secs: u64,
    /// Also compare BLAKE3 digests of sampled files.
    pub checksum: bool,
    /// Fixed RNG seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            sample_budget: Duration::from_secs(10),
            max_samples: 5000,
            modify_window_secs: 0,
            checksum: false,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MismatchReason {
    SizeDiffers { source: u64, destination: u64 },
    MtimeDiffers { source: i64, destination: i64 },
    ContentDiffers,
    /// Source holds a regular file or directory, destination something else.
    TypeDiffers,
    Unreadable(String),
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeDiffers {
                source,
                destination,
            } => write!(f, "size differs ({} vs {})", source, destination),
            Self::MtimeDiffers {
                source,
                destination,
            } => write!(f, "mtime differs ({} vs {})", source, destination),
            Self::ContentDiffers => f.write_str("content differs"),
            Self::TypeDiffers => f.write_str("entry type differs"),
            Self::Unreadable(reason) => write!(f, "unreadable: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMismatch {
    pub relative_path: PathBuf,
    pub reason: MismatchReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub missing: Vec<PathBuf>,
    pub extra: Vec<PathBuf>,
    pub sampled: u64,
    pub mismatches: Vec<FileMismatch>,
    /// False when the audit was cancelled before all phases ran.
    pub is_final: bool,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.mismatches.is_empty()
    }

    fn record_missing(&mut self, relative: PathBuf) {
        if !self.missing.contains(&relative) {
            self.missing.push(relative);
        }
    }

    pub fn summary(&self) -> String {
        let status = match (self.is_final, self.is_clean()) {
            (false, _) => "Verification cancelled",
            (true, true) => "Verification passed",
            (true, false) => "Verification found problems",
        };
        format!(
            "{}: {} sampled, {} missing, {} extra, {} mismatched",
            status,
            self.sampled,
            self.missing.len(),
            self.extra.len(),
            self.mismatches.len()
        )
    }

    /// Summary plus the first `limit` entries of each list.
    pub fn details(&self, limit: usize) -> String {
        let mut msg = self.summary();
        let mut section = |title: &str, lines: Vec<String>| {
            if lines.is_empty() {
                return;
            }
            msg.push_str(&format!("\n{}:", title));
            for line in lines.iter().take(limit) {
                msg.push_str(&format!("\n  - {}", line));
            }
            if lines.len() > limit {
                msg.push_str(&format!("\n  ... and {} more", lines.len() - limit));
            }
        };
        section(
            "Missing",
            self.missing.iter().map(|p| p.display().to_string()).collect(),
        );
        section(
            "Extra",
            self.extra.iter().map(|p| p.display().to_string()).collect(),
        );
        section(
            "Mismatched",
            self.mismatches
                .iter()
                .map(|m| format!("{}: {}", m.relative_path.display(), m.reason))
                .collect(),
        );
        msg
    }
}

/// Hash a file with BLAKE3, streaming in chunks.
fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let file = fs::File::open(path)?;
    let mut reader = io::BufReader::with_capacity(128 * 1024, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 128 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Strong content comparison. Reads both files in full; never used for the
/// incremental copy decision.
pub fn content_matches(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(hash_file(a)? == hash_file(b)?)
}

/// Monotonic progress across weighted phases.
///
/// Within a phase, `t / (t + tau)` stands in for completion while the real
/// amount of work is unknown; as time passes the weight shifts to the
/// count-based fraction.
struct ProgressBlend {
    tx: watch::Sender<ProgressUpdate>,
    base: f64,
    weight: f64,
    tau: f64,
    phase: OperationPhase,
    started: Instant,
    best: f64,
}

impl ProgressBlend {
    fn new(tx: watch::Sender<ProgressUpdate>) -> Self {
        Self {
            tx,
            base: 0.0,
            weight: 0.0,
            tau: 1.0,
            phase: OperationPhase::Idle,
            started: Instant::now(),
            best: 0.0,
        }
    }

    fn enter(&mut self, phase: OperationPhase, weight: f64, tau: Duration) {
        self.base += self.weight;
        self.weight = weight;
        self.tau = tau.as_secs_f64().max(0.001);
        self.phase = phase;
        self.started = Instant::now();
        self.publish(0.0, format!("Verification: {}", phase));
    }

    fn within_phase(&self, count_fraction: f64) -> f64 {
        let t = self.started.elapsed().as_secs_f64();
        // The time estimate doubles as the weight given to the count.
        let w = t / (t + self.tau);
        let count = count_fraction.clamp(0.0, 1.0);
        (1.0 - w) * w + w * count
    }

    fn publish(&mut self, count_fraction: f64, message: impl Into<String>) {
        let value = (self.base + self.weight * self.within_phase(count_fraction)).min(1.0);
        self.best = self.best.max(value);
        self.tx
            .send_replace(ProgressUpdate::running(self.phase, self.best, message));
    }
}

pub struct Verifier {
    source: PathBuf,
    destination: PathBuf,
    backup_type: BackupType,
    options: VerifyOptions,
    protected: ProtectedSet,
    cancel: CancellationToken,
    progress: watch::Sender<ProgressUpdate>,
}

impl Verifier {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        backup_type: BackupType,
        options: VerifyOptions,
    ) -> Self {
        let (progress, _) = watch::channel(ProgressUpdate::idle());
        Self {
            source: source.into(),
            destination: destination.into(),
            backup_type,
            options,
            protected: ProtectedSet::for_backup(backup_type),
            cancel: CancellationToken::new(),
            progress,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish progress into an existing channel instead of a private one.
    pub fn with_progress(mut self, progress: watch::Sender<ProgressUpdate>) -> Self {
        self.progress = progress;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }

    /// Run all three phases. Errors only when either root cannot be read.
    pub fn run(&self) -> Result<VerificationReport> {
        let span = info_span!(
            "verify",
            source = %self.source.display(),
            destination = %self.destination.display(),
            backup_type = %self.backup_type
        );
        let _enter = span.enter();

        let source_meta = fs::metadata(&self.source).map_err(|e| Error::io(&self.source, e))?;
        fs::read_dir(&self.destination).map_err(|e| Error::io(&self.destination, e))?;

        let mut report = VerificationReport::default();
        let mut blend = ProgressBlend::new(self.progress.clone());
        let start = Instant::now();

        blend.enter(OperationPhase::Structural, STRUCTURAL_WEIGHT, Duration::from_secs(1));
        self.structural(&source_meta, &mut report);
        if self.cancel.is_cancelled() {
            return Ok(self.cancelled(report));
        }

        blend.enter(
            OperationPhase::Sampling,
            SAMPLING_WEIGHT,
            self.options.sample_budget / 2,
        );
        if !self.sampling(&mut report, &mut blend)? {
            return Ok(self.cancelled(report));
        }

        blend.enter(OperationPhase::Reverse, REVERSE_WEIGHT, Duration::from_secs(10));
        if !self.reverse(&mut report, &mut blend) {
            return Ok(self.cancelled(report));
        }

        report.is_final = true;
        info!(
            sampled = report.sampled,
            missing = report.missing.len(),
            extra = report.extra.len(),
            mismatches = report.mismatches.len(),
            duration_secs = start.elapsed().as_secs(),
            "Verification complete"
        );
        Ok(report)
    }

    fn cancelled(&self, mut report: VerificationReport) -> VerificationReport {
        report.is_final = false;
        info!(sampled = report.sampled, "Verification cancelled");
        report
    }

    fn structural(&self, source_meta: &Metadata, report: &mut VerificationReport) {
        let root_dev = source_meta.dev();
        match fs::read_dir(&self.source) {
            Ok(entries) => {
                for entry in entries.filter_map(|e| e.ok()) {
                    let relative = PathBuf::from(entry.file_name());
                    if self.protected.contains(&relative) {
                        continue;
                    }
                    let Ok(meta) = entry.metadata() else {
                        continue;
                    };
                    if !meta.is_dir() || meta.dev() != root_dev {
                        continue;
                    }
                    let dest = self.destination.join(&relative);
                    match dest.symlink_metadata() {
                        Ok(m) if m.is_dir() => {}
                        Ok(_) => report.mismatches.push(FileMismatch {
                            relative_path: relative,
                            reason: MismatchReason::TypeDiffers,
                        }),
                        Err(_) => {
                            debug!(path = %relative.display(), "Top-level directory missing");
                            report.record_missing(relative);
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Cannot list source root for structural check"),
        }

        for critical in critical_files(self.backup_type) {
            let relative = PathBuf::from(critical);
            if self.source.join(&relative).symlink_metadata().is_err() {
                continue;
            }
            if self.destination.join(&relative).symlink_metadata().is_err() {
                warn!(path = %relative.display(), "Critical file missing from destination");
                report.record_missing(relative);
            }
        }
    }

    fn rng(&self) -> StdRng {
        match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Returns false when cancelled.
    fn sampling(&self, report: &mut VerificationReport, blend: &mut ProgressBlend) -> Result<bool> {
        let deadline = Instant::now() + self.options.sample_budget;
        let mut sampler = Sampler::new(&self.source, &self.protected, self.rng())
            .map_err(|e| Error::io(&self.source, e))?;
        let max = self.options.max_samples.max(1);

        while (report.sampled as usize) < self.options.max_samples && Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let Some(relative) = sampler.next_sample(deadline) else {
                debug!(sampled = report.sampled, "Source tree exhausted or sample budget spent");
                break;
            };
            if self.check_sample(&relative, report) {
                report.sampled += 1;
            }
            blend.publish(
                report.sampled as f64 / max as f64,
                format!("Sampled {} file(s)", report.sampled),
            );
        }

        info!(
            sampled = report.sampled,
            directories = sampler.directories_listed(),
            "Sampling phase finished"
        );
        Ok(true)
    }

    /// Compare one sampled file. Returns false when the source vanished and
    /// the sample does not count.
    fn check_sample(&self, relative: &Path, report: &mut VerificationReport) -> bool {
        let source_path = self.source.join(relative);
        let dest_path = self.destination.join(relative);

        let Ok(source) = source_path.symlink_metadata() else {
            return false;
        };
        let dest = match dest_path.symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.record_missing(relative.to_path_buf());
                return true;
            }
            Err(e) => {
                report.mismatches.push(FileMismatch {
                    relative_path: relative.to_path_buf(),
                    reason: MismatchReason::Unreadable(e.to_string()),
                });
                return true;
            }
        };

        let reason = if !dest.file_type().is_file() {
            Some(MismatchReason::TypeDiffers)
        } else if source.len() != dest.len() {
            Some(MismatchReason::SizeDiffers {
                source: source.len(),
                destination: dest.len(),
            })
        } else if source.mtime().abs_diff(dest.mtime()) > self.options.modify_window_secs {
            Some(MismatchReason::MtimeDiffers {
                source: source.mtime(),
                destination: dest.mtime(),
            })
        } else if self.options.checksum {
            match content_matches(&source_path, &dest_path) {
                Ok(true) => None,
                Ok(false) => Some(MismatchReason::ContentDiffers),
                Err(e) => Some(MismatchReason::Unreadable(e.to_string())),
            }
        } else {
            None
        };

        if let Some(reason) = reason {
            debug!(path = %relative.display(), %reason, "Sample mismatch");
            report.mismatches.push(FileMismatch {
                relative_path: relative.to_path_buf(),
                reason,
            });
        }
        true
    }

    /// Returns false when cancelled.
    fn reverse(&self, report: &mut VerificationReport, blend: &mut ProgressBlend) -> bool {
        let expected = FsUsage::of(&self.destination)
            .map(|u| u.inodes_used)
            .unwrap_or(0);
        let mut visited: u64 = 0;
        let root_dev = match fs::metadata(&self.destination) {
            Ok(meta) => meta.dev(),
            Err(e) => {
                warn!(error = %e, "Cannot stat destination root for reverse check");
                return true;
            }
        };

        let mut it = WalkDir::new(&self.destination)
            .min_depth(1)
            .follow_links(false)
            .same_file_system(true)
            .into_iter();

        while let Some(entry) = it.next() {
            if self.cancel.is_cancelled() {
                return false;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Reverse walk error");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(&self.destination) else {
                continue;
            };
            let relative = relative.to_path_buf();
            if self.protected.contains(&relative) {
                if entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }

            if entry.file_type().is_dir() && entry.metadata().is_ok_and(|m| m.dev() != root_dev) {
                it.skip_current_dir();
                continue;
            }

            visited += 1;
            match self.source.join(&relative).symlink_metadata() {
                Ok(source) => {
                    if entry.file_type().is_dir() && !source.is_dir() {
                        report.mismatches.push(FileMismatch {
                            relative_path: relative,
                            reason: MismatchReason::TypeDiffers,
                        });
                        it.skip_current_dir();
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %relative.display(), "Extra entry in destination");
                    report.extra.push(relative);
                    if entry.file_type().is_dir() {
                        it.skip_current_dir();
                    }
                }
                Err(e) => debug!(path = %relative.display(), error = %e, "Cannot stat source entry"),
            }

            if visited % 256 == 0 {
                let fraction = if expected > 0 {
                    visited as f64 / expected as f64
                } else {
                    0.0
                };
                blend.publish(fraction, format!("Checked {} destination entries", visited));
            }
        }

        info!(entries = visited, extra = report.extra.len(), "Reverse check finished");
        true
    }
}
