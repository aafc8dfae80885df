//! Cost-bounded progress estimation for mirror runs.
//!
//! A full pre-scan of the source is as expensive as the copy itself, so the
//! estimate comes from filesystem statistics instead: one usage reading of
//! each side at start, then one destination reading per tick.
//!
//! `fraction = destination_used_now / source_used_at_start`, clamped to 1.
//! The ETA uses bytes written during this session only and is withheld until
//! enough time and data have passed to make the rate meaningful.
//!
//! Destination usage includes unrelated data and filesystem overhead, so the
//! fraction is approximate. It never moves backwards.

use std::time::Duration;

/// Thresholds the session must clear before an ETA is reported.
#[derive(Debug, Clone, Copy)]
pub struct EtaWarmup {
    pub min_elapsed: Duration,
    pub min_bytes: u64,
}

impl Default for EtaWarmup {
    fn default() -> Self {
        Self {
            min_elapsed: Duration::from_secs(5),
            min_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Normal,
    /// Destination statistics could not be read this tick. The fraction, if
    /// any, is the last one measured.
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// `None` when indeterminate.
    pub fraction: Option<f64>,
    pub eta: Option<Duration>,
    pub session_bytes: u64,
    pub confidence: Confidence,
}

impl Estimate {
    /// Fraction in `[0, 1]`, or `-1.0` when indeterminate.
    pub fn percentage(&self) -> f64 {
        self.fraction.unwrap_or(crate::core::models::INDETERMINATE)
    }

    pub fn describe(&self) -> String {
        match (self.confidence, self.fraction, self.eta) {
            (Confidence::Low, Some(f), _) => {
                format!("{:.0}% (destination statistics unavailable)", f * 100.0)
            }
            (Confidence::Low, None, _) => "Destination statistics unavailable".to_string(),
            (_, None, _) => "Estimating".to_string(),
            (_, Some(f), Some(eta)) => format!("{:.0}% (about {} left)", f * 100.0, format_eta(eta)),
            (_, Some(f), None) => format!("{:.0}%", f * 100.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    source_used: u64,
    destination_used_start: u64,
    warmup: EtaWarmup,
    /// Best fraction measured so far, `None` until the first readable tick.
    best_fraction: Option<f64>,
}

impl ProgressEstimator {
    pub fn new(source_used: u64, destination_used_start: u64, warmup: EtaWarmup) -> Self {
        Self {
            source_used,
            destination_used_start,
            warmup,
            best_fraction: None,
        }
    }

    /// One tick. `destination_used` is `None` when the reading failed.
    pub fn estimate(&mut self, destination_used: Option<u64>, elapsed: Duration) -> Estimate {
        let Some(used_now) = destination_used else {
            return Estimate {
                fraction: self.best_fraction,
                eta: None,
                session_bytes: 0,
                confidence: Confidence::Low,
            };
        };

        let session_bytes = used_now.saturating_sub(self.destination_used_start);

        if self.source_used == 0 {
            return Estimate {
                fraction: None,
                eta: None,
                session_bytes,
                confidence: Confidence::Normal,
            };
        }

        let raw = (used_now as f64 / self.source_used as f64).min(1.0);
        let best = self.best_fraction.map_or(raw, |b| b.max(raw));
        self.best_fraction = Some(best);

        Estimate {
            fraction: Some(best),
            eta: self.eta(used_now, session_bytes, elapsed),
            session_bytes,
            confidence: Confidence::Normal,
        }
    }

    fn eta(&self, used_now: u64, session_bytes: u64, elapsed: Duration) -> Option<Duration> {
        if elapsed < self.warmup.min_elapsed || session_bytes < self.warmup.min_bytes {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let rate = session_bytes as f64 / secs;
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.source_used.saturating_sub(used_now);
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
