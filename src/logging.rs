//! Tracing setup for bkmirror.
//!
//! Console output for interactive runs, JSON when the caller wants to feed
//! the log into something else. Everything goes to stderr so listings
//! printed on stdout stay clean.

use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per event.
    pub json: bool,
    /// Default level DEBUG instead of INFO.
    pub verbose: bool,
}

/// Install the global subscriber. `RUST_LOG` overrides the default level.
///
/// Calling this twice is harmless; the second call is ignored.
pub fn init(config: LogConfig) {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("bkmirror={}", level.as_str().to_lowercase()))
    });

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Rate limit for log lines emitted once per entry inside a walk.
///
/// Lines held back are counted, and the next line let through reports how
/// many were dropped, so a burst of identical failures on a dying drive costs
/// one warning per interval instead of one per file.
#[derive(Debug)]
pub struct LogThrottle {
    every: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(dropped)` when a line may be logged now, with the number of
    /// lines held back since the last one. The first call always passes.
    pub fn admit(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.every => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    /// Lines held back and not yet reported.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_counted_and_reported_on_next_pass() {
        let mut throttle = LogThrottle::new(Duration::from_millis(50));
        assert_eq!(throttle.admit(), Some(0));
        assert_eq!(throttle.admit(), None);
        assert_eq!(throttle.admit(), None);
        assert_eq!(throttle.suppressed(), 2);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(throttle.admit(), Some(2));
        assert_eq!(throttle.suppressed(), 0);
    }

    #[test]
    fn zero_interval_never_holds_back() {
        let mut throttle = LogThrottle::new(Duration::ZERO);
        assert_eq!(throttle.admit(), Some(0));
        assert_eq!(throttle.admit(), Some(0));
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(LogConfig::default());
        init(LogConfig {
            json: true,
            verbose: true,
        });
    }
}
