//! Logging and tracing initialization.
//!
//! Structured logging via the `tracing` ecosystem: pretty console output by
//! default, optional JSON output, plus a plain-text session log file that
//! backup finalization copies into the backup directory.

use crate::config::AppConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. Call once, early in main(), after the
/// configuration is loaded. `RUST_LOG` overrides the level at runtime.
pub fn init(config: &AppConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("rstor={}", default_level.as_str().to_lowercase()))
    });

    // The session log rides along in every backup, so it never uses ANSI
    // colors. A failure to open it only costs the copy, not the run.
    let session_layer = std::fs::File::create(&config.session_log).ok().map(|f| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Arc::new(f))
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(session_layer);

    if config.json_logs {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// A rate limiter for throttling progress output.
///
/// Archivers emit one line per file; repainting the progress display for
/// every one of them would swamp a slow console.
pub struct LogThrottle {
    interval_ms: u64,
    /// Last emission in ms since `start`, or `NEVER_LOGGED`.
    last_log_ms: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// Returns true if enough time has passed since the last emission.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let should = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        if should {
            // If we lose the race, something else just logged.
            self.last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// Reset the throttle, allowing the next emission immediately.
    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reset_allows_log() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }
}
