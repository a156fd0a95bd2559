//! Cache cleaner configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// Default values for the cleaner configuration
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_CHANGED_PAGES_FOR_PURGE: usize = 50;
const DEFAULT_AVERAGE_ENTITY_TYPES_PER_PAGE: usize = 10;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 200;
const DEFAULT_TIMESTAMP_BATCH_SIZE: usize = 100;
const DEFAULT_CLEANUP_JOIN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SLOW_SWEEP_WARN_MS: u64 = 5_000;

/// Timers silently truncate delays past this bound, so an interval beyond it
/// is rejected at construction instead of misfiring at runtime.
pub const MAX_SWEEP_INTERVAL_SECS: u64 = i32::MAX as u64 / 1_000;

/// Configuration for the notification dispatcher and invalidation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Periodic sweep interval in seconds. `0` disables page caching
    /// entirely.
    pub sweep_interval_secs: u64,
    /// Above this many distinct affected pages, precise invalidation is
    /// abandoned in favor of a full purge.
    pub max_changed_pages_for_purge: usize,
    /// Empirical fan-out estimate used to size the raw-change cap. A
    /// deliberate approximation, kept tunable rather than computed exactly.
    pub average_entity_types_per_page: usize,
    /// Attempts per cache-key removal.
    pub retry_attempts: u32,
    /// Fixed delay between removal attempts.
    pub retry_delay_ms: u64,
    /// Chunk size for batched timestamp-row updates.
    pub timestamp_batch_size: usize,
    /// How long a caller waits for an in-flight cleanup before giving up.
    pub cleanup_join_timeout_ms: u64,
    /// Sweeps slower than this are logged as a warning.
    pub slow_sweep_warn_ms: u64,
    /// Locales every page may be cached under.
    pub supported_locales: Vec<String>,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_changed_pages_for_purge: DEFAULT_MAX_CHANGED_PAGES_FOR_PURGE,
            average_entity_types_per_page: DEFAULT_AVERAGE_ENTITY_TYPES_PER_PAGE,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            timestamp_batch_size: DEFAULT_TIMESTAMP_BATCH_SIZE,
            cleanup_join_timeout_ms: DEFAULT_CLEANUP_JOIN_TIMEOUT_MS,
            slow_sweep_warn_ms: DEFAULT_SLOW_SWEEP_WARN_MS,
            supported_locales: vec!["en".to_string()],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CleanerConfigError {
    #[error("sweep interval {actual}s exceeds the maximum timer delay of {max}s")]
    SweepIntervalTooLarge { actual: u64, max: u64 },
    #[error("{0} must be greater than zero")]
    ZeroField(&'static str),
    #[error("supported_locales must not be empty")]
    NoLocales,
}

impl CleanerConfig {
    /// Whether page caching is enabled at all.
    pub fn is_enabled(&self) -> bool {
        self.sweep_interval_secs > 0
    }

    /// Raw-change cap handed to the tracker:
    /// `max_changed_pages_for_purge × average_entity_types_per_page`.
    pub fn purge_change_cap(&self) -> usize {
        self.max_changed_pages_for_purge
            .saturating_mul(self.average_entity_types_per_page)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cleanup_join_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_join_timeout_ms)
    }

    pub fn slow_sweep_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_sweep_warn_ms)
    }

    /// Fail-fast validation, run at dispatcher/engine construction.
    pub fn validate(&self) -> Result<(), CleanerConfigError> {
        if self.sweep_interval_secs > MAX_SWEEP_INTERVAL_SECS {
            return Err(CleanerConfigError::SweepIntervalTooLarge {
                actual: self.sweep_interval_secs,
                max: MAX_SWEEP_INTERVAL_SECS,
            });
        }
        if self.max_changed_pages_for_purge == 0 {
            return Err(CleanerConfigError::ZeroField("max_changed_pages_for_purge"));
        }
        if self.average_entity_types_per_page == 0 {
            return Err(CleanerConfigError::ZeroField(
                "average_entity_types_per_page",
            ));
        }
        if self.retry_attempts == 0 {
            return Err(CleanerConfigError::ZeroField("retry_attempts"));
        }
        if self.timestamp_batch_size == 0 {
            return Err(CleanerConfigError::ZeroField("timestamp_batch_size"));
        }
        if self.supported_locales.is_empty() {
            return Err(CleanerConfigError::NoLocales);
        }
        Ok(())
    }
}
