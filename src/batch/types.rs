//! Configuration, lifecycle state and statistics for batch coordination

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Default maximum number of jobs per batch
pub const DEFAULT_MAX_SIZE: usize = 16;

/// Default delay between a batch's first job and its time-based flush
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Default maximum number of concurrent callback invocations
pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

/// Errors raised while validating a [`BatchConfig`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Both the size trigger and the time trigger are disabled
    #[error("one of max_size or flush_interval must be enabled")]
    NoFlushTrigger,

    /// No tokio runtime to host the control loop
    #[error("a coordinator must be created from within a tokio runtime")]
    NoRuntime,
}

/// Batch coordination configuration
///
/// A zero value disables the corresponding flush trigger, or in the case of
/// `max_concurrency`, removes the concurrency limit. At least one of the two
/// flush triggers must stay enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush as soon as a batch holds this many jobs (0 disables)
    pub max_size: usize,
    /// Flush this long after the first job lands in a batch (zero disables)
    pub flush_interval: Duration,
    /// Maximum simultaneous callback invocations (0 means unlimited)
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl BatchConfig {
    /// Set the size trigger
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the time trigger
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the concurrency limit
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Disable the size trigger, relying on the flush interval alone
    pub fn without_size_trigger(self) -> Self {
        self.with_max_size(0)
    }

    /// Disable the time trigger, relying on the batch size alone
    pub fn without_time_trigger(self) -> Self {
        self.with_flush_interval(Duration::ZERO)
    }

    /// Allow any number of callbacks to run at once
    pub fn unlimited_concurrency(self) -> Self {
        self.with_max_concurrency(0)
    }

    #[inline]
    pub(crate) fn size_trigger(&self) -> Option<usize> {
        (self.max_size > 0).then_some(self.max_size)
    }

    #[inline]
    pub(crate) fn time_trigger(&self) -> Option<Duration> {
        (!self.flush_interval.is_zero()).then_some(self.flush_interval)
    }

    /// Check that at least one flush trigger is enabled
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_trigger().is_none() && self.time_trigger().is_none() {
            return Err(ConfigError::NoFlushTrigger);
        }
        Ok(())
    }
}

/// Lifecycle of a coordinator. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CoordinatorState {
    /// New submissions are allowed
    Accepting,
    /// Graceful stop requested; outstanding batches are being drained
    Draining,
    /// Hard-stopped or fully drained; submissions are rejected
    Stopped,
}

/// Point-in-time coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Jobs appended to a batch
    pub jobs_accepted: u64,
    /// Batches handed to a dispatch task
    pub batches_dispatched: u64,
    /// Dispatched batches whose callback errored or panicked
    pub batches_failed: u64,
    /// Batches whose callback is currently running
    pub batches_in_flight: usize,
}

/// Live counters behind [`BatchStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    jobs_accepted: AtomicU64,
    batches_dispatched: AtomicU64,
    batches_failed: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_job(&self) {
        self.jobs_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, batches_in_flight: usize) -> BatchStats {
        BatchStats {
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.max_size, 16);
        assert_eq!(config.flush_interval, Duration::from_millis(50));
        assert_eq!(config.max_concurrency, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_trigger_is_valid() {
        assert!(BatchConfig::default().without_size_trigger().validate().is_ok());
        assert!(BatchConfig::default().without_time_trigger().validate().is_ok());
    }

    #[test]
    fn test_no_trigger_is_rejected() {
        let config = BatchConfig::default()
            .without_size_trigger()
            .without_time_trigger();
        assert_eq!(config.validate(), Err(ConfigError::NoFlushTrigger));
    }

    #[test]
    fn test_builder_configuration() {
        let config = BatchConfig::default()
            .with_max_size(10)
            .with_flush_interval(Duration::from_millis(5))
            .unlimited_concurrency();

        assert_eq!(config.size_trigger(), Some(10));
        assert_eq!(config.time_trigger(), Some(Duration::from_millis(5)));
        assert_eq!(config.max_concurrency, 0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BatchConfig = serde_json::from_str(r#"{"max_concurrency": 4}"#)
            .expect("config should deserialize");

        assert_eq!(config, BatchConfig::default().with_max_concurrency(4));
    }

    #[test]
    fn test_state_ordering() {
        assert!(CoordinatorState::Accepting < CoordinatorState::Draining);
        assert!(CoordinatorState::Draining < CoordinatorState::Stopped);
    }
}
