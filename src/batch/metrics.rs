//! Metrics collection for batch coordination
//!
//! Provides Prometheus-compatible metrics for monitoring batch sizes,
//! callback latency, outcomes and dispatch concurrency.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Counter for jobs accepted into a batch
    static ref JOBS_SUBMITTED: IntCounter = register_int_counter!(
        "microbatch_jobs_submitted_total",
        "Total number of jobs accepted into a batch"
    ).unwrap();

    /// Counter for dispatched batches by outcome
    static ref BATCHES: IntCounterVec = register_int_counter_vec!(
        "microbatch_batches_total",
        "Total number of dispatched batches",
        &["outcome"]
    ).unwrap();

    /// Histogram for jobs per batch
    static ref BATCH_SIZE: Histogram = register_histogram!(
        "microbatch_batch_size",
        "Number of jobs per dispatched batch",
        vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]
    ).unwrap();

    /// Histogram for callback duration
    static ref BATCH_DURATION: HistogramVec = register_histogram_vec!(
        "microbatch_batch_duration_seconds",
        "Batch callback duration in seconds",
        &["outcome"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    /// Gauge for callbacks currently running
    static ref DISPATCHES_IN_FLIGHT: IntGauge = register_int_gauge!(
        "microbatch_dispatches_in_flight",
        "Number of batch callbacks currently running"
    ).unwrap();
}

/// Outcome label values
pub(crate) const OUTCOME_OK: &str = "ok";
pub(crate) const OUTCOME_ERROR: &str = "error";
pub(crate) const OUTCOME_PANIC: &str = "panic";
pub(crate) const OUTCOME_DROPPED: &str = "dropped";

pub(crate) fn record_job_submitted() {
    JOBS_SUBMITTED.inc();
}

/// Tracks one dispatch from callback start to completion
pub(crate) struct DispatchTimer {
    start: Instant,
}

impl DispatchTimer {
    pub(crate) fn start(batch_size: usize) -> Self {
        BATCH_SIZE.observe(batch_size as f64);
        DISPATCHES_IN_FLIGHT.inc();
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn finish(self, outcome: &str) {
        DISPATCHES_IN_FLIGHT.dec();
        BATCHES.with_label_values(&[outcome]).inc();
        BATCH_DURATION
            .with_label_values(&[outcome])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer)
        .map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_metrics_exported() {
        record_job_submitted();
        let timer = DispatchTimer::start(3);
        timer.finish(OUTCOME_OK);

        let metrics = export_metrics().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to export metrics: {}", e);
            String::new()
        });
        assert!(metrics.contains("microbatch_jobs_submitted_total"));
        assert!(metrics.contains("microbatch_batches_total"));
        assert!(metrics.contains("outcome=\"ok\""));
    }
}
