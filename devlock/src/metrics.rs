//! Prometheus metrics instrumentation for devlock.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `devlock_jobs_total` - Job iterations by outcome
//! - `devlock_lock_denied_total` - Lock acquisitions that did not succeed, by reason
//! - `devlock_lock_release_failures_total` - Releases left to the lease TTL
//!
//! ## Histograms
//! - `devlock_work_duration_seconds` - Protected work duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, IntCounter, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for devlock metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for finished job iterations.
///
/// Labels:
/// - `outcome`: completed, skipped, deferred, or an error kind
pub static JOBS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("devlock_jobs_total", "Job iterations by outcome");
    CounterVec::new(opts, &["outcome"]).expect("devlock_jobs_total metric creation failed")
});

/// Counter for lock acquisitions that did not succeed.
///
/// Labels:
/// - `reason`: held, timed_out, store_unavailable
pub static LOCK_DENIED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("devlock_lock_denied_total", "Device lock acquisitions denied");
    CounterVec::new(opts, &["reason"]).expect("devlock_lock_denied_total metric creation failed")
});

/// Counter for lease releases that failed.
pub static LOCK_RELEASE_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "devlock_lock_release_failures_total",
        "Device lock releases left to lapse at ttl",
    )
    .expect("devlock_lock_release_failures_total metric creation failed")
});

/// Histogram for protected work duration in seconds.
///
/// Labels:
/// - `status`: success, failure, timeout
pub static WORK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "devlock_work_duration_seconds",
        "Protected work duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"]).expect("devlock_work_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(LOCK_DENIED_TOTAL.clone()),
        Box::new(LOCK_RELEASE_FAILURES_TOTAL.clone()),
        Box::new(WORK_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Helper to record a finished job iteration.
pub fn record_job_outcome(outcome: &str) {
    JOBS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Helper to record a denied lock acquisition.
pub fn record_lock_denied(reason: &str) {
    LOCK_DENIED_TOTAL.with_label_values(&[reason]).inc();
}

/// Helper to record a failed lease release.
pub fn record_lock_release_failed() {
    LOCK_RELEASE_FAILURES_TOTAL.inc();
}

/// Helper to observe work duration.
pub fn observe_work_duration(status: &str, duration_secs: f64) {
    WORK_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_outcome("completed");
        record_lock_denied("held");
        record_lock_release_failed();
        observe_work_duration("success", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("devlock_jobs_total"));
        assert!(output.contains("devlock_lock_denied_total"));
        assert!(output.contains("devlock_work_duration_seconds"));
    }
}
