//! Tracing and telemetry instrumentation for devlock.
//!
//! This module provides helper functions for creating tracing spans and recording
//! metrics at each step of job processing. All functions work both with and without
//! the `metrics` feature flag.
//!
//! # Features
//!
//! - Tracing spans for a job iteration, lock acquisition, ledger access and work
//! - Integration with the `metrics` module for Prometheus metrics
//! - Helper functions that only log when the feature is disabled
//!
//! Installing a subscriber is left to the host process.

use tracing::{info_span, Span};

/// Create a tracing span covering one job from receipt to acknowledgment.
///
/// # Arguments
/// * `job_id` - The job identifier
/// * `device` - The target device
#[must_use]
pub fn job_process_span(job_id: impl AsRef<str>, device: impl AsRef<str>) -> Span {
    info_span!(
        "devlock.job",
        job_id = %job_id.as_ref(),
        device = %device.as_ref(),
    )
}

/// Create a tracing span for a device lock acquisition.
///
/// # Arguments
/// * `device` - The device being locked
/// * `holder` - The lease holder identity
#[must_use]
pub fn lock_span(device: impl AsRef<str>, holder: impl AsRef<str>) -> Span {
    info_span!(
        "devlock.lock",
        device = %device.as_ref(),
        holder = %holder.as_ref(),
    )
}

/// Create a tracing span for a completion ledger access.
///
/// # Arguments
/// * `job_id` - The job identifier
/// * `operation` - `read` or `write`
#[must_use]
pub fn ledger_span(job_id: impl AsRef<str>, operation: impl AsRef<str>) -> Span {
    info_span!(
        "devlock.ledger",
        job_id = %job_id.as_ref(),
        operation = %operation.as_ref(),
    )
}

/// Create a tracing span around the protected work call.
#[must_use]
pub fn work_span(device: impl AsRef<str>) -> Span {
    info_span!("devlock.work", device = %device.as_ref())
}

/// Record the final outcome of a job iteration.
///
/// # Arguments
/// * `outcome` - One of `completed`, `skipped`, `deferred`, or an error kind
pub fn record_job_outcome(job_id: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        outcome = %outcome.as_ref(),
        "job iteration finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_outcome(outcome.as_ref());
}

/// Record a denied lock acquisition.
pub fn record_lock_denied(device: impl AsRef<str>, reason: impl AsRef<str>) {
    tracing::warn!(
        device = %device.as_ref(),
        reason = %reason.as_ref(),
        "device lock unavailable"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lock_denied(reason.as_ref());
}

/// Record a lease release that did not go through.
///
/// The lease stays until its TTL lapses.
pub fn record_lock_release_failed(device: impl AsRef<str>, error: impl std::fmt::Display) {
    tracing::warn!(
        device = %device.as_ref(),
        error = %error,
        "device lock release failed; lease will lapse at ttl"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lock_release_failed();
}

/// Record the start of the protected work call for duration tracking.
pub fn record_work_start(job_id: impl AsRef<str>) -> WorkTimingHandle {
    WorkTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of the protected work call.
///
/// # Arguments
/// * `handle` - The timing handle from `record_work_start`
/// * `device` - The target device
/// * `status` - `success`, `failure` or `timeout`
pub fn record_work_end(handle: WorkTimingHandle, device: impl AsRef<str>, status: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();

    tracing::info!(
        job_id = %handle.job_id,
        device = %device.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "work finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_work_duration(status.as_ref(), duration_secs);
}

/// Handle for tracking work duration.
///
/// This is an opaque type returned by `record_work_start` and consumed by `record_work_end`.
#[derive(Debug)]
pub struct WorkTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl WorkTimingHandle {
    /// Get the job ID associated with this timing handle.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the elapsed time since the work started.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
