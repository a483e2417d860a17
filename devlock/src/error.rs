//! Error taxonomy for the job pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::job::{DeviceName, JobId, StreamPosition};

/// Failures talking to the lease store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected or could not serve the call.
    #[error("lease store unreachable during {operation}: {message}")]
    Unreachable {
        /// The store operation that failed (`get`, `put`, `acquire`, `release`).
        operation: &'static str,
        /// Backend error rendered with its full cause chain.
        message: String,
    },

    /// The blocking worker pool could not run the call.
    #[error("blocking worker pool failed: {0}")]
    Pool(String),
}

impl StoreError {
    pub fn unreachable(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Unreachable {
            operation,
            message: err.to_string(),
        }
    }
}

/// Why a device lock could not be taken.
#[derive(Debug, Error)]
pub enum LockUnavailable {
    /// Another holder owns a live lease on the device.
    #[error("lock for {device} is held by {}", .holder.as_deref().unwrap_or("another worker"))]
    Held {
        device: DeviceName,
        holder: Option<String>,
    },

    /// The store did not answer within the acquisition bound.
    #[error("timed out after {waited:?} acquiring lock for {device}")]
    TimedOut { device: DeviceName, waited: Duration },

    /// The store failed while acquiring.
    #[error("lease store failed while locking {device}: {source}")]
    StoreUnavailable {
        device: DeviceName,
        #[source]
        source: StoreError,
    },
}

impl LockUnavailable {
    /// Short label used for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            LockUnavailable::Held { .. } => "held",
            LockUnavailable::TimedOut { .. } => "timed_out",
            LockUnavailable::StoreUnavailable { .. } => "store_unavailable",
        }
    }
}

/// Errors surfaced from one orchestrator iteration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The completion marker could not be written after the work succeeded.
    /// The message stays unacknowledged and will be retried on redelivery.
    #[error("completion ledger unavailable for job {job_id}: {source}")]
    LedgerUnavailable {
        job_id: JobId,
        #[source]
        source: StoreError,
    },

    /// The protected work function returned an error.
    #[error("work for job {job_id} on {device} failed: {source}")]
    WorkFailure {
        job_id: JobId,
        device: DeviceName,
        #[source]
        source: anyhow::Error,
    },

    /// The protected work function exceeded the configured bound.
    #[error("work for job {job_id} on {device} timed out after {timeout:?}")]
    WorkTimedOut {
        job_id: JobId,
        device: DeviceName,
        timeout: Duration,
    },

    /// A message could not be decoded into a job.
    #[error("message at {position} is not a valid job: {source}")]
    Decode {
        position: StreamPosition,
        #[source]
        source: serde_json::Error,
    },

    /// Reading from or acknowledging on the stream failed.
    #[error("job stream unavailable: {0}")]
    StreamUnavailable(#[source] anyhow::Error),

    /// The lease store could not be reached to take a lock.
    #[error("lease store unreachable: {0}")]
    LeaseStoreUnreachable(#[source] StoreError),
}

impl OrchestratorError {
    /// Fatal errors end the run; the process supervisor decides on restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::StreamUnavailable(_) | OrchestratorError::LeaseStoreUnreachable(_)
        )
    }

    /// Errors the same message can succeed on when it is delivered again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::LedgerUnavailable { .. }
                | OrchestratorError::WorkFailure { .. }
                | OrchestratorError::WorkTimedOut { .. }
        )
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::LedgerUnavailable { .. } => "ledger_unavailable",
            OrchestratorError::WorkFailure { .. } => "work_failure",
            OrchestratorError::WorkTimedOut { .. } => "work_timed_out",
            OrchestratorError::Decode { .. } => "decode",
            OrchestratorError::StreamUnavailable(_) => "stream_unavailable",
            OrchestratorError::LeaseStoreUnreachable(_) => "lease_store_unreachable",
        }
    }
}
