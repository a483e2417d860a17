//! devlock - Lease-serialized device job pipeline.
//!
//! Consumes configuration-change jobs from a durable stream, skips jobs the
//! completion ledger already knows about, serializes work per target device
//! through a TTL-bound lease, runs the externally supplied work, and only then
//! commits stream progress.
//!
//! # Core Concepts
//!
//! - **Job**: A [`Job`] carries a `job_id`, the target `device` and an opaque
//!   payload. It arrives as a [`JobMessage`] tagged with its [`StreamPosition`].
//!
//! - **Lease store**: The [`LeaseStore`](store::LeaseStore) trait is the narrow
//!   async seam for `get`, `put`, `acquire` and `release`. Blocking clients
//!   implement [`BlockingLeaseClient`](store::BlockingLeaseClient) and are
//!   offloaded to a bounded worker pool by
//!   [`OffloadedLeaseStore`](store::OffloadedLeaseStore).
//!
//! - **Device lock**: [`DeviceLock`](lock::DeviceLock) hands out a guard only
//!   while a live lease is held, and releases on every exit path.
//!
//! - **Completion ledger**: [`CompletionLedger`](ledger::CompletionLedger)
//!   reads and writes the per-job `COMPLETED` marker used for deduplication.
//!
//! - **Orchestrator**: [`JobOrchestrator`](orchestrator::JobOrchestrator)
//!   processes one message at a time: dedup check, lock, work, mark, ack.
//!   Lock contention yields an explicit `Deferred` outcome with a backoff
//!   chosen by a [`BackoffPolicy`](backoff::BackoffPolicy).
//!
//! # Consistency boundary
//!
//! The completion marker is written before the stream acknowledgment. A
//! crash between the two redelivers a job that the ledger then short-circuits.
//! A crash between successful work and the marker write re-runs the work, so
//! device work must tolerate being applied twice.
//!
//! The cursor never passes a message that is not finished: a deferred or
//! failed message is read again before anything behind it, so one busy
//! device stalls the whole stream.
//!
//! Leases are not renewed. The work call is bounded by a timeout shorter
//! than the lease TTL, so the work is never still running after its lease
//! has lapsed.
//!
//! # Feature Flags
//!
//! - `kafka` - Kafka job stream via rdkafka
//! - `postgres` - PostgreSQL lease store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use devlock::*;
//!
//! let store = Arc::new(OffloadedLeaseStore::new(client, &BlockingPoolConfig::default()));
//! let stream = KafkaJobStream::connect(&KafkaConfig::default())?;
//! let mut orchestrator = JobOrchestratorBuilder::new(OrchestratorConfig::new("edge-1"))
//!     .with_store(store)
//!     .with_stream(stream)
//!     .with_work(Arc::new(MyDeviceWork))
//!     .build()?;
//!
//! let summary = orchestrator.run(&ShutdownToken::new()).await?;
//! ```

/// Deferral backoff policies.
pub mod backoff;

/// Configuration structures for the orchestrator and its backends.
///
/// The `config` module defines [`OrchestratorConfig`], [`BlockingPoolConfig`],
/// [`KafkaConfig`] and [`PersistenceConfig`].
pub mod config;

/// Error taxonomy: [`StoreError`], [`LockUnavailable`] and
/// [`OrchestratorError`].
pub mod error;

/// Job, identifier and stream position types.
pub mod job;

/// Lease identifiers, requests and handles.
pub mod lease;

/// Per-job completion markers.
pub mod ledger;

/// Scoped device locks.
pub mod lock;

/// Prometheus metrics, enabled by the `metrics` feature.
#[cfg(feature = "metrics")]
pub mod metrics;

/// The job orchestrator, its builder and shutdown signalling.
pub mod orchestrator;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed lease store when
/// the `postgres` feature is enabled.
pub mod persistence;

/// Lease store traits and the in-memory and offloading implementations.
pub mod store;

/// Job stream traits and adapters.
pub mod stream;

/// Tracing spans and outcome recorders.
pub mod telemetry;

pub use backoff::{BackoffConfig, BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use config::*;
pub use error::{LockUnavailable, OrchestratorError, StoreError};
pub use job::*;
pub use lease::*;
pub use ledger::{CompletionLedger, COMPLETED_MARKER};
pub use lock::{DeviceLock, DeviceLockGuard, LockSettings, LockState};
pub use orchestrator::{
    DeferralReason, DeviceWork, JobOrchestrator, JobOrchestratorBuilder, JobOutcome, RunSummary,
    ShutdownToken,
};
#[cfg(feature = "postgres")]
pub use persistence::PostgresLeaseStore;
pub use store::{BlockingLeaseClient, InMemoryLeaseClient, KeyLayout, LeaseStore, OffloadedLeaseStore};
#[cfg(feature = "kafka")]
pub use stream::KafkaJobStream;
pub use stream::{JobConsumer, JobStream, StreamRecord};
