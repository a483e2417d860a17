/// Builder for constructing orchestrator instances.
pub mod builder;
/// The per-job state machine and run loop.
pub mod pipeline;
/// Cooperative shutdown signalling.
pub mod shutdown;

pub use builder::JobOrchestratorBuilder;
pub use pipeline::{DeferralReason, DeviceWork, JobOrchestrator, JobOutcome, RunSummary};
pub use shutdown::ShutdownToken;
