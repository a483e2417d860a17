use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::backoff::{BackoffPolicy, FixedBackoff};
use crate::config::OrchestratorConfig;
use crate::store::LeaseStore;
use crate::stream::JobStream;

use super::pipeline::{DeviceWork, JobOrchestrator};

/// Builder for constructing a `JobOrchestrator` with explicit dependencies.
///
/// The store, stream and work function are required. The backoff policy
/// defaults to a [`FixedBackoff`] of `config.deferral_backoff_ms`.
///
/// # Example
///
/// ```ignore
/// use devlock::*;
///
/// let orchestrator = JobOrchestratorBuilder::new(config)
///     .with_store(store)
///     .with_stream(stream)
///     .with_work(work)
///     .build()?;
/// ```
pub struct JobOrchestratorBuilder<S, St, W>
where
    S: LeaseStore + 'static,
    St: JobStream,
    W: DeviceWork + ?Sized,
{
    config: OrchestratorConfig,
    store: Option<Arc<S>>,
    stream: Option<St>,
    work: Option<Arc<W>>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
}

impl<S, St, W> fmt::Debug for JobOrchestratorBuilder<S, St, W>
where
    S: LeaseStore + 'static,
    St: JobStream,
    W: DeviceWork + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("JobOrchestratorBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("stream_set", &self.stream.is_some());
        debug.field("work_set", &self.work.is_some());
        debug.field("backoff", &self.backoff);

        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.stream.is_some() {
            debug.field("stream_type", &type_name::<St>());
        }
        if self.work.is_some() {
            debug.field("work_type", &type_name::<W>());
        }

        debug.finish()
    }
}

impl<S, St, W> JobOrchestratorBuilder<S, St, W>
where
    S: LeaseStore + 'static,
    St: JobStream,
    W: DeviceWork + ?Sized,
{
    /// Create a new builder with the given orchestrator configuration.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            stream: None,
            work: None,
            backoff: None,
        }
    }

    /// Set the lease store holding locks and completion markers.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the job stream.
    pub fn with_stream(mut self, stream: St) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Set the protected work function.
    pub fn with_work(mut self, work: Arc<W>) -> Self {
        self.work = Some(work);
        self
    }

    /// Replace the deferral backoff policy.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Build the `JobOrchestrator` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing or the
    /// configuration cannot work.
    pub fn build(self) -> anyhow::Result<JobOrchestrator<S, St, W>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let stream = self
            .stream
            .ok_or_else(|| anyhow::anyhow!("stream dependency missing"))?;
        let work = self
            .work
            .ok_or_else(|| anyhow::anyhow!("work dependency missing"))?;

        if self.config.worker_id.is_empty() {
            anyhow::bail!("worker_id must not be empty");
        }
        if self.config.lock_ttl_secs == 0 {
            anyhow::bail!("lock_ttl_secs must be positive");
        }
        // The lease is not renewed, so the work has to end while it is live.
        if self.config.work_timeout() >= self.config.lock_ttl() {
            anyhow::bail!(
                "work timeout ({:?}) must be shorter than the lock ttl ({:?})",
                self.config.work_timeout(),
                self.config.lock_ttl()
            );
        }

        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(FixedBackoff::new(self.config.deferral_backoff())));

        Ok(JobOrchestrator::from_parts(
            self.config,
            store,
            stream,
            work,
            backoff,
        ))
    }
}
