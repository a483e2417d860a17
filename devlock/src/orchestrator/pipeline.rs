use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn, Instrument};

use crate::backoff::BackoffPolicy;
use crate::config::{FailurePolicy, OrchestratorConfig};
use crate::error::{LockUnavailable, OrchestratorError};
use crate::job::{DeviceName, Job, JobId, JobMessage, JobPayload, JobStage};
use crate::ledger::CompletionLedger;
use crate::lock::{DeviceLock, LockSettings};
use crate::store::{KeyLayout, LeaseStore};
use crate::stream::{JobConsumer, JobStream};
use crate::telemetry::{
    job_process_span, record_job_outcome, record_work_end, record_work_start, work_span,
};

use super::shutdown::ShutdownToken;

/// The protected unit of work, run while the device lock is held.
///
/// Implementations may be invoked more than once for the same job if a
/// worker dies between the work and the ledger write.
#[async_trait]
pub trait DeviceWork: Send + Sync {
    async fn execute(&self, device: &DeviceName, payload: &JobPayload) -> anyhow::Result<()>;
}

#[async_trait]
impl<W: DeviceWork + ?Sized> DeviceWork for Arc<W> {
    async fn execute(&self, device: &DeviceName, payload: &JobPayload) -> anyhow::Result<()> {
        (**self).execute(device, payload).await
    }
}

/// Why a job was deferred.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferralReason {
    /// Another holder owned the device lease for the whole wait.
    LockHeld { holder: Option<String> },
    /// The store did not answer within the acquisition bound.
    LockTimedOut,
}

/// Result of one orchestrator iteration that did not fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    /// The ledger already held a completion marker; acknowledged without work.
    Skipped { job_id: JobId },
    /// Work ran, the marker was written and the message acknowledged.
    Completed {
        job_id: JobId,
        device: DeviceName,
        /// Whether the lease release was confirmed by the store.
        lock_released: bool,
    },
    /// The device lock was unavailable. Not acknowledged, not marked.
    Deferred {
        job_id: JobId,
        device: DeviceName,
        reason: DeferralReason,
        backoff: Duration,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobOutcome::Skipped { job_id }
            | JobOutcome::Completed { job_id, .. }
            | JobOutcome::Deferred { job_id, .. } => job_id,
        }
    }

    /// Short label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Skipped { .. } => "skipped",
            JobOutcome::Completed { .. } => "completed",
            JobOutcome::Deferred { .. } => "deferred",
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, JobOutcome::Deferred { .. })
    }
}

/// Counts of what a [`JobOrchestrator::run`] call did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunSummary {
    pub completed: u64,
    pub skipped: u64,
    pub deferred: u64,
    /// Work, timeout and ledger write failures that the policy let through.
    pub failed: u64,
    /// Messages that could not be decoded into a job.
    pub malformed: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Skipped { .. } => self.skipped += 1,
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::Deferred { .. } => self.deferred += 1,
        }
    }

    /// Messages received, whatever happened to them.
    pub fn received(&self) -> u64 {
        self.completed + self.skipped + self.deferred + self.failed + self.malformed
    }
}

/// Drives jobs from the stream through dedup, locking, work, marking and
/// acknowledgment, strictly one at a time.
pub struct JobOrchestrator<S, St, W>
where
    S: LeaseStore + 'static,
    St: JobStream,
    W: DeviceWork + ?Sized,
{
    config: OrchestratorConfig,
    store: Arc<S>,
    ledger: CompletionLedger<S>,
    consumer: JobConsumer<St>,
    work: Arc<W>,
    backoff: Arc<dyn BackoffPolicy>,
    keys: KeyLayout,
    consecutive_deferrals: u32,
}

impl<S, St, W> fmt::Debug for JobOrchestrator<S, St, W>
where
    S: LeaseStore + 'static,
    St: JobStream,
    W: DeviceWork + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .field("store_type", &type_name::<S>())
            .field("stream_type", &type_name::<St>())
            .field("work_type", &type_name::<W>())
            .field("backoff", &self.backoff)
            .field("keys", &self.keys)
            .field("pending", &self.consumer.pending())
            .field("consecutive_deferrals", &self.consecutive_deferrals)
            .finish()
    }
}

impl<S, St, W> JobOrchestrator<S, St, W>
where
    S: LeaseStore + 'static,
    St: JobStream,
    W: DeviceWork + ?Sized,
{
    pub(crate) fn from_parts(
        config: OrchestratorConfig,
        store: Arc<S>,
        stream: St,
        work: Arc<W>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        let keys = KeyLayout::new(&config.key_root);
        Self {
            ledger: CompletionLedger::new(Arc::clone(&store), keys.clone()),
            consumer: JobConsumer::new(stream),
            config,
            store,
            work,
            backoff,
            keys,
            consecutive_deferrals: 0,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn consumer(&self) -> &JobConsumer<St> {
        &self.consumer
    }

    pub fn ledger(&self) -> &CompletionLedger<S> {
        &self.ledger
    }

    /// Deferrals in a row since the last non-deferred iteration.
    pub fn consecutive_deferrals(&self) -> u32 {
        self.consecutive_deferrals
    }

    /// Read one message and carry it through the pipeline.
    ///
    /// A message the previous call left unacknowledged (deferred or failed)
    /// is read again before anything behind it. Returns `Ok(None)` when the
    /// stream has ended.
    pub async fn process_next(&mut self) -> Result<Option<JobOutcome>, OrchestratorError> {
        let Some(message) = self.receive().await? else {
            return Ok(None);
        };
        self.process(message).await.map(Some)
    }

    /// Process jobs until the stream ends, shutdown is requested or a fatal
    /// error occurs.
    ///
    /// Deferred jobs pause the loop for the backoff delay and are then
    /// retried. Message-level failures are handled per [`FailurePolicy`];
    /// under `Continue` the failed message is retried after the configured
    /// deferral backoff. Malformed messages are skipped over without
    /// acknowledgment.
    pub async fn run(&mut self, shutdown: &ShutdownToken) -> Result<RunSummary, OrchestratorError> {
        let mut summary = RunSummary::default();
        info!(worker_id = %self.config.worker_id, "job orchestrator started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.receive() => received,
            };

            let result = match received {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) => {
                    info!("job stream ended");
                    break;
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(outcome) => {
                    summary.record(&outcome);
                    if let JobOutcome::Deferred { backoff, .. } = outcome {
                        if !pause(shutdown, backoff).await {
                            break;
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, ?summary, "job orchestrator stopping on fatal error");
                    return Err(err);
                }
                Err(err @ OrchestratorError::Decode { .. }) => {
                    summary.malformed += 1;
                    warn!(error = %err, "skipping malformed message");
                }
                Err(err) => {
                    summary.failed += 1;
                    let policy = match err {
                        OrchestratorError::LedgerUnavailable { .. } => {
                            self.config.on_ledger_write_failure
                        }
                        _ => self.config.on_work_failure,
                    };
                    match policy {
                        FailurePolicy::Halt => {
                            error!(error = %err, ?summary, "job orchestrator halting on job failure");
                            return Err(err);
                        }
                        FailurePolicy::Continue => {
                            let retry_in = self.config.deferral_backoff();
                            warn!(
                                error = %err,
                                retry_in_ms = retry_in.as_millis() as u64,
                                "job failed; message will be retried"
                            );
                            if !pause(shutdown, retry_in).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(?summary, "job orchestrator stopped");
        Ok(summary)
    }

    async fn receive(&mut self) -> Result<Option<JobMessage>, OrchestratorError> {
        match self.consumer.next().await {
            Ok(message) => Ok(message),
            Err(err) => {
                self.consecutive_deferrals = 0;
                let label = match &err {
                    OrchestratorError::Decode { position, .. } => position.to_string(),
                    _ => "-".to_string(),
                };
                record_job_outcome(label, err.kind());
                Err(err)
            }
        }
    }

    async fn process(&mut self, message: JobMessage) -> Result<JobOutcome, OrchestratorError> {
        let span = job_process_span(message.job.job_id.as_str(), message.job.device.as_str());
        let job_id = message.job.job_id.clone();
        let result = self.process_message(message).instrument(span).await;

        match &result {
            Ok(outcome) => {
                if !outcome.is_deferred() {
                    self.consecutive_deferrals = 0;
                }
                record_job_outcome(job_id.as_str(), outcome.label());
            }
            Err(err) => {
                self.consecutive_deferrals = 0;
                record_job_outcome(job_id.as_str(), err.kind());
            }
        }
        result
    }

    async fn process_message(&mut self, message: JobMessage) -> Result<JobOutcome, OrchestratorError> {
        let job = &message.job;
        debug!(stage = %JobStage::Received, position = %message.position, "job received");

        debug!(stage = %JobStage::DedupCheck, "checking completion ledger");
        match self.ledger.is_completed(&job.job_id).await {
            Ok(true) => {
                self.consumer.acknowledge(&message).await?;
                info!(stage = %JobStage::Skip, "job already completed; acknowledged without work");
                return Ok(JobOutcome::Skipped {
                    job_id: job.job_id.clone(),
                });
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "completion ledger read failed; treating job as not completed");
            }
        }

        debug!(stage = %JobStage::LockWait, "waiting for device lock");
        let mut lock = DeviceLock::new(
            Arc::clone(&self.store),
            &self.keys,
            job.device.clone(),
            self.lock_settings(),
        );
        let guard = match lock.acquire().await {
            Ok(guard) => guard,
            Err(LockUnavailable::StoreUnavailable { source, .. }) => {
                return Err(OrchestratorError::LeaseStoreUnreachable(source));
            }
            Err(denied) => return Ok(self.defer(job, denied)),
        };
        debug!(stage = %JobStage::Locked, "device lock held");

        let finished = match self.run_work(job).await {
            Ok(()) => self.finish(&message).await,
            Err(err) => Err(err),
        };

        // Release on every exit from the critical section; failure leaves the lease to its TTL.
        let lock_released = guard.release().await.unwrap_or(false);

        finished.map(|()| {
            info!(lock_released, "job completed");
            JobOutcome::Completed {
                job_id: job.job_id.clone(),
                device: job.device.clone(),
                lock_released,
            }
        })
    }

    async fn run_work(&mut self, job: &Job) -> Result<(), OrchestratorError> {
        debug!(stage = %JobStage::Working, "invoking device work");
        let timing = record_work_start(job.job_id.as_str());
        let call = self
            .work
            .execute(&job.device, &job.payload)
            .instrument(work_span(job.device.as_str()));

        // Bounded below the lease TTL, so the work never outlives the lease.
        let limit = self.config.work_timeout();
        let result = match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(|source| work_failure(job, source)),
            Err(_) => Err(OrchestratorError::WorkTimedOut {
                job_id: job.job_id.clone(),
                device: job.device.clone(),
                timeout: limit,
            }),
        };

        let status = match &result {
            Ok(()) => "success",
            Err(OrchestratorError::WorkTimedOut { .. }) => "timeout",
            Err(_) => "failure",
        };
        record_work_end(timing, job.device.as_str(), status);
        if let Err(err) = &result {
            warn!(error = %err, "device work failed; job will not be marked or acknowledged");
        }
        result
    }

    /// Marker first, acknowledgment second. A crash in between leads to a
    /// redelivery that the ledger short-circuits.
    async fn finish(&mut self, message: &JobMessage) -> Result<(), OrchestratorError> {
        let job = &message.job;
        debug!(stage = %JobStage::MarkComplete, "writing completion marker");
        self.ledger
            .mark_completed(&job.job_id)
            .await
            .map_err(|source| {
                warn!(error = %source, "completion marker write failed; message left unacknowledged");
                OrchestratorError::LedgerUnavailable {
                    job_id: job.job_id.clone(),
                    source,
                }
            })?;

        debug!(stage = %JobStage::Ack, "acknowledging message");
        self.consumer.acknowledge(message).await?;
        Ok(())
    }

    fn defer(&mut self, job: &Job, denied: LockUnavailable) -> JobOutcome {
        self.consecutive_deferrals = self.consecutive_deferrals.saturating_add(1);
        let backoff = self.backoff.deferral_delay(self.consecutive_deferrals);
        let reason = match denied {
            LockUnavailable::Held { holder, .. } => DeferralReason::LockHeld { holder },
            _ => DeferralReason::LockTimedOut,
        };

        debug!(stage = %JobStage::LockDenied, ?reason, "device lock unavailable");
        info!(
            stage = %JobStage::Deferred,
            backoff_ms = backoff.as_millis() as u64,
            consecutive = self.consecutive_deferrals,
            "job deferred; message left unacknowledged for redelivery"
        );
        JobOutcome::Deferred {
            job_id: job.job_id.clone(),
            device: job.device.clone(),
            reason,
            backoff,
        }
    }

    fn lock_settings(&self) -> LockSettings {
        LockSettings {
            holder: self.config.worker_id.clone(),
            ttl: self.config.lock_ttl(),
            acquire_timeout: self.config.lock_acquire_timeout(),
        }
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns `false` on shutdown.
async fn pause(shutdown: &ShutdownToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn work_failure(job: &Job, source: anyhow::Error) -> OrchestratorError {
    OrchestratorError::WorkFailure {
        job_id: job.job_id.clone(),
        device: job.device.clone(),
        source,
    }
}
