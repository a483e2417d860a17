use std::sync::Arc;

use tracing::{debug, Instrument};

use crate::error::StoreError;
use crate::job::JobId;
use crate::store::{KeyLayout, LeaseStore};
use crate::telemetry::ledger_span;

/// Literal value stored under a job's status key once its work is done.
pub const COMPLETED_MARKER: &[u8] = b"COMPLETED";

/// Per-job completion markers kept in the lease store.
///
/// A marker is written only after the protected work has succeeded and is
/// never removed by this crate. Its presence is what lets a redelivered job
/// short-circuit without touching the device again.
pub struct CompletionLedger<S> {
    store: Arc<S>,
    keys: KeyLayout,
}

impl<S> std::fmt::Debug for CompletionLedger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionLedger")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl<S: LeaseStore> CompletionLedger<S> {
    pub fn new(store: Arc<S>, keys: KeyLayout) -> Self {
        Self { store, keys }
    }

    /// Whether the job already carries a completion marker.
    ///
    /// Any value other than [`COMPLETED_MARKER`] counts as not completed.
    pub async fn is_completed(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let key = self.keys.status_key(job_id);
        let value = self
            .store
            .get(&key)
            .instrument(ledger_span(job_id.as_str(), "read"))
            .await?;
        let completed = value.as_deref() == Some(COMPLETED_MARKER);
        debug!(job_id = %job_id, key = %key, completed, "ledger read");
        Ok(completed)
    }

    /// Write the completion marker. Writing it twice is harmless.
    pub async fn mark_completed(&self, job_id: &JobId) -> Result<(), StoreError> {
        let key = self.keys.status_key(job_id);
        self.store
            .put(&key, COMPLETED_MARKER.to_vec())
            .instrument(ledger_span(job_id.as_str(), "write"))
            .await?;
        debug!(job_id = %job_id, key = %key, "ledger marked completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockingPoolConfig;
    use crate::store::{BlockingLeaseClient, InMemoryLeaseClient, OffloadedLeaseStore};

    fn ledger() -> (
        Arc<InMemoryLeaseClient>,
        CompletionLedger<OffloadedLeaseStore<InMemoryLeaseClient>>,
    ) {
        let client = Arc::new(InMemoryLeaseClient::new());
        let store = Arc::new(OffloadedLeaseStore::new(
            Arc::clone(&client),
            &BlockingPoolConfig::default(),
        ));
        (client, CompletionLedger::new(store, KeyLayout::default()))
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_completed() {
        let (_, ledger) = ledger();
        assert!(!ledger.is_completed(&"42".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_writes_literal_marker_under_status_key() {
        let (client, ledger) = ledger();
        ledger.mark_completed(&"42".into()).await.unwrap();

        assert_eq!(
            client.value_of("/jobs/42/status").as_deref(),
            Some(COMPLETED_MARKER)
        );
        assert!(ledger.is_completed(&"42".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_is_idempotent() {
        let (_, ledger) = ledger();
        ledger.mark_completed(&"42".into()).await.unwrap();
        ledger.mark_completed(&"42".into()).await.unwrap();
        assert!(ledger.is_completed(&"42".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_status_values_are_not_completed() {
        let (client, ledger) = ledger();
        client.put("/jobs/42/status", b"IN_PROGRESS").unwrap();
        assert!(!ledger.is_completed(&"42".into()).await.unwrap());
    }
}
