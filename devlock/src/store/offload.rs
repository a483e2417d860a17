use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::BlockingPoolConfig;
use crate::error::StoreError;
use crate::lease::{AcquireOutcome, LeaseHandle, LockRequest};

use super::{BlockingLeaseClient, LeaseStore};

/// Adapts a [`BlockingLeaseClient`] to the async [`LeaseStore`] interface.
///
/// Each call runs on tokio's blocking thread pool. A semaphore bounds how
/// many calls are in flight so a slow store cannot exhaust blocking threads.
/// The permit travels into the blocking closure and is held until the call
/// returns, even if the awaiting future is dropped.
pub struct OffloadedLeaseStore<C> {
    client: Arc<C>,
    permits: Arc<Semaphore>,
    max_blocking_calls: usize,
}

impl<C> fmt::Debug for OffloadedLeaseStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadedLeaseStore")
            .field("client_type", &std::any::type_name::<C>())
            .field("max_blocking_calls", &self.max_blocking_calls)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl<C: BlockingLeaseClient> OffloadedLeaseStore<C> {
    pub fn new(client: Arc<C>, config: &BlockingPoolConfig) -> Self {
        let max_blocking_calls = config.max_blocking_calls.max(1);
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_blocking_calls)),
            max_blocking_calls,
        }
    }

    /// Shared handle to the wrapped client.
    pub fn client(&self) -> Arc<C> {
        Arc::clone(&self.client)
    }

    async fn offload<T, F>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> anyhow::Result<T> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        let client = Arc::clone(&self.client);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call(&client)
        })
        .await
        .map_err(|e| StoreError::Pool(format!("{operation} task failed: {e}")))?
        .map_err(|e| StoreError::unreachable(operation, format!("{e:#}")))
    }
}

#[async_trait]
impl<C: BlockingLeaseClient> LeaseStore for OffloadedLeaseStore<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.offload("get", move |client| client.get(&key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let key = key.to_string();
        self.offload("put", move |client| client.put(&key, &value))
            .await
    }

    async fn acquire(&self, request: LockRequest) -> Result<AcquireOutcome, StoreError> {
        self.offload("acquire", move |client| client.acquire(&request))
            .await
    }

    async fn release(&self, lease: &LeaseHandle) -> Result<bool, StoreError> {
        let lease = lease.clone();
        self.offload("release", move |client| client.release(&lease))
            .await
    }
}
