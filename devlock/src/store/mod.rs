//! Lease store seams.
//!
//! Two traits split the store: [`BlockingLeaseClient`] is the shape of a
//! typical synchronous store client, and [`LeaseStore`] is the narrow async
//! interface the orchestrator talks to. [`OffloadedLeaseStore`] bridges the
//! two by running blocking calls on a bounded worker pool.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{DeviceName, JobId};
use crate::lease::{AcquireOutcome, LeaseHandle, LockRequest};

/// In-memory blocking client with real TTL expiry.
pub mod memory;
/// Bounded worker-pool offload for blocking clients.
pub mod offload;

pub use memory::InMemoryLeaseClient;
pub use offload::OffloadedLeaseStore;

/// Synchronous lease store client.
///
/// Every call may block the calling thread, so implementors are never called
/// from the cooperative task directly; wrap them in [`OffloadedLeaseStore`].
pub trait BlockingLeaseClient: Send + Sync + 'static {
    /// Point read of a key.
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Point write of a key.
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    /// Try to take the lease, waiting at most `request.wait` for a held lease
    /// to be released or to expire.
    fn acquire(&self, request: &LockRequest) -> anyhow::Result<AcquireOutcome>;

    /// Release a lease. Returns `false` when the lease had already lapsed or
    /// was taken over by another holder.
    fn release(&self, lease: &LeaseHandle) -> anyhow::Result<bool>;
}

impl<C: BlockingLeaseClient> BlockingLeaseClient for Arc<C> {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        (**self).put(key, value)
    }

    fn acquire(&self, request: &LockRequest) -> anyhow::Result<AcquireOutcome> {
        (**self).acquire(request)
    }

    fn release(&self, lease: &LeaseHandle) -> anyhow::Result<bool> {
        (**self).release(lease)
    }
}

/// Async lease store interface used by the lock guard and the ledger.
///
/// Implementations must not block the calling task.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Point read of a key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Point write of a key.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Try to take the lease described by `request`.
    async fn acquire(&self, request: LockRequest) -> Result<AcquireOutcome, StoreError>;

    /// Release a lease previously granted by [`LeaseStore::acquire`].
    async fn release(&self, lease: &LeaseHandle) -> Result<bool, StoreError>;
}

/// Key layout inside the lease store.
///
/// Locks live under `<root>locks/device/<device>` and completion markers
/// under `<root>jobs/<job_id>/status`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        if !root.is_empty() && !root.ends_with('/') {
            root.push('/');
        }
        Self { root }
    }

    pub fn lock_key(&self, device: &DeviceName) -> String {
        format!("{}locks/device/{}", self.root, device)
    }

    pub fn status_key(&self, job_id: &JobId) -> String {
        format!("{}jobs/{}/status", self.root, job_id)
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("/")
    }
}
