//! Scoped device locks backed by store leases.
//!
//! A [`DeviceLock`] walks `Unlocked -> Acquiring -> Locked -> Releasing ->
//! Unlocked`, or `Acquiring -> AcquireFailed` when the lease cannot be taken.
//! The [`DeviceLockGuard`] it hands out is the only way into the critical
//! section. Release is explicit and async; if a guard is dropped while still
//! locked (a cancelled or panicking task) the release is scheduled on the
//! runtime instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn, Instrument};

use crate::error::{LockUnavailable, StoreError};
use crate::job::DeviceName;
use crate::lease::{AcquireOutcome, LeaseHandle, LockRequest};
use crate::store::{KeyLayout, LeaseStore};
use crate::telemetry::{lock_span, record_lock_denied, record_lock_release_failed};

/// Slack on top of the acquisition bound before the store call itself is
/// abandoned. The store is expected to honour `LockRequest::wait` on its own.
const STORE_CALL_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of one critical section.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Locked,
    Releasing,
    AcquireFailed,
}

/// Lease parameters for device locks.
#[derive(Clone, Debug)]
pub struct LockSettings {
    /// Identity recorded as the lease holder.
    pub holder: String,
    /// Lease TTL; bounds how long a crashed holder blocks the device.
    pub ttl: Duration,
    /// How long to wait for a held lease before giving up.
    pub acquire_timeout: Duration,
}

/// Exclusive access to one device for one critical section.
pub struct DeviceLock<S: LeaseStore + 'static> {
    store: Arc<S>,
    device: DeviceName,
    name: String,
    settings: LockSettings,
    state: LockState,
    lease: Option<LeaseHandle>,
}

impl<S: LeaseStore + 'static> fmt::Debug for DeviceLock<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLock")
            .field("device", &self.device)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("lease", &self.lease)
            .finish()
    }
}

impl<S: LeaseStore + 'static> DeviceLock<S> {
    pub fn new(store: Arc<S>, keys: &KeyLayout, device: DeviceName, settings: LockSettings) -> Self {
        let name = keys.lock_key(&device);
        Self {
            store,
            device,
            name,
            settings,
            state: LockState::Unlocked,
            lease: None,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn device(&self) -> &DeviceName {
        &self.device
    }

    /// Lock key in the store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lease. Never returns a guard without a live lease.
    ///
    /// If the store call overruns its bound the attempt is abandoned; a lease
    /// the store grants afterwards is orphaned and lapses at its TTL.
    pub async fn acquire(&mut self) -> Result<DeviceLockGuard<'_, S>, LockUnavailable> {
        debug_assert!(
            matches!(self.state, LockState::Unlocked | LockState::AcquireFailed),
            "acquire called in state {:?}",
            self.state
        );
        self.state = LockState::Acquiring;

        let request = LockRequest {
            name: self.name.clone(),
            holder: self.settings.holder.clone(),
            ttl: self.settings.ttl,
            wait: self.settings.acquire_timeout,
        };
        let bound = self.settings.acquire_timeout + STORE_CALL_GRACE;
        let attempt = tokio::time::timeout(bound, self.store.acquire(request))
            .instrument(lock_span(self.device.as_str(), &self.settings.holder))
            .await;

        let denied = match attempt {
            Ok(Ok(AcquireOutcome::Acquired(lease))) => {
                info!(
                    device = %self.device,
                    lease_id = %lease.lease_id,
                    expires_at = %lease.expires_at,
                    "device lock acquired"
                );
                self.lease = Some(lease);
                self.state = LockState::Locked;
                return Ok(DeviceLockGuard { lock: self });
            }
            Ok(Ok(AcquireOutcome::Denied { holder })) => LockUnavailable::Held {
                device: self.device.clone(),
                holder,
            },
            Ok(Err(source)) => LockUnavailable::StoreUnavailable {
                device: self.device.clone(),
                source,
            },
            Err(_) => LockUnavailable::TimedOut {
                device: self.device.clone(),
                waited: bound,
            },
        };

        self.state = LockState::AcquireFailed;
        record_lock_denied(self.device.as_str(), denied.reason());
        Err(denied)
    }
}

/// Proof of a live lease on a device.
///
/// Consume it with [`DeviceLockGuard::release`]. Dropping it while locked
/// schedules the release on the current runtime.
#[must_use = "dropping the guard releases the lock in the background"]
pub struct DeviceLockGuard<'a, S: LeaseStore + 'static> {
    lock: &'a mut DeviceLock<S>,
}

impl<S: LeaseStore + 'static> fmt::Debug for DeviceLockGuard<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLockGuard")
            .field("lock", &self.lock)
            .finish()
    }
}

impl<S: LeaseStore + 'static> DeviceLockGuard<'_, S> {
    /// The lease backing this guard.
    pub fn lease(&self) -> Option<&LeaseHandle> {
        self.lock.lease.as_ref()
    }

    pub fn device(&self) -> &DeviceName {
        &self.lock.device
    }

    /// Release the lease.
    ///
    /// Returns `Ok(false)` when the store no longer knew the lease (it lapsed
    /// or was taken over). A failed release leaves the lease to its TTL; the
    /// caller decides whether to report it.
    pub async fn release(mut self) -> Result<bool, StoreError> {
        let Some(lease) = self.lock.lease.take() else {
            return Ok(false);
        };
        self.lock.state = LockState::Releasing;
        let result = self.lock.store.release(&lease).await;
        self.lock.state = LockState::Unlocked;

        match &result {
            Ok(true) => info!(device = %self.lock.device, "device lock released"),
            Ok(false) => warn!(
                device = %self.lock.device,
                lease_id = %lease.lease_id,
                "device lease was already gone at release"
            ),
            Err(err) => record_lock_release_failed(self.lock.device.as_str(), err),
        }
        result
    }
}

impl<S: LeaseStore + 'static> Drop for DeviceLockGuard<'_, S> {
    fn drop(&mut self) {
        let Some(lease) = self.lock.lease.take() else {
            return;
        };
        self.lock.state = LockState::Releasing;
        let device = self.lock.device.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(device = %device, "guard dropped while locked; releasing in background");
                let store = Arc::clone(&self.lock.store);
                handle.spawn(async move {
                    match store.release(&lease).await {
                        Ok(_) => info!(device = %device, "device lock released after cancellation"),
                        Err(err) => record_lock_release_failed(device.as_str(), err),
                    }
                });
            }
            Err(_) => record_lock_release_failed(device.as_str(), "no async runtime available"),
        }

        self.lock.state = LockState::Unlocked;
    }
}
