use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::lease::{AcquireOutcome, LeaseHandle, LeaseId, LockRequest};

use super::BlockingLeaseClient;

#[derive(Debug)]
struct LeaseEntry {
    holder: String,
    lease_id: LeaseId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, Vec<u8>>,
    leases: HashMap<String, LeaseEntry>,
}

impl MemoryState {
    fn live_lease(&mut self, name: &str, now: Instant) -> Option<&LeaseEntry> {
        if self
            .leases
            .get(name)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.leases.remove(name);
        }
        self.leases.get(name)
    }
}

/// Single-process lease store with real TTL semantics.
///
/// Waiting acquirers park on a condition variable and wake on release or
/// when the current lease is due to lapse. Suitable for tests, demos and
/// single-host deployments where every worker shares one process.
#[derive(Default)]
pub struct InMemoryLeaseClient {
    state: Mutex<MemoryState>,
    released: Condvar,
}

impl fmt::Debug for InMemoryLeaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryLeaseClient");
        match self.state.try_lock() {
            Some(state) => {
                debug.field("keys", &state.values.len());
                debug.field("leases", &state.leases.len());
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryLeaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a lock key, if its lease is live.
    pub fn holder_of(&self, name: &str) -> Option<String> {
        let mut state = self.state.lock();
        state
            .live_lease(name, Instant::now())
            .map(|entry| entry.holder.clone())
    }

    /// Raw value stored under a key.
    pub fn value_of(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().values.get(key).cloned()
    }

    /// Number of live leases.
    pub fn live_leases(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .leases
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }
}

impl BlockingLeaseClient for InMemoryLeaseClient {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.state
            .lock()
            .values
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn acquire(&self, request: &LockRequest) -> anyhow::Result<AcquireOutcome> {
        let deadline = Instant::now() + request.wait;
        let mut state = self.state.lock();

        loop {
            let now = Instant::now();
            let wake_at = match state.live_lease(&request.name, now) {
                None => {
                    let handle = LeaseHandle::new(&request.name, &request.holder, request.ttl);
                    state.leases.insert(
                        request.name.clone(),
                        LeaseEntry {
                            holder: request.holder.clone(),
                            lease_id: handle.lease_id,
                            expires_at: now + request.ttl,
                        },
                    );
                    return Ok(AcquireOutcome::Acquired(handle));
                }
                Some(entry) if now >= deadline => {
                    return Ok(AcquireOutcome::Denied {
                        holder: Some(entry.holder.clone()),
                    });
                }
                Some(entry) => entry.expires_at.min(deadline),
            };

            // Woken early by a release; the loop re-checks either way.
            self.released.wait_until(&mut state, wake_at);
        }
    }

    fn release(&self, lease: &LeaseHandle) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let owned = state
            .live_lease(&lease.name, Instant::now())
            .is_some_and(|entry| entry.lease_id == lease.lease_id);
        if owned {
            state.leases.remove(&lease.name);
            self.released.notify_all();
        }
        Ok(owned)
    }
}
