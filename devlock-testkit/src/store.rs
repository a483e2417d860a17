use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use devlock::*;
use parking_lot::Mutex;

/// One recorded call, in the order it happened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JournalEntry {
    Get { key: String },
    Put { key: String, value: Vec<u8> },
    Acquire { name: String, holder: String, granted: bool },
    Release { name: String, released: bool },
    Work { device: String },
    Ack { position: StreamPosition },
    Rewind { position: StreamPosition },
}

/// Shared, ordered log of calls made by the fakes.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Index of the first entry matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&JournalEntry) -> bool) -> Option<usize> {
        self.entries.lock().iter().position(predicate)
    }

    pub fn count(&self, predicate: impl Fn(&JournalEntry) -> bool) -> usize {
        self.entries.lock().iter().filter(|entry| predicate(entry)).count()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_get: AtomicBool,
    fail_put: AtomicBool,
    fail_acquire: AtomicBool,
    fail_release: AtomicBool,
}

/// [`InMemoryLeaseClient`] wrapper that journals calls and injects faults.
#[derive(Clone, Debug)]
pub struct JournaledLeaseClient {
    inner: Arc<InMemoryLeaseClient>,
    journal: Journal,
    faults: Arc<Faults>,
    keys: KeyLayout,
}

impl JournaledLeaseClient {
    pub fn new(journal: Journal) -> Self {
        Self {
            inner: Arc::new(InMemoryLeaseClient::new()),
            journal,
            faults: Arc::new(Faults::default()),
            keys: KeyLayout::default(),
        }
    }

    /// Share the underlying store with another client, as two workers
    /// talking to one cluster would.
    pub fn sharing(&self, journal: Journal) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            journal,
            faults: Arc::new(Faults::default()),
            keys: self.keys.clone(),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryLeaseClient> {
        &self.inner
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Async store over this client for handing to an orchestrator.
    pub fn offloaded(&self) -> Arc<OffloadedLeaseStore<JournaledLeaseClient>> {
        Arc::new(OffloadedLeaseStore::new(
            Arc::new(self.clone()),
            &BlockingPoolConfig::default(),
        ))
    }

    pub fn fail_get(&self, fail: bool) {
        self.faults.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn fail_put(&self, fail: bool) {
        self.faults.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.faults.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.faults.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Write a completion marker directly, bypassing the journal.
    pub fn seed_completed(&self, job_id: &str) {
        let key = self.keys.status_key(&JobId::new(job_id));
        // The in-memory client cannot fail.
        let _ = self.inner.put(&key, COMPLETED_MARKER);
    }

    /// Value under a job's status key.
    pub fn status_of(&self, job_id: &str) -> Option<Vec<u8>> {
        self.inner.value_of(&self.keys.status_key(&JobId::new(job_id)))
    }

    pub fn is_completed(&self, job_id: &str) -> bool {
        self.status_of(job_id).as_deref() == Some(COMPLETED_MARKER)
    }

    /// Take a device lease as some other worker, bypassing the journal.
    pub fn hold_device(&self, device: &str, holder: &str, ttl: Duration) -> Option<LeaseHandle> {
        let request = LockRequest {
            name: self.keys.lock_key(&DeviceName::new(device)),
            holder: holder.to_string(),
            ttl,
            wait: Duration::ZERO,
        };
        match self.inner.acquire(&request) {
            Ok(AcquireOutcome::Acquired(lease)) => Some(lease),
            _ => None,
        }
    }

    /// Current holder of a device lock.
    pub fn device_holder(&self, device: &str) -> Option<String> {
        self.inner
            .holder_of(&self.keys.lock_key(&DeviceName::new(device)))
    }
}

impl BlockingLeaseClient for JournaledLeaseClient {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.journal.record(JournalEntry::Get {
            key: key.to_string(),
        });
        if self.faults.fail_get.load(Ordering::SeqCst) {
            tracing::debug!(target: "devlock_testkit", name = %key, "injecting get failure");
            anyhow::bail!("injected get failure");
        }
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        if self.faults.fail_put.load(Ordering::SeqCst) {
            tracing::debug!(target: "devlock_testkit", name = %key, "injecting put failure");
            anyhow::bail!("injected put failure");
        }
        self.inner.put(key, value)?;
        self.journal.record(JournalEntry::Put {
            key: key.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn acquire(&self, request: &LockRequest) -> anyhow::Result<AcquireOutcome> {
        if self.faults.fail_acquire.load(Ordering::SeqCst) {
            tracing::debug!(target: "devlock_testkit", name = %request.name, "injecting acquire failure");
            anyhow::bail!("injected acquire failure");
        }
        let outcome = self.inner.acquire(request)?;
        self.journal.record(JournalEntry::Acquire {
            name: request.name.clone(),
            holder: request.holder.clone(),
            granted: matches!(outcome, AcquireOutcome::Acquired(_)),
        });
        Ok(outcome)
    }

    fn release(&self, lease: &LeaseHandle) -> anyhow::Result<bool> {
        if self.faults.fail_release.load(Ordering::SeqCst) {
            tracing::debug!(target: "devlock_testkit", name = %lease.name, "injecting release failure");
            anyhow::bail!("injected release failure");
        }
        let released = self.inner.release(lease)?;
        self.journal.record(JournalEntry::Release {
            name: lease.name.clone(),
            released,
        });
        Ok(released)
    }
}
