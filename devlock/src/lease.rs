use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one granted lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request for a TTL-bound exclusive lease on a lock key.
#[derive(Clone, Debug)]
pub struct LockRequest {
    /// Full lock key, e.g. `/locks/device/r1`.
    pub name: String,
    /// Identity recorded as the holder.
    pub holder: String,
    /// Lease lifetime. The store drops the lease once it lapses.
    pub ttl: Duration,
    /// How long the store may wait for a held lease to free up.
    pub wait: Duration,
}

/// A lease granted by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaseHandle {
    /// Lock key the lease was granted on.
    pub name: String,
    /// Holder identity.
    pub holder: String,
    /// Unique identifier for this grant; release only succeeds with it.
    pub lease_id: LeaseId,
    /// Timestamp when the store will drop the lease.
    pub expires_at: DateTime<Utc>,
}

impl LeaseHandle {
    pub fn new(name: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        // Out-of-range TTLs are clamped; no store honours a lease that long.
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        Self {
            name: name.into(),
            holder: holder.into(),
            lease_id: LeaseId::new(),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Checks if the lease has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Result of a lease acquisition attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum AcquireOutcome {
    /// The lease was granted.
    Acquired(LeaseHandle),
    /// Another holder kept the lease for the whole wait.
    Denied {
        /// Current holder, when the store reports it.
        holder: Option<String>,
    },
}
