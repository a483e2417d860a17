use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::error::StoreError;
use crate::lease::{AcquireOutcome, LeaseHandle, LeaseId, LockRequest};
use crate::store::LeaseStore;

/// Interval between takeover attempts while a lease is held elsewhere.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const CREATE_KV_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS devlock_kv (
        key TEXT PRIMARY KEY,
        value BYTEA NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_LEASES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS devlock_leases (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        lease_id UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
"#;

/// PostgreSQL-backed lease store.
///
/// Completion markers live in `devlock_kv`; device leases live in
/// `devlock_leases`, one row per lock key. A row whose `expires_at` has
/// passed is free and is taken over in place by the next acquirer, so
/// expiry needs no background sweeper. The database clock is the only clock
/// that matters.
#[derive(Clone, Debug)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool using the given persistence settings.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        info!(
            max_connections = config.max_connections,
            "connected postgres lease store"
        );
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(CREATE_KV_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_LEASES_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    /// One takeover attempt. Returns the new expiry when the lease was taken.
    async fn try_acquire(
        &self,
        request: &LockRequest,
        lease_id: LeaseId,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO devlock_leases (name, holder, lease_id, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder,
                lease_id = EXCLUDED.lease_id,
                expires_at = EXCLUDED.expires_at
            WHERE devlock_leases.expires_at <= NOW()
            RETURNING expires_at
            "#,
        )
        .bind(&request.name)
        .bind(&request.holder)
        .bind(lease_id.0)
        .bind(request.ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.try_get::<DateTime<Utc>, _>("expires_at"))
            .transpose()
    }

    async fn current_holder(&self, name: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT holder
            FROM devlock_leases
            WHERE name = $1
              AND expires_at > NOW()
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.try_get::<String, _>("holder"))
            .transpose()
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM devlock_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::unreachable("get", e))?;

        row.map(|row| row.try_get::<Vec<u8>, _>("value"))
            .transpose()
            .map_err(|e| StoreError::unreachable("get", e))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devlock_kv (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::unreachable("put", e))?;
        Ok(())
    }

    async fn acquire(&self, request: LockRequest) -> Result<AcquireOutcome, StoreError> {
        let deadline = Instant::now() + request.wait;
        let lease_id = LeaseId::new();

        loop {
            let acquired = self
                .try_acquire(&request, lease_id)
                .await
                .map_err(|e| StoreError::unreachable("acquire", e))?;

            if let Some(expires_at) = acquired {
                debug!(name = %request.name, lease_id = %lease_id, "postgres lease acquired");
                return Ok(AcquireOutcome::Acquired(LeaseHandle {
                    name: request.name,
                    holder: request.holder,
                    lease_id,
                    expires_at,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                let holder = self
                    .current_holder(&request.name)
                    .await
                    .map_err(|e| StoreError::unreachable("acquire", e))?;
                return Ok(AcquireOutcome::Denied { holder });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn release(&self, lease: &LeaseHandle) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            DELETE FROM devlock_leases
            WHERE name = $1
              AND lease_id = $2
              AND expires_at > NOW()
            "#,
        )
        .bind(&lease.name)
        .bind(lease.lease_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::unreachable("release", e))?;

        Ok(res.rows_affected() > 0)
    }
}
