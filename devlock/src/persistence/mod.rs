/// PostgreSQL lease store.
///
/// This module provides `PostgresLeaseStore`, a native async implementation
/// of the [`LeaseStore`](crate::store::LeaseStore) trait keeping completion
/// markers and device leases in PostgreSQL.
pub mod postgres;

pub use postgres::PostgresLeaseStore;
