//! Lease storage shared by every gateway instance.
//!
//! An owner lease names the one instance allowed to run a session's hub. A
//! runtime lease records that the owner finished bringing the sandbox runtime
//! up. Both are keyed by session id.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryLeaseStore;
pub use sqlite::SqliteLeaseStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerLease {
    pub session_id: String,
    pub instance_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeLease {
    pub session_id: String,
    pub owner_instance_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    /// The caller now holds the lease (fresh or re-acquired).
    Acquired(OwnerLease),
    /// Another instance holds a non-expired lease.
    Held(OwnerLease),
}

#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("lease store backend error: {0}")]
    Backend(String),
    #[error("lease store database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type LeaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LeaseStoreError>> + Send + 'a>>;

/// TTL-capable coordination store reachable by every gateway instance.
///
/// `acquire` must be linearizable per session: of any set of concurrent
/// callers at most one observes `Acquired` while the lease is live.
pub trait LeaseStore: Send + Sync + 'static {
    fn acquire(
        &self,
        session_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> LeaseFuture<'_, LeaseAcquisition>;

    /// Extends the lease if `instance_id` still holds it. Returns `false` when
    /// the lease was lost to another instance or released.
    fn renew(&self, session_id: &str, instance_id: &str, ttl: Duration) -> LeaseFuture<'_, bool>;

    /// Deletes the lease only if `instance_id` holds it.
    fn release(&self, session_id: &str, instance_id: &str) -> LeaseFuture<'_, bool>;

    /// Current non-expired owner, if any.
    fn owner(&self, session_id: &str) -> LeaseFuture<'_, Option<OwnerLease>>;

    fn set_runtime_lease(&self, session_id: &str, owner_instance_id: &str) -> LeaseFuture<'_, ()>;

    /// Clears the runtime lease only if it was written by `owner_instance_id`.
    fn clear_runtime_lease(
        &self,
        session_id: &str,
        owner_instance_id: &str,
    ) -> LeaseFuture<'_, bool>;

    fn runtime_lease(&self, session_id: &str) -> LeaseFuture<'_, Option<RuntimeLease>>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
