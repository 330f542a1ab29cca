use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::{
    datetime_from_ms, now_ms, ttl_ms, LeaseAcquisition, LeaseFuture, LeaseStore, LeaseStoreError,
    OwnerLease, RuntimeLease,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lease store backed by a SQLite database file.
///
/// Gateway processes on one host point at the same file. Acquisition is a
/// single conditional upsert so SQLite's write lock serializes contenders.
#[derive(Debug, Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub async fn open(path: &Path) -> Result<Self, LeaseStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// Private in-memory database. One connection, since every SQLite memory
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self, LeaseStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, LeaseStoreError> {
        sqlx::query(include_str!("../migrations/0001_init.sql"))
            .execute(&pool)
            .await?;
        tracing::debug!("sqlite lease store ready");
        Ok(Self { pool })
    }

    async fn read_owner(&self, session_id: &str) -> Result<Option<OwnerLease>, LeaseStoreError> {
        let row = sqlx::query(
            "SELECT instance_id, expires_at_ms FROM owner_leases
             WHERE session_id = ?1 AND expires_at_ms > ?2",
        )
        .bind(session_id)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let instance_id: String = row.try_get("instance_id")?;
            let expires_at_ms: i64 = row.try_get("expires_at_ms")?;
            Ok::<_, LeaseStoreError>(OwnerLease {
                session_id: session_id.to_string(),
                instance_id,
                expires_at: datetime_from_ms(expires_at_ms),
            })
        })
        .transpose()
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn acquire(
        &self,
        session_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> LeaseFuture<'_, LeaseAcquisition> {
        let session_id = session_id.to_string();
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            let now = now_ms();
            let expires_at_ms = now.saturating_add(ttl_ms(ttl));
            let result = sqlx::query(
                r#"INSERT INTO owner_leases (session_id, instance_id, expires_at_ms)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(session_id) DO UPDATE SET
                     instance_id = excluded.instance_id,
                     expires_at_ms = excluded.expires_at_ms
                   WHERE owner_leases.expires_at_ms <= ?4
                      OR owner_leases.instance_id = excluded.instance_id"#,
            )
            .bind(&session_id)
            .bind(&instance_id)
            .bind(expires_at_ms)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(LeaseAcquisition::Acquired(OwnerLease {
                    session_id,
                    instance_id,
                    expires_at: datetime_from_ms(expires_at_ms),
                }));
            }

            match self.read_owner(&session_id).await? {
                Some(holder) => Ok(LeaseAcquisition::Held(holder)),
                // Holder expired between the upsert and the read.
                None => Err(LeaseStoreError::Backend(format!(
                    "lease for session {session_id} changed during acquisition"
                ))),
            }
        })
    }

    fn renew(&self, session_id: &str, instance_id: &str, ttl: Duration) -> LeaseFuture<'_, bool> {
        let session_id = session_id.to_string();
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            let expires_at_ms = now_ms().saturating_add(ttl_ms(ttl));
            let result = sqlx::query(
                "UPDATE owner_leases SET expires_at_ms = ?3
                 WHERE session_id = ?1 AND instance_id = ?2",
            )
            .bind(&session_id)
            .bind(&instance_id)
            .bind(expires_at_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn release(&self, session_id: &str, instance_id: &str) -> LeaseFuture<'_, bool> {
        let session_id = session_id.to_string();
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            let result =
                sqlx::query("DELETE FROM owner_leases WHERE session_id = ?1 AND instance_id = ?2")
                    .bind(&session_id)
                    .bind(&instance_id)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn owner(&self, session_id: &str) -> LeaseFuture<'_, Option<OwnerLease>> {
        let session_id = session_id.to_string();
        Box::pin(async move { self.read_owner(&session_id).await })
    }

    fn set_runtime_lease(&self, session_id: &str, owner_instance_id: &str) -> LeaseFuture<'_, ()> {
        let session_id = session_id.to_string();
        let owner_instance_id = owner_instance_id.to_string();
        Box::pin(async move {
            sqlx::query(
                r#"INSERT INTO runtime_leases (session_id, owner_instance_id, recorded_at_ms)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(session_id) DO UPDATE SET
                     owner_instance_id = excluded.owner_instance_id,
                     recorded_at_ms = excluded.recorded_at_ms"#,
            )
            .bind(&session_id)
            .bind(&owner_instance_id)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn clear_runtime_lease(
        &self,
        session_id: &str,
        owner_instance_id: &str,
    ) -> LeaseFuture<'_, bool> {
        let session_id = session_id.to_string();
        let owner_instance_id = owner_instance_id.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM runtime_leases WHERE session_id = ?1 AND owner_instance_id = ?2",
            )
            .bind(&session_id)
            .bind(&owner_instance_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn runtime_lease(&self, session_id: &str) -> LeaseFuture<'_, Option<RuntimeLease>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT owner_instance_id, recorded_at_ms FROM runtime_leases WHERE session_id = ?1",
            )
            .bind(&session_id)
            .fetch_optional(&self.pool)
            .await?;

            let lease = match row {
                Some(row) => {
                    let owner_instance_id: String = row.try_get("owner_instance_id")?;
                    let recorded_at_ms: i64 = row.try_get("recorded_at_ms")?;
                    Some(RuntimeLease {
                        session_id,
                        owner_instance_id,
                        recorded_at: datetime_from_ms(recorded_at_ms),
                    })
                }
                None => None,
            };
            Ok(lease)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn conditional_upsert_rejects_live_holder() {
        let store = SqliteLeaseStore::in_memory().await.expect("open store");
        let first = store.acquire("ses_1", "gw-a", TTL).await.expect("acquire");
        assert!(matches!(first, LeaseAcquisition::Acquired(_)));

        match store.acquire("ses_1", "gw-b", TTL).await.expect("acquire") {
            LeaseAcquisition::Held(holder) => assert_eq!(holder.instance_id, "gw-a"),
            other => panic!("expected held lease, got {other:?}"),
        }

        assert!(store.renew("ses_1", "gw-a", TTL).await.expect("renew"));
        assert!(!store.renew("ses_1", "gw-b", TTL).await.expect("renew"));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = SqliteLeaseStore::in_memory().await.expect("open store");
        store
            .acquire("ses_1", "gw-a", Duration::from_millis(1))
            .await
            .expect("acquire");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let takeover = store.acquire("ses_1", "gw-b", TTL).await.expect("acquire");
        assert!(matches!(takeover, LeaseAcquisition::Acquired(ref lease) if lease.instance_id == "gw-b"));
        assert!(!store.release("ses_1", "gw-a").await.expect("release"));
        assert!(store.release("ses_1", "gw-b").await.expect("release"));
        assert!(store.owner("ses_1").await.expect("owner").is_none());
    }

    #[tokio::test]
    async fn shared_file_is_seen_by_both_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("leases.db");
        let instance_a = SqliteLeaseStore::open(&path).await.expect("open a");
        let instance_b = SqliteLeaseStore::open(&path).await.expect("open b");

        instance_a.acquire("ses_1", "gw-a", TTL).await.expect("acquire");
        instance_a
            .set_runtime_lease("ses_1", "gw-a")
            .await
            .expect("runtime lease");

        let contender = instance_b.acquire("ses_1", "gw-b", TTL).await.expect("acquire");
        assert!(matches!(contender, LeaseAcquisition::Held(_)));
        let runtime = instance_b
            .runtime_lease("ses_1")
            .await
            .expect("read")
            .expect("runtime lease present");
        assert_eq!(runtime.owner_instance_id, "gw-a");
    }
}
