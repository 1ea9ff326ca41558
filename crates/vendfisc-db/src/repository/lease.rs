//! # Lease Repository
//!
//! Per-device worker leases. A worker drains a device only while it holds
//! that device's lease, so items of one device are never processed by two
//! workers at the same time.
//!
//! ```text
//!   worker-a acquire(D1) ──► token 1 ── renew ── renew ── (crash)
//!                                                   │
//!                                         expires_at passes
//!                                                   │
//!   worker-b acquire(D1) ───────────────────────────┴──► token 2
//! ```
//! The token grows on every takeover, so a holder can tell it was fenced
//! off.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::{from_millis, to_millis};
use crate::error::DbResult;

/// Current holder of a device lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLease {
    pub device_id: String,
    pub holder: String,
    pub token: i64,
    pub expires_at: DateTime<Utc>,
}

impl DeviceLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    device_id: String,
    holder: String,
    token: i64,
    expires_at: i64,
}

impl From<LeaseRow> for DeviceLease {
    fn from(row: LeaseRow) -> Self {
        DeviceLease {
            device_id: row.device_id,
            holder: row.holder,
            token: row.token,
            expires_at: from_millis(row.expires_at),
        }
    }
}

/// Repository for device leases.
#[derive(Debug, Clone)]
pub struct LeaseRepository {
    pool: SqlitePool,
}

impl LeaseRepository {
    /// Creates a new LeaseRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LeaseRepository { pool }
    }

    /// Takes the lease if it is free, expired or already ours.
    ///
    /// ## Returns
    /// The fencing token, or `None` while another holder's lease is live.
    pub async fn acquire(
        &self,
        device_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<Option<i64>> {
        let token: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO device_leases (device_id, holder, token, expires_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT (device_id) DO UPDATE SET
                holder = excluded.holder,
                token = CASE WHEN device_leases.holder = excluded.holder
                             THEN device_leases.token
                             ELSE device_leases.token + 1 END,
                expires_at = excluded.expires_at
            WHERE device_leases.expires_at <= ?4 OR device_leases.holder = excluded.holder
            RETURNING token
            "#,
        )
        .bind(device_id)
        .bind(holder)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        match token {
            Some(token) => debug!(device_id = %device_id, holder = %holder, token, "Lease acquired"),
            None => debug!(device_id = %device_id, holder = %holder, "Lease held elsewhere"),
        }
        Ok(token)
    }

    /// Extends a lease we still hold with the same token.
    ///
    /// `false` means the lease was lost and the caller must stop draining.
    pub async fn renew(
        &self,
        device_id: &str,
        holder: &str,
        token: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE device_leases SET expires_at = ?4 \
             WHERE device_id = ?1 AND holder = ?2 AND token = ?3",
        )
        .bind(device_id)
        .bind(holder)
        .bind(token)
        .bind(to_millis(now + ttl))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Gives the lease up by expiring it.
    pub async fn release(&self, device_id: &str, holder: &str, token: i64) -> DbResult<()> {
        sqlx::query(
            "UPDATE device_leases SET expires_at = 0 \
             WHERE device_id = ?1 AND holder = ?2 AND token = ?3",
        )
        .bind(device_id)
        .bind(holder)
        .bind(token)
        .execute(&self.pool)
        .await?;
        debug!(device_id = %device_id, holder = %holder, token, "Lease released");
        Ok(())
    }

    pub async fn current(&self, device_id: &str) -> DbResult<Option<DeviceLease>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT device_id, holder, token, expires_at FROM device_leases WHERE device_id = ?1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DeviceLease::from))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{db, device, t0};

    #[tokio::test]
    async fn test_exclusive_until_expiry() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let leases = db.leases();
        let ttl = Duration::seconds(30);

        let a = leases.acquire(&d.id, "worker-a", ttl, t0()).await.unwrap();
        assert_eq!(a, Some(1));
        assert_eq!(leases.acquire(&d.id, "worker-b", ttl, t0()).await.unwrap(), None);

        // Re-acquiring our own lease keeps the token
        assert_eq!(leases.acquire(&d.id, "worker-a", ttl, t0()).await.unwrap(), Some(1));

        let later = t0() + Duration::seconds(31);
        let b = leases.acquire(&d.id, "worker-b", ttl, later).await.unwrap();
        assert_eq!(b, Some(2));

        // worker-a was fenced off
        assert!(!leases.renew(&d.id, "worker-a", 1, ttl, later).await.unwrap());
        assert!(leases.renew(&d.id, "worker-b", 2, ttl, later).await.unwrap());

        let current = leases.current(&d.id).await.unwrap().unwrap();
        assert_eq!(current.holder, "worker-b");
        assert!(!current.is_expired(later));
    }

    #[tokio::test]
    async fn test_release_frees_lease() {
        let db = db().await;
        let d = device(&db, "D1").await;
        let leases = db.leases();
        let ttl = Duration::seconds(30);

        leases.acquire(&d.id, "worker-a", ttl, t0()).await.unwrap();
        leases.release(&d.id, "worker-a", 1).await.unwrap();
        assert_eq!(leases.acquire(&d.id, "worker-b", ttl, t0()).await.unwrap(), Some(2));
    }
}
