//! # Connector Device Repository
//!
//! Paired agents and their token hashes. Pairing itself (code consumption
//! plus device upsert) lives in [`super::pairing`] so both happen in one
//! transaction.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;
use fiscal_core::ConnectorDevice;

/// Repository for connector device operations.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    /// Gets a device by ID, active or not.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<ConnectorDevice>> {
        let device = sqlx::query_as::<_, ConnectorDevice>("SELECT * FROM connector_devices WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(device)
    }

    /// Lists devices paired to a store, newest pairing first.
    pub async fn list_for_store(&self, store_id: &str) -> DbResult<Vec<ConnectorDevice>> {
        let devices = sqlx::query_as::<_, ConnectorDevice>(
            r#"
            SELECT * FROM connector_devices
            WHERE store_id = ?1
            ORDER BY paired_at DESC
            "#,
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    /// Records a poll.
    pub async fn touch_last_seen(&self, id: &str, seen_at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE connector_devices SET last_seen_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;

        debug!(device_id = %id, "Device seen");
        Ok(())
    }

    /// Whether any active device of the store polled at or after `since`.
    pub async fn any_seen_since(&self, store_id: &str, since: DateTime<Utc>) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM connector_devices
            WHERE store_id = ?1
              AND is_active = 1
              AND last_seen_at >= ?2
            "#,
        )
        .bind(store_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Deactivates a device. Returns `false` if it was unknown or already
    /// revoked.
    pub async fn revoke(&self, id: &str) -> DbResult<bool> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE connector_devices SET
                is_active = 0,
                revoked_at = ?2
            WHERE id = ?1 AND is_active = 1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let revoked = result.rows_affected() == 1;
        if revoked {
            info!(device_id = %id, "Device revoked");
        }
        Ok(revoked)
    }
}
