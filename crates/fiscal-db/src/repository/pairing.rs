//! # Pairing Code Repository
//!
//! Single-use codes and their redemption.
//!
//! ## Redemption
//! ```text
//! BEGIN
//!   UPDATE pairing_codes SET consumed_at = now
//!     WHERE code = ? AND consumed_at IS NULL AND expires_at > now
//!     RETURNING organization_id, store_id        ── no row → None, ROLLBACK
//!   INSERT INTO connector_devices ...
//!     ON CONFLICT (store_id, device_name) DO UPDATE  ── reactivate, new hash
//!     RETURNING *
//! COMMIT
//! ```
//! The conditional UPDATE is the only gate: two redemptions of the same code
//! cannot both see `consumed_at IS NULL`.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use fiscal_core::{ConnectorDevice, PairingCode};

/// Device row to create (or reactivate) on redemption.
#[derive(Debug, Clone)]
pub struct NewDevice {
    /// Used only when no device with this name exists in the store yet.
    pub id: String,
    pub device_name: String,
    pub token_hash: String,
}

/// Repository for pairing code operations.
#[derive(Debug, Clone)]
pub struct PairingCodeRepository {
    pool: SqlitePool,
}

impl PairingCodeRepository {
    /// Creates a new PairingCodeRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PairingCodeRepository { pool }
    }

    /// Stores a freshly issued code.
    ///
    /// Fails with `UniqueViolation` if the code value already exists.
    pub async fn insert(
        &self,
        code: &str,
        organization_id: &str,
        store_id: &str,
        expires_at: DateTime<Utc>,
    ) -> DbResult<PairingCode> {
        let now = Utc::now();

        let pairing = sqlx::query_as::<_, PairingCode>(
            r#"
            INSERT INTO pairing_codes (code, organization_id, store_id, expires_at, consumed_at, created_at)
            VALUES (?1, ?2, ?3, ?4, NULL, ?5)
            RETURNING *
            "#,
        )
        .bind(code)
        .bind(organization_id)
        .bind(store_id)
        .bind(expires_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::duplicate(field, code),
            other => other,
        })?;

        debug!(store_id = %store_id, expires_at = %expires_at, "Pairing code stored");
        Ok(pairing)
    }

    /// Gets a code by value.
    pub async fn get(&self, code: &str) -> DbResult<Option<PairingCode>> {
        let pairing = sqlx::query_as::<_, PairingCode>("SELECT * FROM pairing_codes WHERE code = ?1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        Ok(pairing)
    }

    /// Consumes `code` and creates or reactivates the device in one
    /// transaction.
    ///
    /// Returns `None` when the code is unknown, consumed or expired.
    pub async fn redeem(
        &self,
        code: &str,
        now: DateTime<Utc>,
        device: NewDevice,
    ) -> DbResult<Option<ConnectorDevice>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let scope: Option<(String, String)> = sqlx::query_as(
            r#"
            UPDATE pairing_codes SET consumed_at = ?2
            WHERE code = ?1
              AND consumed_at IS NULL
              AND expires_at > ?2
            RETURNING organization_id, store_id
            "#,
        )
        .bind(code)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((organization_id, store_id)) = scope else {
            tx.rollback()
                .await
                .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
            return Ok(None);
        };

        let paired = sqlx::query_as::<_, ConnectorDevice>(
            r#"
            INSERT INTO connector_devices (
                id, organization_id, store_id, token_hash, device_name,
                is_active, paired_at, last_seen_at, revoked_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, NULL, NULL)
            ON CONFLICT (store_id, device_name) DO UPDATE SET
                organization_id = excluded.organization_id,
                token_hash = excluded.token_hash,
                is_active = 1,
                paired_at = excluded.paired_at,
                revoked_at = NULL
            RETURNING *
            "#,
        )
        .bind(&device.id)
        .bind(&organization_id)
        .bind(&store_id)
        .bind(&device.token_hash)
        .bind(&device.device_name)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        info!(
            device_id = %paired.id,
            store_id = %paired.store_id,
            device_name = %paired.device_name,
            "Device paired"
        );
        Ok(Some(paired))
    }
}
