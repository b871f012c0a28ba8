//! # Fiscal Receipt Repository
//!
//! Persistence of fiscalization attempts. Every status change here is one
//! guarded statement, so concurrent server instances and agents race safely:
//! the statement either matches the expected current status and moves the
//! row, or matches nothing.
//!
//! ## Guarded Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Operation             Guard                            New status      │
//! │  ───────────────────   ──────────────────────────────   ─────────────   │
//! │  create_attempt        partial UNIQUE(sale_id) open     QUEUED/PROC.    │
//! │  claim_batch           status = queued                  PROCESSING      │
//! │  apply_connector_...   status IN (queued, processing)   SENT / FAILED   │
//! │  complete_adapter_...  status = processing, adapter     SENT / FAILED   │
//! │  reclaim_expired       processing AND lease < now       QUEUED / FAILED │
//! │  dead_letter_exhausted queued AND attempts > max        FAILED          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fiscal_core::retry::MAX_ATTEMPTS_EXCEEDED;
use fiscal_core::{FiscalReceipt, FiscalResult, FiscalStatus, KkmMode, PushOutcome};

/// Input for a new fiscalization attempt.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub id: String,
    pub organization_id: String,
    pub store_id: String,
    pub sale_id: String,
    pub mode: KkmMode,
    /// JSON `ReceiptDraft`.
    pub payload: String,
    /// `Some` creates the row already PROCESSING under this lease
    /// (adapter calls); `None` creates it QUEUED.
    pub lease: Option<(String, DateTime<Utc>)>,
}

/// Result of [`ReceiptRepository::create_attempt`].
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// New row inserted.
    Created(FiscalReceipt),
    /// The sale already has a non-terminal attempt; nothing inserted.
    AlreadyOpen(FiscalReceipt),
    /// The sale is already fiscalized; nothing inserted.
    AlreadySent(FiscalReceipt),
}

/// Repository for fiscal receipt operations.
#[derive(Debug, Clone)]
pub struct ReceiptRepository {
    pool: SqlitePool,
}

impl ReceiptRepository {
    /// Creates a new ReceiptRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReceiptRepository { pool }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Inserts a new attempt.
    ///
    /// One statement refuses both a second open attempt (partial unique
    /// index) and any attempt for a sale that already has a SENT receipt
    /// (`NOT EXISTS` guard), so a result committed concurrently can never be
    /// followed by a fresh attempt.
    pub async fn create_attempt(&self, attempt: NewAttempt) -> DbResult<CreateOutcome> {
        let now = Utc::now();
        let (status, lease_owner, lease_expires_at) = match attempt.lease {
            Some((owner, expires)) => (FiscalStatus::Processing, Some(owner), Some(expires)),
            None => (FiscalStatus::Queued, None, None),
        };

        let receipt = FiscalReceipt {
            id: attempt.id,
            organization_id: attempt.organization_id,
            store_id: attempt.store_id,
            sale_id: attempt.sale_id,
            mode: attempt.mode,
            status,
            payload: attempt.payload,
            provider_receipt_id: None,
            fiscal_number: None,
            kkm_factory_number: None,
            kkm_registration_number: None,
            upfd_or_fiscal_memory: None,
            qr_payload: None,
            fiscalized_at: None,
            last_error: None,
            attempt_count: 0,
            lease_owner,
            lease_expires_at,
            created_at: now,
            updated_at: now,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO fiscal_receipts (
                id, organization_id, store_id, sale_id, mode, status, payload,
                attempt_count, lease_owner, lease_expires_at, created_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
            WHERE NOT EXISTS (
                SELECT 1 FROM fiscal_receipts WHERE sale_id = ?4 AND status = 'sent'
            )
            "#,
        )
        .bind(&receipt.id)
        .bind(&receipt.organization_id)
        .bind(&receipt.store_id)
        .bind(&receipt.sale_id)
        .bind(receipt.mode)
        .bind(receipt.status)
        .bind(&receipt.payload)
        .bind(receipt.attempt_count)
        .bind(&receipt.lease_owner)
        .bind(receipt.lease_expires_at)
        .bind(receipt.created_at)
        .bind(receipt.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) if done.rows_affected() == 0 => match self.sent_for_sale(&receipt.sale_id).await? {
                Some(sent) => {
                    debug!(sale_id = %receipt.sale_id, receipt_id = %sent.id, "Sale already fiscalized");
                    Ok(CreateOutcome::AlreadySent(sent))
                }
                None => Err(DbError::Internal(format!(
                    "attempt for sale {} was neither inserted nor blocked",
                    receipt.sale_id
                ))),
            },
            Ok(_) => {
                debug!(
                    receipt_id = %receipt.id,
                    sale_id = %receipt.sale_id,
                    status = %receipt.status,
                    "Fiscal attempt created"
                );
                Ok(CreateOutcome::Created(receipt))
            }
            Err(err) => {
                let err = DbError::from(err);
                if !err.is_unique_violation() {
                    return Err(err);
                }
                if let Some(existing) = self.open_for_sale(&receipt.sale_id).await? {
                    return Ok(CreateOutcome::AlreadyOpen(existing));
                }
                // Open attempt resolved between the insert and the read
                match self.sent_for_sale(&receipt.sale_id).await? {
                    Some(sent) => Ok(CreateOutcome::AlreadySent(sent)),
                    None => Err(err),
                }
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Gets a receipt by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<FiscalReceipt>> {
        let receipt = sqlx::query_as::<_, FiscalReceipt>("SELECT * FROM fiscal_receipts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(receipt)
    }

    /// The sale's non-terminal attempt, if any.
    pub async fn open_for_sale(&self, sale_id: &str) -> DbResult<Option<FiscalReceipt>> {
        let receipt = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            SELECT * FROM fiscal_receipts
            WHERE sale_id = ?1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(receipt)
    }

    /// The sale's most recent attempt.
    pub async fn latest_for_sale(&self, sale_id: &str) -> DbResult<Option<FiscalReceipt>> {
        let receipt = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            SELECT * FROM fiscal_receipts
            WHERE sale_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(receipt)
    }

    /// Every attempt for a sale, oldest first (audit trail).
    pub async fn list_for_sale(&self, sale_id: &str) -> DbResult<Vec<FiscalReceipt>> {
        let receipts = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            SELECT * FROM fiscal_receipts
            WHERE sale_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(receipts)
    }

    /// The sale's successful attempt, if any.
    pub async fn sent_for_sale(&self, sale_id: &str) -> DbResult<Option<FiscalReceipt>> {
        let receipt = sqlx::query_as::<_, FiscalReceipt>(
            "SELECT * FROM fiscal_receipts WHERE sale_id = ?1 AND status = 'sent' LIMIT 1",
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(receipt)
    }

    /// Number of receipts per status, for health reporting.
    pub async fn status_counts(&self) -> DbResult<Vec<(FiscalStatus, i64)>> {
        let rows: Vec<(FiscalStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM fiscal_receipts GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // =========================================================================
    // Connector pull
    // =========================================================================

    /// Claims up to `limit` queued connector receipts of a store for one device.
    ///
    /// One statement: the inner SELECT picks candidates, the outer guard
    /// `status = 'queued'` makes a row claimable by exactly one caller.
    pub async fn claim_batch(
        &self,
        store_id: &str,
        device_id: &str,
        limit: u32,
        lease_expires_at: DateTime<Utc>,
        max_attempts: i64,
    ) -> DbResult<Vec<FiscalReceipt>> {
        let now = Utc::now();

        let mut claimed = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            UPDATE fiscal_receipts SET
                status = 'processing',
                lease_owner = ?1,
                lease_expires_at = ?2,
                updated_at = ?3
            WHERE id IN (
                SELECT id FROM fiscal_receipts
                WHERE store_id = ?4
                  AND mode = 'connector'
                  AND status = 'queued'
                  AND attempt_count <= ?5
                ORDER BY created_at ASC
                LIMIT ?6
            )
            AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(device_id)
        .bind(lease_expires_at)
        .bind(now)
        .bind(store_id)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        debug!(
            store_id = %store_id,
            device_id = %device_id,
            claimed = claimed.len(),
            "Claimed receipts"
        );

        Ok(claimed)
    }

    // =========================================================================
    // Result application
    // =========================================================================

    /// Applies a connector's terminal report.
    ///
    /// Returns `false` when the receipt was not in QUEUED/PROCESSING (already
    /// resolved, or not a connector receipt of this store).
    pub async fn apply_connector_result(
        &self,
        id: &str,
        store_id: &str,
        outcome: &PushOutcome,
    ) -> DbResult<bool> {
        self.resolve(
            id,
            outcome,
            "store_id = ?2 AND mode = 'connector' AND status IN ('queued', 'processing')",
            Some(store_id),
        )
        .await
    }

    /// Records the result of a synchronous adapter call.
    pub async fn complete_adapter_attempt(&self, id: &str, outcome: &PushOutcome) -> DbResult<bool> {
        self.resolve(id, outcome, "mode = 'adapter' AND status = 'processing'", None)
            .await
    }

    async fn resolve(
        &self,
        id: &str,
        outcome: &PushOutcome,
        guard: &'static str,
        store_id: Option<&str>,
    ) -> DbResult<bool> {
        let now = Utc::now();

        // ?1 id, ?2 store (may be unused by the guard), ?3 now
        let result = match outcome {
            PushOutcome::Sent(fields) => {
                let sql = format!(
                    r#"
                    UPDATE fiscal_receipts SET
                        status = 'sent',
                        provider_receipt_id = ?4,
                        fiscal_number = ?5,
                        kkm_factory_number = ?6,
                        kkm_registration_number = ?7,
                        upfd_or_fiscal_memory = ?8,
                        qr_payload = ?9,
                        fiscalized_at = ?3,
                        last_error = NULL,
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        updated_at = ?3
                    WHERE id = ?1 AND {guard}
                    "#
                );
                let FiscalResult {
                    provider_receipt_id,
                    fiscal_number,
                    kkm_factory_number,
                    kkm_registration_number,
                    upfd_or_fiscal_memory,
                    qr_payload,
                } = fields;

                sqlx::query(&sql)
                    .bind(id)
                    .bind(store_id)
                    .bind(now)
                    .bind(provider_receipt_id)
                    .bind(fiscal_number)
                    .bind(kkm_factory_number)
                    .bind(kkm_registration_number)
                    .bind(upfd_or_fiscal_memory)
                    .bind(qr_payload)
                    .execute(&self.pool)
                    .await?
            }
            PushOutcome::Failed { error } => {
                let sql = format!(
                    r#"
                    UPDATE fiscal_receipts SET
                        status = 'failed',
                        attempt_count = attempt_count + 1,
                        last_error = ?4,
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        updated_at = ?3
                    WHERE id = ?1 AND {guard}
                    "#
                );

                sqlx::query(&sql)
                    .bind(id)
                    .bind(store_id)
                    .bind(now)
                    .bind(error)
                    .execute(&self.pool)
                    .await?
            }
        };

        let applied = result.rows_affected() == 1;
        debug!(
            receipt_id = %id,
            status = %outcome.status(),
            applied,
            "Resolve attempt"
        );

        Ok(applied)
    }

    // =========================================================================
    // Recovery sweeps
    // =========================================================================

    /// Returns expired connector leases to the pool.
    ///
    /// `attempt_count` is incremented; rows whose new count exceeds
    /// `max_attempts` are dead-lettered in the same statement. SET
    /// expressions see the pre-update row, so both CASEs agree.
    pub async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: i64,
    ) -> DbResult<Vec<FiscalReceipt>> {
        let reclaimed = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            UPDATE fiscal_receipts SET
                attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 > ?2 THEN 'failed' ELSE 'queued' END,
                last_error = CASE WHEN attempt_count + 1 > ?2 THEN ?3 ELSE last_error END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?1
            WHERE mode = 'connector'
              AND status = 'processing'
              AND lease_expires_at < ?1
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(max_attempts)
        .bind(MAX_ATTEMPTS_EXCEEDED)
        .fetch_all(&self.pool)
        .await?;

        Ok(reclaimed)
    }

    /// Dead-letters queued connector receipts already above the ceiling.
    pub async fn dead_letter_exhausted(&self, max_attempts: i64) -> DbResult<Vec<FiscalReceipt>> {
        let now = Utc::now();

        let failed = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            UPDATE fiscal_receipts SET
                status = 'failed',
                last_error = ?3,
                updated_at = ?1
            WHERE mode = 'connector'
              AND status = 'queued'
              AND attempt_count > ?2
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(max_attempts)
        .bind(MAX_ATTEMPTS_EXCEEDED)
        .fetch_all(&self.pool)
        .await?;

        Ok(failed)
    }

    /// Fails adapter attempts whose in-flight window ended before `cutoff`.
    pub async fn fail_stale_adapter_attempts(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> DbResult<Vec<FiscalReceipt>> {
        let now = Utc::now();

        let failed = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            UPDATE fiscal_receipts SET
                status = 'failed',
                attempt_count = attempt_count + 1,
                last_error = ?2,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?1
            WHERE mode = 'adapter'
              AND status = 'processing'
              AND lease_expires_at < ?3
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(reason)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(failed)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
