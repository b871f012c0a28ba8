//! # Connector Queue
//!
//! The agent-facing half of CONNECTOR mode.
//!
//! ```text
//! Agent                                   Server
//!   │  GET /connector/queue?limit=10         │
//!   │───────────────────────────────────────►│ claim QUEUED → PROCESSING
//!   │◄───────────────── [QueueItem ...] ─────│ lease = now + 120s
//!   │                                        │
//!   │  (prints on the KKM)                   │
//!   │                                        │
//!   │  POST /connector/result {SENT|FAILED}  │
//!   │───────────────────────────────────────►│ guarded update, once
//!   │◄──────────────── {ok, applied} ────────│
//! ```
//!
//! Pushes are idempotent: a report against an already terminal receipt is
//! acknowledged with `applied: false` and changes nothing.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use fiscal_core::lifecycle::push_disposition;
use fiscal_core::validation::clamp_pull_limit;
use fiscal_core::{KkmMode, PushDisposition, PushOutcome, QueueItem, ResultPush};
use fiscal_db::Database;

use crate::auth::DeviceAuthenticator;
use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::metrics::FiscalMetrics;

/// Acknowledgement of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub ok: bool,
    /// `false` when the receipt was already terminal.
    pub applied: bool,
}

/// Pull sizing and lease settings.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub lease: chrono::Duration,
    pub default_limit: u32,
    pub max_limit: u32,
    pub max_attempts: i64,
}

impl From<&ConnectorConfig> for QueueSettings {
    fn from(config: &ConnectorConfig) -> Self {
        QueueSettings {
            lease: config.lease(),
            default_limit: config.default_pull_limit,
            max_limit: config.max_pull_limit,
            max_attempts: config.max_attempts,
        }
    }
}

/// Pull/push protocol for connector agents.
#[derive(Clone)]
pub struct ConnectorQueue {
    db: Database,
    auth: DeviceAuthenticator,
    metrics: Arc<dyn FiscalMetrics>,
    settings: QueueSettings,
}

impl ConnectorQueue {
    pub fn new(
        db: Database,
        auth: DeviceAuthenticator,
        metrics: Arc<dyn FiscalMetrics>,
        settings: QueueSettings,
    ) -> Self {
        ConnectorQueue {
            db,
            auth,
            metrics,
            settings,
        }
    }

    /// Claims up to `limit` queued receipts of the device's store.
    pub async fn pull(&self, token: &str, limit: Option<u32>) -> ConnectorResult<Vec<QueueItem>> {
        let device = self.auth.authenticate(token).await?;
        let limit = clamp_pull_limit(limit, self.settings.default_limit, self.settings.max_limit);

        let now = Utc::now();
        let claimed = self
            .db
            .receipts()
            .claim_batch(
                &device.store_id,
                &device.id,
                limit,
                now + self.settings.lease,
                self.settings.max_attempts,
            )
            .await?;

        self.db.devices().touch_last_seen(&device.id, now).await?;
        self.metrics.set_store_online(&device.store_id, true);

        let mut items = Vec::with_capacity(claimed.len());
        for receipt in &claimed {
            match QueueItem::try_from(receipt) {
                Ok(item) => items.push(item),
                // Left PROCESSING; the reclaimer walks it to the dead-letter
                Err(e) => error!(receipt_id = %receipt.id, error = %e, "Unreadable receipt payload"),
            }
        }

        if items.is_empty() {
            debug!(device_id = %device.id, "Queue empty");
        } else {
            info!(
                device_id = %device.id,
                store_id = %device.store_id,
                count = items.len(),
                "Receipts leased to connector"
            );
        }

        Ok(items)
    }

    /// Applies a connector's terminal report.
    pub async fn push(&self, token: &str, push: ResultPush) -> ConnectorResult<PushAck> {
        let device = self.auth.authenticate(token).await?;
        let validated = push.validate()?;

        let receipt = self
            .db
            .receipts()
            .get_by_id(&validated.receipt_id)
            .await?
            .filter(|r| {
                r.organization_id == device.organization_id
                    && r.store_id == device.store_id
                    && r.mode == KkmMode::Connector
            })
            .ok_or_else(|| ConnectorError::NotFound(format!("receipt {}", validated.receipt_id)))?;

        if push_disposition(receipt.status, validated.outcome.status()) == PushDisposition::AlreadyResolved
        {
            debug!(
                receipt_id = %receipt.id,
                status = %receipt.status,
                "Push against terminal receipt ignored"
            );
            return Ok(PushAck {
                ok: true,
                applied: false,
            });
        }

        let applied = self
            .db
            .receipts()
            .apply_connector_result(&receipt.id, &device.store_id, &validated.outcome)
            .await?;

        if applied {
            match &validated.outcome {
                PushOutcome::Sent(_) => self.metrics.receipt_sent(&receipt.store_id),
                PushOutcome::Failed { .. } => self.metrics.receipt_failed(&receipt.store_id),
            }
            info!(
                receipt_id = %receipt.id,
                sale_id = %receipt.sale_id,
                device_id = %device.id,
                status = %validated.outcome.status(),
                "Connector result applied"
            );
        } else {
            // Another push or the dead-letter sweep won the race
            debug!(receipt_id = %receipt.id, "Receipt resolved concurrently");
        }

        Ok(PushAck { ok: true, applied })
    }
}
