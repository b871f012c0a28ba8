//! # Fiscal Dispatch Router
//!
//! Entry point called by the host right after a sale completes.
//!
//! ```text
//! dispatch(sale)
//!   │
//!   ├─ no profile / enableKkm = false ──────────────► NotRequired
//!   ├─ sale already has a SENT receipt ─────────────► AlreadyFiscalized
//!   │
//!   ├─ ADAPTER ── insert PROCESSING (claims sale) ──► provider call (timeout)
//!   │                  │ open row exists                 │
//!   │                  └────────────► AlreadyInFlight    ├─ Ok  ──► SENT
//!   │                                                    └─ Err ──► FAILED
//!   │
//!   └─ CONNECTOR ─ insert QUEUED ───────────────────► Queued
//!                      │ open row exists
//!                      └────────────────────────────► AlreadyQueued
//! ```
//!
//! `dispatch` never returns an error: a storage failure is logged and
//! reported as `Deferred` so the sale itself is never failed by fiscalization.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use fiscal_core::retry::ADAPTER_INTERRUPTED;
use fiscal_core::validation::bound_error_message;
use fiscal_core::{
    CompletedSale, ComplianceProfile, FiscalReceipt, FiscalResult, FiscalState, KkmMode,
    PushOutcome, ReceiptDraft,
};
use fiscal_db::{CreateOutcome, Database, NewAttempt};

use crate::adapter::AdapterRegistry;
use crate::config::ConnectorConfig;
use crate::error::ConnectorResult;
use crate::metrics::FiscalMetrics;

/// What happened to a dispatched sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DispatchOutcome {
    /// Store does not require fiscalization.
    NotRequired,
    /// A SENT receipt already exists; nothing was done.
    #[serde(rename_all = "camelCase")]
    AlreadyFiscalized { receipt_id: String },
    /// CONNECTOR: new QUEUED receipt.
    #[serde(rename_all = "camelCase")]
    Queued { receipt_id: String },
    /// CONNECTOR: the sale already waits in the queue.
    #[serde(rename_all = "camelCase")]
    AlreadyQueued { receipt_id: String },
    /// ADAPTER: provider accepted the receipt.
    #[serde(rename_all = "camelCase")]
    Sent { receipt_id: String, result: FiscalResult },
    /// ADAPTER: provider call failed; the receipt is FAILED.
    #[serde(rename_all = "camelCase")]
    Failed { receipt_id: String, error: String },
    /// ADAPTER: another provider call for this sale is running.
    #[serde(rename_all = "camelCase")]
    AlreadyInFlight { receipt_id: String },
    /// Storage unavailable; nothing recorded.
    Deferred { reason: String },
}

/// Timing settings for dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub adapter_timeout: Duration,
    pub online_window: chrono::Duration,
}

impl From<&ConnectorConfig> for DispatchSettings {
    fn from(config: &ConnectorConfig) -> Self {
        DispatchSettings {
            adapter_timeout: config.adapter_timeout(),
            online_window: config.online_window(),
        }
    }
}

/// Routes completed sales to ADAPTER or CONNECTOR fiscalization.
#[derive(Clone)]
pub struct FiscalDispatchRouter {
    db: Database,
    registry: Arc<AdapterRegistry>,
    metrics: Arc<dyn FiscalMetrics>,
    settings: DispatchSettings,
}

impl FiscalDispatchRouter {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        metrics: Arc<dyn FiscalMetrics>,
        settings: DispatchSettings,
    ) -> Self {
        FiscalDispatchRouter {
            db,
            registry,
            metrics,
            settings,
        }
    }

    /// Fiscalizes (ADAPTER) or enqueues (CONNECTOR) a completed sale.
    pub async fn dispatch(&self, sale: &CompletedSale) -> DispatchOutcome {
        match self.try_dispatch(sale).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    sale_id = %sale.sale_id,
                    store_id = %sale.store_id,
                    error = %e,
                    "Fiscal dispatch deferred"
                );
                DispatchOutcome::Deferred {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Latest fiscal state of a sale, `None` if it was never dispatched.
    pub async fn fiscal_state(&self, sale_id: &str) -> ConnectorResult<Option<FiscalState>> {
        let latest = self.db.receipts().latest_for_sale(sale_id).await?;
        Ok(latest.map(|receipt| receipt.state()))
    }

    async fn try_dispatch(&self, sale: &CompletedSale) -> ConnectorResult<DispatchOutcome> {
        let profile = match self.db.compliance().get(&sale.store_id).await? {
            Some(profile) if profile.enable_kkm => profile,
            _ => return Ok(DispatchOutcome::NotRequired),
        };

        // Fast path; the insert repeats this check atomically
        if let Some(sent) = self.db.receipts().sent_for_sale(&sale.sale_id).await? {
            return Ok(already_fiscalized(sent));
        }

        let receipt_id = Uuid::new_v4().to_string();
        let draft = ReceiptDraft::from_sale(&receipt_id, sale, profile.legal_identity());

        match profile.kkm_mode {
            KkmMode::Adapter => self.dispatch_adapter(&profile, draft).await,
            KkmMode::Connector => self.enqueue(draft).await,
        }
    }

    async fn enqueue(&self, draft: ReceiptDraft) -> ConnectorResult<DispatchOutcome> {
        let attempt = NewAttempt {
            id: draft.receipt_id.clone(),
            organization_id: draft.organization_id.clone(),
            store_id: draft.store_id.clone(),
            sale_id: draft.sale_id.clone(),
            mode: KkmMode::Connector,
            payload: draft.to_payload()?,
            lease: None,
        };

        let outcome = match self.db.receipts().create_attempt(attempt).await? {
            CreateOutcome::Created(receipt) => {
                self.metrics.receipt_queued(&receipt.store_id);
                info!(
                    receipt_id = %receipt.id,
                    sale_id = %receipt.sale_id,
                    store_id = %receipt.store_id,
                    "Receipt queued for connector"
                );
                DispatchOutcome::Queued {
                    receipt_id: receipt.id,
                }
            }
            CreateOutcome::AlreadyOpen(existing) => already_open(existing),
            CreateOutcome::AlreadySent(sent) => already_fiscalized(sent),
        };

        self.refresh_online_gauge(&draft.store_id).await;
        Ok(outcome)
    }

    async fn dispatch_adapter(
        &self,
        profile: &ComplianceProfile,
        draft: ReceiptDraft,
    ) -> ConnectorResult<DispatchOutcome> {
        let adapter = self.registry.resolve(profile.kkm_provider_key.as_deref());
        let lease_owner = format!("adapter:{}", adapter.provider_key());
        let in_flight_until = Utc::now()
            + chrono::Duration::from_std(self.settings.adapter_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let attempt = NewAttempt {
            id: draft.receipt_id.clone(),
            organization_id: draft.organization_id.clone(),
            store_id: draft.store_id.clone(),
            sale_id: draft.sale_id.clone(),
            mode: KkmMode::Adapter,
            payload: draft.to_payload()?,
            lease: Some((lease_owner, in_flight_until)),
        };

        let receipt = match self.db.receipts().create_attempt(attempt).await? {
            CreateOutcome::Created(receipt) => receipt,
            CreateOutcome::AlreadyOpen(existing) => return Ok(already_open(existing)),
            CreateOutcome::AlreadySent(sent) => return Ok(already_fiscalized(sent)),
        };

        let call = tokio::time::timeout(self.settings.adapter_timeout, adapter.fiscalize_receipt(&draft)).await;
        let outcome = match call {
            Ok(Ok(result)) => PushOutcome::Sent(result),
            Ok(Err(e)) => {
                warn!(
                    receipt_id = %receipt.id,
                    provider = %adapter.provider_key(),
                    transient = e.is_transient(),
                    error = %e,
                    "Provider call failed"
                );
                PushOutcome::Failed {
                    error: bound_error_message(e.message()),
                }
            }
            Err(_) => {
                warn!(receipt_id = %receipt.id, provider = %adapter.provider_key(), "Provider call timed out");
                PushOutcome::Failed {
                    error: format!(
                        "provider call timed out after {}s",
                        self.settings.adapter_timeout.as_secs()
                    ),
                }
            }
        };

        let applied = self
            .db
            .receipts()
            .complete_adapter_attempt(&receipt.id, &outcome)
            .await?;

        if !applied {
            // Interrupted-call sweep got there first
            error!(
                receipt_id = %receipt.id,
                sale_id = %receipt.sale_id,
                reported = %outcome.status(),
                "Adapter result arrived after the attempt was closed"
            );
            return Ok(DispatchOutcome::Failed {
                receipt_id: receipt.id,
                error: ADAPTER_INTERRUPTED.to_string(),
            });
        }

        Ok(match outcome {
            PushOutcome::Sent(result) => {
                self.metrics.receipt_sent(&receipt.store_id);
                info!(
                    receipt_id = %receipt.id,
                    sale_id = %receipt.sale_id,
                    fiscal_number = ?result.fiscal_number,
                    "Receipt fiscalized by adapter"
                );
                DispatchOutcome::Sent {
                    receipt_id: receipt.id,
                    result,
                }
            }
            PushOutcome::Failed { error } => {
                self.metrics.receipt_failed(&receipt.store_id);
                DispatchOutcome::Failed {
                    receipt_id: receipt.id,
                    error,
                }
            }
        })
    }

    async fn refresh_online_gauge(&self, store_id: &str) {
        let since = Utc::now() - self.settings.online_window;
        match self.db.devices().any_seen_since(store_id, since).await {
            Ok(online) => self.metrics.set_store_online(store_id, online),
            Err(e) => warn!(store_id = %store_id, error = %e, "Failed to refresh online gauge"),
        }
    }
}

fn already_fiscalized(sent: FiscalReceipt) -> DispatchOutcome {
    info!(sale_id = %sent.sale_id, receipt_id = %sent.id, "Sale already fiscalized");
    DispatchOutcome::AlreadyFiscalized { receipt_id: sent.id }
}

fn already_open(existing: FiscalReceipt) -> DispatchOutcome {
    info!(
        receipt_id = %existing.id,
        sale_id = %existing.sale_id,
        status = %existing.status,
        "Sale already has an open attempt"
    );
    match existing.mode {
        KkmMode::Connector => DispatchOutcome::AlreadyQueued {
            receipt_id: existing.id,
        },
        KkmMode::Adapter => DispatchOutcome::AlreadyInFlight {
            receipt_id: existing.id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::ScriptedAdapter;
    use crate::adapter::AdapterError;
    use crate::metrics::InMemoryMetrics;
    use crate::test_support::{completed_sale, setup, ADAPTER_STORE, CONNECTOR_STORE};
    use fiscal_core::FiscalStatus;

    fn router(
        db: &Database,
        registry: AdapterRegistry,
        metrics: Arc<InMemoryMetrics>,
    ) -> FiscalDispatchRouter {
        FiscalDispatchRouter::new(
            db.clone(),
            Arc::new(registry),
            metrics,
            DispatchSettings::from(&ConnectorConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_not_required_without_profile_or_flag() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = router(&db, AdapterRegistry::new(), metrics.clone());

        let outcome = router.dispatch(&completed_sale("unknown-store", "S1")).await;
        assert_eq!(outcome, DispatchOutcome::NotRequired);

        let mut profile = db.compliance().get(CONNECTOR_STORE).await.unwrap().unwrap();
        profile.enable_kkm = false;
        db.compliance().upsert(&profile).await.unwrap();

        let outcome = router.dispatch(&completed_sale(CONNECTOR_STORE, "S2")).await;
        assert_eq!(outcome, DispatchOutcome::NotRequired);
        assert_eq!(metrics.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn test_connector_dispatch_queues_once() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = router(&db, AdapterRegistry::new(), metrics.clone());
        let sale = completed_sale(CONNECTOR_STORE, "S1");

        let first = router.dispatch(&sale).await;
        let DispatchOutcome::Queued { receipt_id } = first.clone() else {
            panic!("expected Queued, got {:?}", first);
        };

        let second = router.dispatch(&sale).await;
        assert_eq!(second, DispatchOutcome::AlreadyQueued { receipt_id: receipt_id.clone() });

        let receipts = db.receipts().list_for_sale("S1").await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].status, FiscalStatus::Queued);
        assert_eq!(receipts[0].draft().unwrap().legal.tax_id.as_deref(), Some("301234567"));

        assert_eq!(metrics.snapshot().queued, 1);
        // No device has polled yet
        assert_eq!(metrics.is_online(CONNECTOR_STORE), Some(false));
    }

    #[tokio::test]
    async fn test_adapter_success_is_sent() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let adapter = Arc::new(ScriptedAdapter::succeeding("mock"));
        let router = router(&db, AdapterRegistry::new().register(adapter.clone()), metrics.clone());

        let outcome = router.dispatch(&completed_sale(ADAPTER_STORE, "S1")).await;
        let DispatchOutcome::Sent { receipt_id, result } = outcome.clone() else {
            panic!("expected Sent, got {:?}", outcome);
        };
        assert_eq!(result.fiscal_number.as_deref(), Some("FN-0001"));

        let state = router.fiscal_state("S1").await.unwrap().unwrap();
        assert_eq!(state.receipt_id, receipt_id);
        assert!(state.allows_fiscal_document());
        assert_eq!(state.result.unwrap().kkm_factory_number.as_deref(), Some("KKM-77"));

        // Second dispatch does not call the provider again
        let again = router.dispatch(&completed_sale(ADAPTER_STORE, "S1")).await;
        assert_eq!(again, DispatchOutcome::AlreadyFiscalized { receipt_id });
        assert_eq!(adapter.call_count(), 1);
        assert_eq!(metrics.snapshot().sent, 1);
    }

    #[tokio::test]
    async fn test_adapter_failure_is_recorded_not_raised() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let adapter = Arc::new(ScriptedAdapter::failing(
            "mock",
            AdapterError::Transient("gateway 502".into()),
        ));
        let router = router(&db, AdapterRegistry::new().register(adapter), metrics.clone());

        let outcome = router.dispatch(&completed_sale(ADAPTER_STORE, "S1")).await;
        let DispatchOutcome::Failed { receipt_id, error } = outcome.clone() else {
            panic!("expected Failed, got {:?}", outcome);
        };
        assert_eq!(error, "gateway 502");

        let stored = db.receipts().get_by_id(&receipt_id).await.unwrap().unwrap();
        assert_eq!(stored.status, FiscalStatus::Failed);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("gateway 502"));
        assert!(stored.fiscal_number.is_none());

        let state = router.fiscal_state("S1").await.unwrap().unwrap();
        assert!(!state.allows_fiscal_document());
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails_fast() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = router(&db, AdapterRegistry::new(), metrics);

        let outcome = router.dispatch(&completed_sale(ADAPTER_STORE, "S1")).await;
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_adapter_timeout_fails_attempt() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let adapter = Arc::new(ScriptedAdapter::succeeding("mock").delayed(Duration::from_millis(200)));
        let router = FiscalDispatchRouter::new(
            db.clone(),
            Arc::new(AdapterRegistry::new().register(adapter)),
            metrics,
            DispatchSettings {
                adapter_timeout: Duration::from_millis(20),
                online_window: chrono::Duration::seconds(120),
            },
        );

        let outcome = router.dispatch(&completed_sale(ADAPTER_STORE, "S1")).await;
        let DispatchOutcome::Failed { error, .. } = outcome.clone() else {
            panic!("expected Failed, got {:?}", outcome);
        };
        assert!(error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_concurrent_adapter_dispatch_calls_provider_once() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let adapter = Arc::new(ScriptedAdapter::succeeding("mock").delayed(Duration::from_millis(50)));
        let router = router(&db, AdapterRegistry::new().register(adapter.clone()), metrics);
        let sale = completed_sale(ADAPTER_STORE, "S1");

        let (a, b) = tokio::join!(router.dispatch(&sale), router.dispatch(&sale));
        let outcomes = [a, b];

        assert_eq!(adapter.call_count(), 1);
        assert!(outcomes.iter().any(|o| matches!(o, DispatchOutcome::Sent { .. })));
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, DispatchOutcome::AlreadyInFlight { .. })));
    }

    #[tokio::test]
    async fn test_dispatch_racing_sent_push_never_requeues() {
        use crate::queue::{ConnectorQueue, QueueSettings};
        use crate::test_support::{authenticator, pair_device};
        use fiscal_core::ResultPush;

        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = router(&db, AdapterRegistry::new(), metrics.clone());
        let queue = ConnectorQueue::new(
            db.clone(),
            authenticator(&db),
            metrics,
            QueueSettings::from(&ConnectorConfig::default()),
        );
        let token = pair_device(&db, CONNECTOR_STORE, "till-1").await;

        for n in 0..25 {
            let sale = completed_sale(CONNECTOR_STORE, &format!("S{}", n));
            router.dispatch(&sale).await;
            let items = queue.pull(&token, Some(1)).await.unwrap();
            assert_eq!(items.len(), 1);

            let push = ResultPush {
                receipt_id: items[0].receipt_id.clone(),
                status: "SENT".into(),
                fiscal_number: Some(format!("FN-{}", n)),
                ..Default::default()
            };
            let (ack, outcome) = tokio::join!(queue.push(&token, push), router.dispatch(&sale));
            assert!(ack.unwrap().applied);
            assert!(
                matches!(
                    outcome,
                    DispatchOutcome::AlreadyQueued { .. } | DispatchOutcome::AlreadyFiscalized { .. }
                ),
                "unexpected outcome {:?}",
                outcome
            );

            let rows = db.receipts().list_for_sale(&sale.sale_id).await.unwrap();
            assert_eq!(rows.len(), 1, "sale {} got a second attempt", sale.sale_id);
            assert_eq!(rows[0].status, FiscalStatus::Sent);
        }
    }

    #[tokio::test]
    async fn test_storage_failure_defers() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = router(&db, AdapterRegistry::new(), metrics);
        db.close().await;

        let outcome = router.dispatch(&completed_sale(CONNECTOR_STORE, "S1")).await;
        assert!(matches!(outcome, DispatchOutcome::Deferred { .. }));
    }
}
