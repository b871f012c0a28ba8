//! # Retry Scheduler
//!
//! Bounded retry and dead-lettering outside the lease path.
//!
//! - Exhausted QUEUED receipts (ceiling lowered after they were counted)
//!   are failed with `maxAttemptsExceeded`.
//! - ADAPTER attempts left PROCESSING by a crashed server are failed with
//!   `adapterInterrupted`. They are never retried automatically: the
//!   provider may already have fiscalized the sale.
//! - `retry(sale)` is the operator's manual retry of a FAILED sale.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use fiscal_core::retry::ADAPTER_INTERRUPTED;
use fiscal_core::RetryPolicy;
use fiscal_db::Database;

use crate::error::{ConnectorError, ConnectorResult};
use crate::metrics::FiscalMetrics;
use crate::router::{DispatchOutcome, FiscalDispatchRouter};

/// Dead-letter sweeps and manual retry.
#[derive(Clone)]
pub struct RetryScheduler {
    db: Database,
    router: FiscalDispatchRouter,
    metrics: Arc<dyn FiscalMetrics>,
    policy: RetryPolicy,
    /// How long past its timeout an adapter attempt may stay PROCESSING.
    adapter_grace: chrono::Duration,
}

impl RetryScheduler {
    pub fn new(
        db: Database,
        router: FiscalDispatchRouter,
        metrics: Arc<dyn FiscalMetrics>,
        policy: RetryPolicy,
        adapter_grace: chrono::Duration,
    ) -> Self {
        RetryScheduler {
            db,
            router,
            metrics,
            policy,
            adapter_grace,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fails QUEUED connector receipts already above the ceiling.
    pub async fn sweep_exhausted(&self) -> ConnectorResult<usize> {
        let failed = self
            .db
            .receipts()
            .dead_letter_exhausted(self.policy.max_attempts)
            .await?;

        for receipt in &failed {
            self.metrics.receipt_failed(&receipt.store_id);
            warn!(
                receipt_id = %receipt.id,
                sale_id = %receipt.sale_id,
                attempt_count = receipt.attempt_count,
                "Receipt dead-lettered"
            );
        }

        Ok(failed.len())
    }

    /// Fails ADAPTER attempts whose provider call can no longer complete.
    pub async fn sweep_interrupted_adapter_calls(&self) -> ConnectorResult<usize> {
        let cutoff = Utc::now() - self.adapter_grace;
        let failed = self
            .db
            .receipts()
            .fail_stale_adapter_attempts(cutoff, ADAPTER_INTERRUPTED)
            .await?;

        for receipt in &failed {
            self.metrics.receipt_failed(&receipt.store_id);
            warn!(
                receipt_id = %receipt.id,
                sale_id = %receipt.sale_id,
                lease_owner = ?receipt.lease_owner,
                "Interrupted adapter call marked failed"
            );
        }

        Ok(failed.len())
    }

    /// Both sweeps; run on every reclaimer tick.
    pub async fn run_sweeps(&self) -> ConnectorResult<usize> {
        let exhausted = self.sweep_exhausted().await?;
        let interrupted = self.sweep_interrupted_adapter_calls().await?;
        Ok(exhausted + interrupted)
    }

    /// Operator retry: dispatches the sale again from its stored draft under
    /// the store's current profile.
    ///
    /// Safe in any state: a SENT sale answers `AlreadyFiscalized`, an open
    /// attempt answers `AlreadyQueued` / `AlreadyInFlight`.
    pub async fn retry(&self, sale_id: &str) -> ConnectorResult<DispatchOutcome> {
        let latest = self
            .db
            .receipts()
            .latest_for_sale(sale_id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("sale {}", sale_id)))?;

        let sale = latest.draft()?.to_sale();
        let outcome = self.router.dispatch(&sale).await;

        info!(
            sale_id = %sale_id,
            previous_receipt_id = %latest.id,
            previous_status = %latest.status,
            outcome = ?outcome,
            "Manual fiscal retry"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::ScriptedAdapter;
    use crate::adapter::AdapterRegistry;
    use crate::metrics::InMemoryMetrics;
    use crate::router::DispatchSettings;
    use crate::test_support::{completed_sale, enqueue, setup, ADAPTER_STORE, CONNECTOR_STORE};
    use fiscal_core::{FiscalStatus, KkmMode, PushOutcome};
    use fiscal_db::NewAttempt;

    fn scheduler(db: &Database, metrics: Arc<InMemoryMetrics>, registry: AdapterRegistry) -> RetryScheduler {
        let router = FiscalDispatchRouter::new(
            db.clone(),
            Arc::new(registry),
            metrics.clone(),
            DispatchSettings {
                adapter_timeout: std::time::Duration::from_secs(5),
                online_window: chrono::Duration::seconds(120),
            },
        );
        RetryScheduler::new(
            db.clone(),
            router,
            metrics,
            RetryPolicy::default(),
            chrono::Duration::seconds(120),
        )
    }

    #[tokio::test]
    async fn test_sweep_exhausted_after_lowering_ceiling() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let receipt_id = enqueue(&db, "S1").await;
        for _ in 0..3 {
            db.receipts()
                .claim_batch(CONNECTOR_STORE, "dev-a", 10, Utc::now() - chrono::Duration::seconds(1), 5)
                .await
                .unwrap();
            db.receipts().reclaim_expired(Utc::now(), 5).await.unwrap();
        }

        let lowered = RetryScheduler {
            policy: RetryPolicy::new(2),
            ..scheduler(&db, metrics.clone(), AdapterRegistry::new())
        };
        assert_eq!(lowered.sweep_exhausted().await.unwrap(), 1);
        assert_eq!(lowered.sweep_exhausted().await.unwrap(), 0);

        let stored = db.receipts().get_by_id(&receipt_id).await.unwrap().unwrap();
        assert_eq!(stored.status, FiscalStatus::Failed);
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_interrupted_adapter_call_is_failed() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let scheduler = scheduler(&db, metrics.clone(), AdapterRegistry::new());

        // Simulates a server that died mid-call long ago
        db.receipts()
            .create_attempt(NewAttempt {
                id: "R-stale".into(),
                organization_id: "org-1".into(),
                store_id: ADAPTER_STORE.into(),
                sale_id: "S1".into(),
                mode: KkmMode::Adapter,
                payload: "{}".into(),
                lease: Some(("adapter:mock".into(), Utc::now() - chrono::Duration::minutes(10))),
            })
            .await
            .unwrap();

        assert_eq!(scheduler.run_sweeps().await.unwrap(), 1);

        let stored = db.receipts().get_by_id("R-stale").await.unwrap().unwrap();
        assert_eq!(stored.status, FiscalStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(ADAPTER_INTERRUPTED));
    }

    #[tokio::test]
    async fn test_in_flight_adapter_call_is_left_alone() {
        let db = setup().await;
        let scheduler = scheduler(&db, Arc::new(InMemoryMetrics::new()), AdapterRegistry::new());

        db.receipts()
            .create_attempt(NewAttempt {
                id: "R-live".into(),
                organization_id: "org-1".into(),
                store_id: ADAPTER_STORE.into(),
                sale_id: "S1".into(),
                mode: KkmMode::Adapter,
                payload: "{}".into(),
                lease: Some(("adapter:mock".into(), Utc::now() + chrono::Duration::seconds(30))),
            })
            .await
            .unwrap();

        assert_eq!(scheduler.sweep_interrupted_adapter_calls().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_retry_after_failure() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let receipt_id = enqueue(&db, "S1").await;
        db.receipts()
            .apply_connector_result(
                &receipt_id,
                CONNECTOR_STORE,
                &PushOutcome::Failed { error: "paper out".into() },
            )
            .await
            .unwrap();

        let scheduler = scheduler(&db, metrics, AdapterRegistry::new());
        let outcome = scheduler.retry("S1").await.unwrap();
        let DispatchOutcome::Queued { receipt_id: new_id } = outcome.clone() else {
            panic!("expected Queued, got {:?}", outcome);
        };
        assert_ne!(new_id, receipt_id);

        // Retrying again while the new attempt is open is a no-op
        let again = scheduler.retry("S1").await.unwrap();
        assert_eq!(again, DispatchOutcome::AlreadyQueued { receipt_id: new_id });

        let history = db.receipts().list_for_sale("S1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, FiscalStatus::Failed);
    }

    #[tokio::test]
    async fn test_manual_retry_of_fiscalized_sale() {
        let db = setup().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let adapter = Arc::new(ScriptedAdapter::succeeding("mock"));
        let scheduler = scheduler(&db, metrics, AdapterRegistry::new().register(adapter.clone()));

        scheduler.router.dispatch(&completed_sale(ADAPTER_STORE, "S1")).await;
        let outcome = scheduler.retry("S1").await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::AlreadyFiscalized { .. }));
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_unknown_sale() {
        let db = setup().await;
        let scheduler = scheduler(&db, Arc::new(InMemoryMetrics::new()), AdapterRegistry::new());

        let err = scheduler.retry("never-sold").await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotFound(_)));
    }
}
