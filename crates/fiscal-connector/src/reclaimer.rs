//! # Lease Reclaimer
//!
//! Background sweep returning expired connector leases to the queue.
//!
//! ```text
//!  every 30s:
//!    UPDATE fiscal_receipts
//!      SET attempt_count + 1, lease cleared,
//!          status = QUEUED, or FAILED 'maxAttemptsExceeded' past the ceiling
//!      WHERE mode = connector AND status = PROCESSING AND lease_expires_at < now
//! ```
//!
//! One statement per tick, so several server instances may run the loop at
//! once; a row is moved by whichever instance reaches it first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use fiscal_core::{FiscalStatus, RetryPolicy};
use fiscal_db::Database;

use crate::error::{ConnectorError, ConnectorResult};
use crate::metrics::FiscalMetrics;
use crate::retry::RetryScheduler;

/// Summary of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// Periodic lease reclaim.
pub struct LeaseReclaimer {
    db: Database,
    metrics: Arc<dyn FiscalMetrics>,
    policy: RetryPolicy,
    interval: Duration,
    scheduler: Option<RetryScheduler>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping the reclaimer loop.
#[derive(Clone)]
pub struct LeaseReclaimerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl LeaseReclaimerHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> ConnectorResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| ConnectorError::Internal("Reclaimer already stopped".into()))
    }
}

impl LeaseReclaimer {
    /// Creates a reclaimer and its handle.
    pub fn new(
        db: Database,
        metrics: Arc<dyn FiscalMetrics>,
        policy: RetryPolicy,
        interval: Duration,
    ) -> (Self, LeaseReclaimerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let reclaimer = LeaseReclaimer {
            db,
            metrics,
            policy,
            interval,
            scheduler: None,
            shutdown_rx,
        };

        (reclaimer, LeaseReclaimerHandle { shutdown_tx })
    }

    /// Also runs the retry scheduler's dead-letter sweeps on every tick.
    pub fn with_scheduler(mut self, scheduler: RetryScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Runs the sweep loop until shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Lease reclaimer starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Lease reclaim sweep failed");
                    }
                    if let Some(scheduler) = &self.scheduler {
                        if let Err(e) = scheduler.run_sweeps().await {
                            error!(error = %e, "Dead-letter sweep failed");
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Lease reclaimer shutting down");
                    break;
                }
            }
        }

        info!("Lease reclaimer stopped");
    }

    /// One sweep over expired leases.
    pub async fn sweep_once(&self) -> ConnectorResult<SweepReport> {
        let reclaimed = self
            .db
            .receipts()
            .reclaim_expired(Utc::now(), self.policy.max_attempts)
            .await?;

        let mut report = SweepReport::default();
        for receipt in &reclaimed {
            if receipt.status == FiscalStatus::Failed {
                report.dead_lettered += 1;
                self.metrics.receipt_failed(&receipt.store_id);
                warn!(
                    receipt_id = %receipt.id,
                    sale_id = %receipt.sale_id,
                    attempt_count = receipt.attempt_count,
                    "Receipt dead-lettered after lease expiry"
                );
            } else {
                report.requeued += 1;
                debug!(
                    receipt_id = %receipt.id,
                    attempt_count = receipt.attempt_count,
                    "Lease expired, receipt requeued"
                );
            }
        }

        if !reclaimed.is_empty() {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                "Lease reclaim sweep"
            );
        }

        Ok(report)
    }
}
