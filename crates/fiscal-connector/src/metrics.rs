//! Fiscal counters and the per-store online gauge.
//!
//! Components receive an `Arc<dyn FiscalMetrics>`; exporting is up to the
//! host. [`InMemoryMetrics`] keeps everything in process and backs `/health`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Metrics sink for the pipeline.
pub trait FiscalMetrics: Send + Sync {
    fn receipt_queued(&self, store_id: &str);
    fn receipt_sent(&self, store_id: &str);
    fn receipt_failed(&self, store_id: &str);
    /// Connector freshness for a store.
    fn set_store_online(&self, store_id: &str, online: bool);
}

/// Process-local counters.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    queued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    online: DashMap<String, bool>,
}

/// Point-in-time view of [`InMemoryMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
    pub stores_online: usize,
    pub stores_offline: usize,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let online = self.online.iter().filter(|entry| *entry.value()).count();
        MetricsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stores_online: online,
            stores_offline: self.online.len() - online,
        }
    }

    /// Last gauge value for a store, if it was ever set.
    pub fn is_online(&self, store_id: &str) -> Option<bool> {
        self.online.get(store_id).map(|entry| *entry.value())
    }
}

impl FiscalMetrics for InMemoryMetrics {
    fn receipt_queued(&self, _store_id: &str) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn receipt_sent(&self, _store_id: &str) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn receipt_failed(&self, _store_id: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn set_store_online(&self, store_id: &str, online: bool) {
        self.online.insert(store_id.to_string(), online);
    }
}
