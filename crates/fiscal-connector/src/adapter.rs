//! KKM provider adapters for ADAPTER mode.
//!
//! An adapter talks to a fiscal provider synchronously from the server.
//! Adapters are registered once at startup; the registry is read-only
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use fiscal_core::{FiscalResult, ReceiptDraft};

/// Provider key reported by [`UnconfiguredAdapter`].
pub const UNCONFIGURED_PROVIDER: &str = "unconfigured";

/// Provider call failure. Both kinds end the attempt as FAILED; the
/// distinction is kept for logs and operators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Network or provider outage.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Provider rejected the receipt.
    #[error("provider rejected receipt: {0}")]
    Permanent(String),
}

impl AdapterError {
    /// The provider's own message.
    pub fn message(&self) -> &str {
        match self {
            AdapterError::Transient(msg) | AdapterError::Permanent(msg) => msg,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// Health of one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    pub provider_key: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// A fiscal provider integration.
#[async_trait]
pub trait KkmAdapter: Send + Sync {
    fn provider_key(&self) -> &str;

    async fn health(&self) -> AdapterHealth;

    /// Registers one receipt with the provider.
    async fn fiscalize_receipt(&self, draft: &ReceiptDraft) -> Result<FiscalResult, AdapterError>;
}

/// Fallback for stores whose provider key is missing or unknown.
#[derive(Debug, Default)]
pub struct UnconfiguredAdapter;

#[async_trait]
impl KkmAdapter for UnconfiguredAdapter {
    fn provider_key(&self) -> &str {
        UNCONFIGURED_PROVIDER
    }

    async fn health(&self) -> AdapterHealth {
        AdapterHealth {
            provider_key: UNCONFIGURED_PROVIDER.to_string(),
            healthy: false,
            detail: Some("no KKM provider configured".to_string()),
        }
    }

    async fn fiscalize_receipt(&self, _draft: &ReceiptDraft) -> Result<FiscalResult, AdapterError> {
        Err(AdapterError::Permanent("no KKM provider configured for this store".to_string()))
    }
}

/// Adapters keyed by provider key.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn KkmAdapter>>,
    fallback: Arc<dyn KkmAdapter>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        AdapterRegistry {
            adapters: HashMap::new(),
            fallback: Arc::new(UnconfiguredAdapter),
        }
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter under its own provider key, replacing any previous one.
    pub fn register(mut self, adapter: Arc<dyn KkmAdapter>) -> Self {
        self.adapters.insert(adapter.provider_key().to_string(), adapter);
        self
    }

    /// Adapter for `provider_key`, or the unconfigured fallback.
    pub fn resolve(&self, provider_key: Option<&str>) -> Arc<dyn KkmAdapter> {
        provider_key
            .and_then(|key| self.adapters.get(key))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.adapters.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Health of every registered adapter, ordered by provider key.
    pub async fn health_report(&self) -> Vec<AdapterHealth> {
        let mut report = Vec::with_capacity(self.adapters.len());
        for key in self.provider_keys() {
            if let Some(adapter) = self.adapters.get(&key) {
                report.push(adapter.health().await);
            }
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted adapter shared by the service tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub struct ScriptedAdapter {
        key: String,
        outcome: Mutex<Result<FiscalResult, AdapterError>>,
        delay: Duration,
        pub calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        pub fn succeeding(key: &str) -> Self {
            Self::with(
                key,
                Ok(FiscalResult {
                    provider_receipt_id: Some("PRV-1".into()),
                    fiscal_number: Some("FN-0001".into()),
                    kkm_factory_number: Some("KKM-77".into()),
                    qr_payload: Some("https://ofd.example/q?fn=FN-0001".into()),
                    ..Default::default()
                }),
            )
        }

        pub fn failing(key: &str, err: AdapterError) -> Self {
            Self::with(key, Err(err))
        }

        pub fn with(key: &str, outcome: Result<FiscalResult, AdapterError>) -> Self {
            ScriptedAdapter {
                key: key.to_string(),
                outcome: Mutex::new(outcome),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KkmAdapter for ScriptedAdapter {
        fn provider_key(&self) -> &str {
            &self.key
        }

        async fn health(&self) -> AdapterHealth {
            AdapterHealth {
                provider_key: self.key.clone(),
                healthy: true,
                detail: None,
            }
        }

        async fn fiscalize_receipt(&self, _draft: &ReceiptDraft) -> Result<FiscalResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.lock().unwrap().clone()
        }
    }
}
