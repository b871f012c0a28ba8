//! # fiscal-connector: Dispatch and Connector Protocol
//!
//! Turns completed sales into fiscal receipts, either through a certified
//! provider (ADAPTER mode) or through a paired on-premises agent that drives
//! the KKM hardware (CONNECTOR mode).
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         fiscal-connector                                │
//! │                                                                         │
//! │   CompletedSale                                                         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌──────────────────────┐   ADAPTER    ┌──────────────────┐             │
//! │  │ FiscalDispatchRouter │─────────────►│ AdapterRegistry  │──► provider │
//! │  └──────────┬───────────┘              └──────────────────┘             │
//! │             │ CONNECTOR                                                 │
//! │             ▼                                                           │
//! │     fiscal_receipts (QUEUED)  ◄── LeaseReclaimer / RetryScheduler       │
//! │             ▲                                                           │
//! │             │ pull / push          ┌────────────────┐                   │
//! │  ┌──────────┴───────────┐  pair    │ PairingService │                   │
//! │  │   ConnectorQueue     │◄─────────│ + rate limiter │                   │
//! │  └──────────┬───────────┘          └────────────────┘                   │
//! │             │ HTTP (axum)                                               │
//! └─────────────┼───────────────────────────────────────────────────────────┘
//!               ▼
//!        connector agent
//! ```
//!
//! ## Module Organization
//!
//! ### Dispatch
//! - [`adapter`] - `KkmAdapter` trait and provider registry
//! - [`router`] - Per-sale mode selection and idempotent dispatch
//! - [`retry`] - Dead-letter sweeps and manual retry
//!
//! ### Connector protocol
//! - [`queue`] - Pull (lease) and push (result) for agents
//! - [`pairing`] - Pairing codes and device tokens
//! - [`reclaimer`] - Background lease reclaim
//! - [`auth`] - Token format, hashing, authentication
//! - [`rate_limit`] - Per-IP pairing limiter
//! - [`http`] - axum routes
//!
//! ### Ambient
//! - [`config`] - Environment configuration
//! - [`metrics`] - Counters and store online gauge
//! - [`error`] - Error type and HTTP mapping
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_connector::{AdapterRegistry, ConnectorConfig, FiscalDispatchRouter, InMemoryMetrics};
//!
//! let config = ConnectorConfig::load()?;
//! let router = FiscalDispatchRouter::new(
//!     db.clone(),
//!     Arc::new(AdapterRegistry::new()),
//!     Arc::new(InMemoryMetrics::new()),
//!     DispatchSettings::from(&config),
//! );
//!
//! // Called by the host once a sale is completed
//! let outcome = router.dispatch(&sale).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod adapter;
pub mod router;
pub mod retry;

pub mod auth;
pub mod http;
pub mod pairing;
pub mod queue;
pub mod rate_limit;
pub mod reclaimer;

pub mod config;
pub mod error;
pub mod metrics;

// =============================================================================
// Re-exports
// =============================================================================

pub use adapter::{AdapterError, AdapterHealth, AdapterRegistry, KkmAdapter, UnconfiguredAdapter};
pub use auth::{DeviceAuthenticator, DeviceToken, TokenHasher};
pub use config::{ConfigError, ConnectorConfig};
pub use error::{ConnectorError, ConnectorResult};
pub use http::AppState;
pub use metrics::{FiscalMetrics, InMemoryMetrics, MetricsSnapshot};
pub use pairing::{PairRequest, PairingResult, PairingService};
pub use queue::{ConnectorQueue, PushAck, QueueSettings};
pub use rate_limit::{IpRateLimiter, PairingRateLimiter};
pub use reclaimer::{LeaseReclaimer, LeaseReclaimerHandle, SweepReport};
pub use retry::RetryScheduler;
pub use router::{DispatchOutcome, DispatchSettings, FiscalDispatchRouter};

// =============================================================================
// Test fixtures
// =============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use fiscal_core::validation::generate_pairing_code;
    use fiscal_core::{
        CompletedSale, ComplianceProfile, KkmMode, ReceiptDraft, SaleLine, SalePayment,
        StoreLegalIdentity,
    };
    use fiscal_db::{CreateOutcome, Database, DbConfig, NewAttempt, NewDevice};

    use crate::auth::{DeviceAuthenticator, DeviceToken, TokenHasher};

    pub const ORGANIZATION: &str = "org-1";
    pub const CONNECTOR_STORE: &str = "store-connector";
    pub const ADAPTER_STORE: &str = "store-adapter";

    /// In-memory database with one CONNECTOR and one ADAPTER store.
    pub async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let profiles = [
            ComplianceProfile {
                store_id: CONNECTOR_STORE.into(),
                organization_id: ORGANIZATION.into(),
                enable_kkm: true,
                kkm_mode: KkmMode::Connector,
                kkm_provider_key: None,
                legal_name: Some("Demo Trading LLC".into()),
                tax_id: Some("301234567".into()),
            },
            ComplianceProfile {
                store_id: ADAPTER_STORE.into(),
                organization_id: ORGANIZATION.into(),
                enable_kkm: true,
                kkm_mode: KkmMode::Adapter,
                kkm_provider_key: Some("mock".into()),
                legal_name: Some("Demo Trading LLC".into()),
                tax_id: Some("301234567".into()),
            },
        ];
        for profile in &profiles {
            db.compliance().upsert(profile).await.unwrap();
        }

        db
    }

    pub fn completed_sale(store_id: &str, sale_id: &str) -> CompletedSale {
        CompletedSale {
            organization_id: ORGANIZATION.into(),
            store_id: store_id.into(),
            sale_id: sale_id.into(),
            receipt_number: Some(format!("R-{}", sale_id)),
            items: vec![SaleLine {
                sku: "TEA-01".into(),
                name: "Green tea".into(),
                quantity: 2,
                unit_price_cents: 1500,
                line_total_cents: 3000,
                tax_rate_bps: 1200,
            }],
            payments: vec![SalePayment {
                method: "cash".into(),
                amount_cents: 3000,
            }],
            completed_at: Utc::now(),
        }
    }

    pub fn cheap_hasher() -> TokenHasher {
        TokenHasher::new(8, 1).unwrap()
    }

    pub fn authenticator(db: &Database) -> DeviceAuthenticator {
        DeviceAuthenticator::new(db.clone(), cheap_hasher())
    }

    /// Pairs a device to `store_id` and returns its bearer token.
    pub async fn pair_device(db: &Database, store_id: &str, device_name: &str) -> String {
        let code = generate_pairing_code();
        db.pairing_codes()
            .insert(&code, ORGANIZATION, store_id, Utc::now() + Duration::minutes(10))
            .await
            .unwrap();

        let token = DeviceToken::generate(&Uuid::new_v4().to_string());
        let device = db
            .pairing_codes()
            .redeem(
                &code,
                Utc::now(),
                NewDevice {
                    id: token.device_id.clone(),
                    device_name: device_name.into(),
                    token_hash: cheap_hasher().hash(&token.secret).unwrap(),
                },
            )
            .await
            .unwrap()
            .unwrap();

        DeviceToken {
            device_id: device.id,
            secret: token.secret,
        }
        .expose()
    }

    /// Queues a CONNECTOR receipt for `sale_id` and returns its id.
    pub async fn enqueue(db: &Database, sale_id: &str) -> String {
        let receipt_id = Uuid::new_v4().to_string();
        let draft = ReceiptDraft::from_sale(
            &receipt_id,
            &completed_sale(CONNECTOR_STORE, sale_id),
            StoreLegalIdentity {
                legal_name: Some("Demo Trading LLC".into()),
                tax_id: Some("301234567".into()),
            },
        );

        let outcome = db
            .receipts()
            .create_attempt(NewAttempt {
                id: receipt_id.clone(),
                organization_id: ORGANIZATION.into(),
                store_id: CONNECTOR_STORE.into(),
                sale_id: sale_id.into(),
                mode: KkmMode::Connector,
                payload: draft.to_payload().unwrap(),
                lease: None,
            })
            .await
            .unwrap();

        match outcome {
            CreateOutcome::Created(receipt) => receipt.id,
            CreateOutcome::AlreadyOpen(receipt) | CreateOutcome::AlreadySent(receipt) => {
                panic!("sale {} already has receipt {}", sale_id, receipt.id)
            }
        }
    }
}
