//! # Domain Types
//!
//! Core domain types of the fiscal pipeline.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ FiscalReceipt   │   │ConnectorDevice  │   │  PairingCode    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  id (UUID)      │   │  code (8 chars) │       │
//! │  │  sale_id        │   │  store_id       │   │  store_id       │       │
//! │  │  status         │   │  token_hash     │   │  expires_at     │       │
//! │  │  lease_owner    │   │  last_seen_at   │   │  consumed_at    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  FiscalStatus   │   │    KkmMode      │   │ComplianceProfile│       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Queued         │   │  Adapter        │   │  enable_kkm     │       │
//! │  │  Processing     │   │  Connector      │   │  kkm_mode       │       │
//! │  │  Sent / Failed  │   └─────────────────┘   │  provider_key   │       │
//! │  └─────────────────┘                         └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Fiscal Status
// =============================================================================

/// Status of one fiscalization attempt.
///
/// Stored lowercase in the database, sent uppercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiscalStatus {
    /// Waiting for a connector to claim it.
    Queued,
    /// Claimed under a lease (or an adapter call is in flight).
    Processing,
    /// Fiscalized; result fields are populated.
    Sent,
    /// Permanently failed; needs operator action.
    Failed,
}

impl FiscalStatus {
    /// SENT and FAILED never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, FiscalStatus::Sent | FiscalStatus::Failed)
    }

    /// Wire representation (`"SENT"`).
    pub const fn as_wire(self) -> &'static str {
        match self {
            FiscalStatus::Queued => "QUEUED",
            FiscalStatus::Processing => "PROCESSING",
            FiscalStatus::Sent => "SENT",
            FiscalStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FiscalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

// =============================================================================
// KKM Mode
// =============================================================================

/// How a store reaches its fiscal hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KkmMode {
    /// Synchronous call to a cloud-reachable provider.
    Adapter,
    /// Asynchronous queue served to an on-premises agent.
    Connector,
}

impl Default for KkmMode {
    fn default() -> Self {
        KkmMode::Connector
    }
}

// =============================================================================
// Compliance Profile
// =============================================================================

/// Per-store fiscal settings. Read-only for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ComplianceProfile {
    pub store_id: String,
    pub organization_id: String,
    pub enable_kkm: bool,
    pub kkm_mode: KkmMode,
    /// Registry key of the provider used in ADAPTER mode.
    pub kkm_provider_key: Option<String>,
    /// Registered legal name printed on fiscal receipts.
    pub legal_name: Option<String>,
    /// Taxpayer identification number.
    pub tax_id: Option<String>,
}

impl ComplianceProfile {
    /// Legal identity block copied into every receipt draft.
    pub fn legal_identity(&self) -> StoreLegalIdentity {
        StoreLegalIdentity {
            legal_name: self.legal_name.clone(),
            tax_id: self.tax_id.clone(),
        }
    }
}

/// Store legal identity as required on a fiscal document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct StoreLegalIdentity {
    pub legal_name: Option<String>,
    pub tax_id: Option<String>,
}

// =============================================================================
// Completed Sale (input from the host application)
// =============================================================================

/// A line of a completed sale, snapshotted at sale time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
    /// Tax rate in basis points (1200 = 12%).
    pub tax_rate_bps: u32,
}

/// A tender applied to the sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SalePayment {
    /// "cash", "card", ...
    pub method: String,
    pub amount_cents: i64,
}

/// A sale that has just been completed by the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSale {
    pub organization_id: String,
    pub store_id: String,
    pub sale_id: String,
    pub receipt_number: Option<String>,
    pub items: Vec<SaleLine>,
    pub payments: Vec<SalePayment>,
    pub completed_at: DateTime<Utc>,
}

impl CompletedSale {
    /// Sum of line totals.
    pub fn total_cents(&self) -> i64 {
        self.items.iter().map(|line| line.line_total_cents).sum()
    }
}

// =============================================================================
// Receipt Draft (what the provider / agent fiscalizes)
// =============================================================================

/// Everything needed to fiscalize a sale; never carries result fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptDraft {
    pub receipt_id: String,
    pub organization_id: String,
    pub store_id: String,
    pub sale_id: String,
    pub receipt_number: Option<String>,
    pub items: Vec<SaleLine>,
    pub payments: Vec<SalePayment>,
    pub total_cents: i64,
    pub legal: StoreLegalIdentity,
    #[ts(as = "String")]
    pub completed_at: DateTime<Utc>,
}

impl ReceiptDraft {
    /// Builds the draft for a new attempt.
    pub fn from_sale(receipt_id: &str, sale: &CompletedSale, legal: StoreLegalIdentity) -> Self {
        ReceiptDraft {
            receipt_id: receipt_id.to_string(),
            organization_id: sale.organization_id.clone(),
            store_id: sale.store_id.clone(),
            sale_id: sale.sale_id.clone(),
            receipt_number: sale.receipt_number.clone(),
            items: sale.items.clone(),
            payments: sale.payments.clone(),
            total_cents: sale.total_cents(),
            legal,
            completed_at: sale.completed_at,
        }
    }

    /// Rebuilds the sale this draft was created from (administrative retry).
    pub fn to_sale(&self) -> CompletedSale {
        CompletedSale {
            organization_id: self.organization_id.clone(),
            store_id: self.store_id.clone(),
            sale_id: self.sale_id.clone(),
            receipt_number: self.receipt_number.clone(),
            items: self.items.clone(),
            payments: self.payments.clone(),
            completed_at: self.completed_at,
        }
    }

    /// JSON form persisted in `fiscal_receipts.payload`.
    pub fn to_payload(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }
}

// =============================================================================
// Fiscal Result
// =============================================================================

/// Fields returned by the fiscal device or provider on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct FiscalResult {
    pub provider_receipt_id: Option<String>,
    pub fiscal_number: Option<String>,
    pub kkm_factory_number: Option<String>,
    pub kkm_registration_number: Option<String>,
    pub upfd_or_fiscal_memory: Option<String>,
    pub qr_payload: Option<String>,
}

// =============================================================================
// Fiscal Receipt
// =============================================================================

/// One fiscalization attempt for one sale.
///
/// ## Lifecycle
/// ```text
/// QUEUED ──claim──► PROCESSING ──push──► SENT | FAILED
///   ▲                   │
///   └─────reclaim───────┘   (attempt_count + 1, or FAILED past the ceiling)
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct FiscalReceipt {
    pub id: String,
    pub organization_id: String,
    pub store_id: String,
    pub sale_id: String,
    pub mode: KkmMode,
    pub status: FiscalStatus,
    /// JSON `ReceiptDraft`.
    #[ts(skip)]
    #[serde(skip_serializing, default)]
    pub payload: String,
    pub provider_receipt_id: Option<String>,
    pub fiscal_number: Option<String>,
    pub kkm_factory_number: Option<String>,
    pub kkm_registration_number: Option<String>,
    pub upfd_or_fiscal_memory: Option<String>,
    pub qr_payload: Option<String>,
    #[ts(as = "Option<String>")]
    pub fiscalized_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub attempt_count: i64,
    pub lease_owner: Option<String>,
    #[ts(as = "Option<String>")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl FiscalReceipt {
    /// Decodes the stored draft.
    pub fn draft(&self) -> CoreResult<ReceiptDraft> {
        serde_json::from_str(&self.payload).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }

    /// Result fields, present only once SENT.
    pub fn result(&self) -> Option<FiscalResult> {
        if self.status != FiscalStatus::Sent {
            return None;
        }
        Some(FiscalResult {
            provider_receipt_id: self.provider_receipt_id.clone(),
            fiscal_number: self.fiscal_number.clone(),
            kkm_factory_number: self.kkm_factory_number.clone(),
            kkm_registration_number: self.kkm_registration_number.clone(),
            upfd_or_fiscal_memory: self.upfd_or_fiscal_memory.clone(),
            qr_payload: self.qr_payload.clone(),
        })
    }

    /// Snapshot handed to the host application.
    pub fn state(&self) -> FiscalState {
        FiscalState {
            receipt_id: self.id.clone(),
            sale_id: self.sale_id.clone(),
            status: self.status,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            result: self.result(),
            fiscalized_at: self.fiscalized_at,
        }
    }
}

/// Item served to a connector on pull.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub receipt_id: String,
    pub sale_id: String,
    pub attempt_count: i64,
    #[ts(as = "Option<String>")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub draft: ReceiptDraft,
}

impl TryFrom<&FiscalReceipt> for QueueItem {
    type Error = CoreError;

    fn try_from(receipt: &FiscalReceipt) -> CoreResult<Self> {
        Ok(QueueItem {
            receipt_id: receipt.id.clone(),
            sale_id: receipt.sale_id.clone(),
            attempt_count: receipt.attempt_count,
            lease_expires_at: receipt.lease_expires_at,
            draft: receipt.draft()?,
        })
    }
}

/// Current fiscal state of a sale, as seen by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct FiscalState {
    pub receipt_id: String,
    pub sale_id: String,
    pub status: FiscalStatus,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub result: Option<FiscalResult>,
    #[ts(as = "Option<String>")]
    pub fiscalized_at: Option<DateTime<Utc>>,
}

impl FiscalState {
    /// A "fiscal" receipt document may only be produced once SENT.
    pub fn allows_fiscal_document(&self) -> bool {
        self.status == FiscalStatus::Sent
    }
}

// =============================================================================
// Connector Device
// =============================================================================

/// A paired bridge agent.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorDevice {
    pub id: String,
    pub organization_id: String,
    pub store_id: String,
    /// Argon2 PHC string of the bearer secret. Never serialized.
    #[ts(skip)]
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub device_name: String,
    pub is_active: bool,
    #[ts(as = "String")]
    pub paired_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub revoked_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Pairing Code
// =============================================================================

/// Ephemeral single-use code exchanged for a device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    pub organization_id: String,
    pub store_id: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sale() -> CompletedSale {
        CompletedSale {
            organization_id: "org-1".into(),
            store_id: "store-1".into(),
            sale_id: "S1".into(),
            receipt_number: Some("000042".into()),
            items: vec![
                SaleLine {
                    sku: "TEA-01".into(),
                    name: "Green tea".into(),
                    quantity: 2,
                    unit_price_cents: 1500,
                    line_total_cents: 3000,
                    tax_rate_bps: 1200,
                },
                SaleLine {
                    sku: "BRD-02".into(),
                    name: "Bread".into(),
                    quantity: 1,
                    unit_price_cents: 450,
                    line_total_cents: 450,
                    tax_rate_bps: 0,
                },
            ],
            payments: vec![SalePayment {
                method: "cash".into(),
                amount_cents: 3450,
            }],
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!FiscalStatus::Queued.is_terminal());
        assert!(!FiscalStatus::Processing.is_terminal());
        assert!(FiscalStatus::Sent.is_terminal());
        assert!(FiscalStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&FiscalStatus::Sent).unwrap();
        assert_eq!(json, "\"SENT\"");
        let parsed: FiscalStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, FiscalStatus::Failed);
    }

    #[test]
    fn test_draft_totals_and_payload() {
        let sale = sale();
        let draft = ReceiptDraft::from_sale("r-1", &sale, StoreLegalIdentity::default());
        assert_eq!(draft.total_cents, 3450);

        let payload = draft.to_payload().unwrap();
        assert!(payload.contains("\"saleId\":\"S1\""));
        assert!(!payload.contains("fiscalNumber"));
        assert_eq!(draft.to_sale().sale_id, "S1");
    }

    #[test]
    fn test_fiscal_document_gate() {
        let state = FiscalState {
            receipt_id: "r-1".into(),
            sale_id: "S1".into(),
            status: FiscalStatus::Processing,
            attempt_count: 0,
            last_error: None,
            result: None,
            fiscalized_at: None,
        };
        assert!(!state.allows_fiscal_document());

        let sent = FiscalState {
            status: FiscalStatus::Sent,
            ..state
        };
        assert!(sent.allows_fiscal_document());
    }
}
