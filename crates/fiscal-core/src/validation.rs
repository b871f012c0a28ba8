//! # Validation Module
//!
//! Input validation for everything a connector agent sends.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: HTTP extractor (axum Json / Query)                           │
//! │  └── Type validation (deserialization)                                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Status must be SENT or FAILED                                     │
//! │  ├── SENT needs an identifier from the device                          │
//! │  └── Field length limits                                               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── Conditional updates on current status                             │
//! │  └── Partial UNIQUE index: one open attempt per sale                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A rejected push never touches the receipt.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::ValidationError;
use crate::types::{FiscalResult, FiscalStatus};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted identifier (receipt ids, fiscal numbers, ...).
pub const MAX_FIELD_LEN: usize = 128;

/// Longest accepted QR payload.
pub const MAX_QR_LEN: usize = 2048;

/// Longest accepted error message; longer messages are truncated, not rejected.
pub const MAX_ERROR_LEN: usize = 1024;

/// Pairing code alphabet: no 0/O, 1/I/L.
pub const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Length of a pairing code.
pub const PAIRING_CODE_LEN: usize = 8;

/// Default `last_error` when the agent reports FAILED without a message.
pub const UNSPECIFIED_DEVICE_ERROR: &str = "connector reported failure";

// =============================================================================
// Result Push
// =============================================================================

/// Body of `POST /connector/result` exactly as the agent sends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ResultPush {
    pub receipt_id: String,
    /// "SENT" or "FAILED"; kept as text so unknown values become a
    /// validation error rather than a deserialization failure.
    pub status: String,
    pub provider_receipt_id: Option<String>,
    pub fiscal_number: Option<String>,
    pub qr: Option<String>,
    pub error_message: Option<String>,
    pub kkm_factory_number: Option<String>,
    pub kkm_registration_number: Option<String>,
    pub upfd_or_fiscal_memory: Option<String>,
}

/// Terminal outcome carried by a valid push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Sent(FiscalResult),
    Failed { error: String },
}

impl PushOutcome {
    pub fn status(&self) -> FiscalStatus {
        match self {
            PushOutcome::Sent(_) => FiscalStatus::Sent,
            PushOutcome::Failed { .. } => FiscalStatus::Failed,
        }
    }
}

/// A push that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPush {
    pub receipt_id: String,
    pub outcome: PushOutcome,
}

impl ResultPush {
    /// Validates the report and converts it into a terminal outcome.
    ///
    /// ## Rules
    /// - `receiptId` is required
    /// - `status` must be SENT or FAILED (case-insensitive)
    /// - SENT needs `providerReceiptId` or `fiscalNumber`
    /// - identifiers at most [`MAX_FIELD_LEN`], QR at most [`MAX_QR_LEN`]
    pub fn validate(self) -> ValidationResult<ValidatedPush> {
        let receipt_id = required("receiptId", &self.receipt_id)?;
        bounded("receiptId", &receipt_id, MAX_FIELD_LEN)?;

        let status = self.status.trim().to_ascii_uppercase();
        let outcome = match status.as_str() {
            "SENT" => {
                let result = FiscalResult {
                    provider_receipt_id: optional("providerReceiptId", self.provider_receipt_id, MAX_FIELD_LEN)?,
                    fiscal_number: optional("fiscalNumber", self.fiscal_number, MAX_FIELD_LEN)?,
                    kkm_factory_number: optional("kkmFactoryNumber", self.kkm_factory_number, MAX_FIELD_LEN)?,
                    kkm_registration_number: optional(
                        "kkmRegistrationNumber",
                        self.kkm_registration_number,
                        MAX_FIELD_LEN,
                    )?,
                    upfd_or_fiscal_memory: optional(
                        "upfdOrFiscalMemory",
                        self.upfd_or_fiscal_memory,
                        MAX_FIELD_LEN,
                    )?,
                    qr_payload: optional("qr", self.qr, MAX_QR_LEN)?,
                };

                if result.provider_receipt_id.is_none() && result.fiscal_number.is_none() {
                    return Err(ValidationError::Required {
                        field: "providerReceiptId or fiscalNumber".to_string(),
                    });
                }

                PushOutcome::Sent(result)
            }
            "FAILED" => {
                let error = self
                    .error_message
                    .map(|msg| msg.trim().to_string())
                    .filter(|msg| !msg.is_empty())
                    .map(|msg| truncate(&msg, MAX_ERROR_LEN))
                    .unwrap_or_else(|| UNSPECIFIED_DEVICE_ERROR.to_string());
                PushOutcome::Failed { error }
            }
            _ => {
                return Err(ValidationError::NotAllowed {
                    field: "status".to_string(),
                    allowed: vec!["SENT".to_string(), "FAILED".to_string()],
                })
            }
        };

        Ok(ValidatedPush { receipt_id, outcome })
    }
}

// =============================================================================
// Pairing Validators
// =============================================================================

/// Normalizes a human-typed pairing code (trim, uppercase, drop dashes/spaces).
///
/// ## Example
/// ```rust
/// use fiscal_core::validation::normalize_pairing_code;
///
/// assert_eq!(normalize_pairing_code(" abcd-2345 ").unwrap(), "ABCD2345");
/// assert!(normalize_pairing_code("").is_err());
/// ```
pub fn normalize_pairing_code(code: &str) -> ValidationResult<String> {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.is_empty() {
        return Err(ValidationError::Required {
            field: "code".to_string(),
        });
    }

    if normalized.len() > 32 {
        return Err(ValidationError::TooLong {
            field: "code".to_string(),
            max: 32,
        });
    }

    Ok(normalized)
}

/// Generates a fresh pairing code from [`PAIRING_CODE_ALPHABET`].
///
/// Randomness comes from a v4 UUID.
pub fn generate_pairing_code() -> String {
    let random = uuid::Uuid::new_v4().as_u128();
    let base = PAIRING_CODE_ALPHABET.len() as u128;
    (0..PAIRING_CODE_LEN)
        .scan(random, |state, _| {
            let idx = (*state % base) as usize;
            *state /= base;
            Some(PAIRING_CODE_ALPHABET[idx] as char)
        })
        .collect()
}

/// Validates the agent's self-reported device name.
pub fn validate_device_name(name: &str) -> ValidationResult<String> {
    let name = required("deviceName", name)?;
    bounded("deviceName", &name, 100)?;
    Ok(name)
}

/// Clamps a requested pull size into `1..=max`; missing or zero means `default`.
pub fn clamp_pull_limit(requested: Option<u32>, default: u32, max: u32) -> u32 {
    match requested {
        None | Some(0) => default.min(max).max(1),
        Some(n) => n.min(max).max(1),
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn required(field: &str, value: &str) -> ValidationResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(value.to_string())
}

fn bounded(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }
    Ok(())
}

fn optional(field: &str, value: Option<String>, max: usize) -> ValidationResult<Option<String>> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => {
            bounded(field, &v, max)?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Bounds an error message for `last_error` storage.
pub fn bound_error_message(message: &str) -> String {
    truncate(message.trim(), MAX_ERROR_LEN)
}

// =============================================================================
// Unit Tests
// =============================================================================
