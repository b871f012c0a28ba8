//! # Pairing Service
//!
//! Exchanges a short human-typed code for a long-lived device token.
//!
//! ```text
//! Back office                  Agent                         Server
//!     │ issue_code(org, store)   │                              │
//!     │──────────────────────────┼─────────────────────────────►│ pairing_codes
//!     │◄──────── "K7QX-3M9P" ────┼──────────────────────────────│ (TTL 10 min)
//!     │   (shown to installer)   │ POST /connector/pair         │
//!     │                          │─────────────────────────────►│ rate limit (IP)
//!     │                          │                              │ consume code +
//!     │                          │◄──── {token, device} ────────│ upsert device
//! ```
//!
//! Pairing is not retryable: a code is consumed even if the response never
//! reaches the agent, which then needs a new code.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use fiscal_core::validation::{generate_pairing_code, normalize_pairing_code, validate_device_name};
use fiscal_core::{ConnectorDevice, PairingCode};
use fiscal_db::{Database, DbError, NewDevice};

use crate::auth::{DeviceToken, TokenHasher};
use crate::error::{ConnectorError, ConnectorResult};
use crate::rate_limit::PairingRateLimiter;

/// Fresh code collisions tolerated before giving up.
const MAX_CODE_COLLISIONS: usize = 5;

/// Body of `POST /connector/pair`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub code: String,
    pub device_name: String,
}

/// Successful pairing. `token` is never retrievable again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResult {
    pub token: String,
    pub device: ConnectorDevice,
}

/// Pairing and device administration.
#[derive(Clone)]
pub struct PairingService {
    db: Database,
    hasher: TokenHasher,
    limiter: Arc<dyn PairingRateLimiter>,
    code_ttl: chrono::Duration,
}

impl PairingService {
    pub fn new(
        db: Database,
        hasher: TokenHasher,
        limiter: Arc<dyn PairingRateLimiter>,
        code_ttl: chrono::Duration,
    ) -> Self {
        PairingService {
            db,
            hasher,
            limiter,
            code_ttl,
        }
    }

    /// Redeems `code` for a device token.
    pub async fn pair(
        &self,
        code: &str,
        device_name: &str,
        client_ip: IpAddr,
    ) -> ConnectorResult<PairingResult> {
        self.limiter
            .check(client_ip)
            .map_err(|retry_after| ConnectorError::RateLimited { retry_after })?;

        let code = normalize_pairing_code(code).map_err(|e| {
            warn!(client_ip = %client_ip, error = %e, "Pairing with malformed code");
            ConnectorError::InvalidPairingCode
        })?;
        let device_name = validate_device_name(device_name)?;

        // Hash before opening the transaction; the secret does not depend on
        // which device row ends up owning it.
        let candidate_id = Uuid::new_v4().to_string();
        let secret = DeviceToken::generate(&candidate_id).secret;
        let token_hash = self.hasher.hash(&secret)?;

        let device = self
            .db
            .pairing_codes()
            .redeem(
                &code,
                Utc::now(),
                NewDevice {
                    id: candidate_id,
                    device_name,
                    token_hash,
                },
            )
            .await?
            .ok_or_else(|| {
                warn!(client_ip = %client_ip, "Pairing with unusable code");
                ConnectorError::InvalidPairingCode
            })?;

        let token = DeviceToken {
            device_id: device.id.clone(),
            secret,
        };

        info!(
            device_id = %device.id,
            store_id = %device.store_id,
            client_ip = %client_ip,
            "Connector paired"
        );

        Ok(PairingResult {
            token: token.expose(),
            device,
        })
    }

    /// Issues a new pairing code for a store. `ttl` defaults to the
    /// configured lifetime.
    pub async fn issue_code(
        &self,
        organization_id: &str,
        store_id: &str,
        ttl: Option<chrono::Duration>,
    ) -> ConnectorResult<PairingCode> {
        let expires_at = Utc::now() + ttl.unwrap_or(self.code_ttl);

        for _ in 0..MAX_CODE_COLLISIONS {
            let code = generate_pairing_code();
            match self
                .db
                .pairing_codes()
                .insert(&code, organization_id, store_id, expires_at)
                .await
            {
                Ok(issued) => {
                    info!(store_id = %store_id, expires_at = %expires_at, "Pairing code issued");
                    return Ok(issued);
                }
                Err(DbError::UniqueViolation { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ConnectorError::Internal(
            "could not generate a unique pairing code".to_string(),
        ))
    }

    /// Administrative revocation. The device's token stops working
    /// immediately; its leased receipts expire back to the queue.
    pub async fn revoke_device(&self, device_id: &str) -> ConnectorResult<ConnectorDevice> {
        let devices = self.db.devices();
        devices.revoke(device_id).await?;

        devices
            .get_by_id(device_id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("device {}", device_id)))
    }
}
