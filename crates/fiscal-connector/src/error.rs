//! Error types for the connector services.
//!
//! Every protocol error reaches the agent as `{code, message}` with a fixed
//! HTTP status. Storage details are logged, never returned.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use fiscal_core::{CoreError, ValidationError};
use fiscal_db::DbError;

/// Connector service errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Missing, malformed, unknown or revoked device token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Too many pairing attempts from one client.
    #[error("Rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Malformed request body or parameter.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Pairing code unknown, consumed or expired.
    #[error("Pairing code is invalid, consumed or expired")]
    InvalidPairingCode,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl From<CoreError> for ConnectorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => ConnectorError::Validation(v),
            other => ConnectorError::Internal(other.to_string()),
        }
    }
}

impl ConnectorError {
    /// Stable machine-readable code sent to the agent.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::Unauthorized(_) => "unauthorized",
            ConnectorError::RateLimited { .. } => "rate_limited",
            ConnectorError::Validation(_) => "validation_failed",
            ConnectorError::InvalidPairingCode | ConnectorError::NotFound(_) => "not_found",
            ConnectorError::Database(_) | ConnectorError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ConnectorError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ConnectorError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ConnectorError::Validation(_) => StatusCode::BAD_REQUEST,
            ConnectorError::InvalidPairingCode | ConnectorError::NotFound(_) => StatusCode::NOT_FOUND,
            ConnectorError::Database(_) | ConnectorError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ConnectorError {
    fn into_response(self) -> Response {
        let message = match &self {
            ConnectorError::Database(_) | ConnectorError::Internal(_) => {
                error!(error = %self, "Request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            code: self.code().to_string(),
            message,
        };
        let mut response = (self.status(), Json(body)).into_response();

        if let ConnectorError::RateLimited { retry_after } = self {
            // Whole seconds, rounded up, at least 1
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let cases = [
            (ConnectorError::Unauthorized("x".into()), "unauthorized", 401),
            (
                ConnectorError::RateLimited {
                    retry_after: Duration::from_secs(6),
                },
                "rate_limited",
                429,
            ),
            (
                ConnectorError::Validation(ValidationError::Required {
                    field: "status".into(),
                }),
                "validation_failed",
                400,
            ),
            (ConnectorError::InvalidPairingCode, "not_found", 404),
            (ConnectorError::NotFound("receipt".into()), "not_found", 404),
            (ConnectorError::Internal("boom".into()), "internal", 500),
        ];

        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status().as_u16(), status);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ConnectorError::RateLimited {
            retry_after: Duration::from_millis(5_200),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "6");
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = ConnectorError::Database(DbError::QueryFailed("no such table".into()));
        assert_eq!(err.code(), "internal");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
