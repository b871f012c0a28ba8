//! # HTTP Surface
//!
//! Device-facing endpoints of the connector protocol.
//!
//! ```text
//! POST /connector/pair     {code, deviceName}        → {token, device}
//! GET  /connector/queue    ?limit=N   (Bearer)       → {items}
//! POST /connector/result   {receiptId, status, ...}  → {ok, applied}
//! GET  /health                                       → liveness report
//! ```
//!
//! The server must be started with
//! `into_make_service_with_connect_info::<SocketAddr>()`; pairing is rate
//! limited by client address.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use fiscal_core::{FiscalStatus, QueueItem, ResultPush, ValidationError};
use fiscal_db::Database;

use crate::adapter::{AdapterHealth, AdapterRegistry};
use crate::auth::extract_bearer_token;
use crate::error::{ConnectorError, ConnectorResult};
use crate::metrics::{InMemoryMetrics, MetricsSnapshot};
use crate::pairing::{PairRequest, PairingResult, PairingService};
use crate::queue::{ConnectorQueue, PushAck};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: ConnectorQueue,
    pub pairing: PairingService,
    pub registry: Arc<AdapterRegistry>,
    pub metrics: Arc<InMemoryMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct PullParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullResponse {
    pub items: Vec<QueueItem>,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub database: bool,
    pub adapters: Vec<AdapterHealth>,
    pub metrics: MetricsSnapshot,
    pub receipts: Vec<StatusCount>,
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: FiscalStatus,
    pub count: i64,
}

/// Builds the router with request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/connector/pair", post(pair_handler))
        .route("/connector/queue", get(pull_handler))
        .route("/connector/result", post(push_handler))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Pulls the bearer token out of the `Authorization` header.
fn bearer(headers: &HeaderMap) -> ConnectorResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| ConnectorError::Unauthorized("missing bearer token".to_string()))
}

fn malformed(reason: String) -> ConnectorError {
    ConnectorError::Validation(ValidationError::InvalidFormat {
        field: "request".to_string(),
        reason,
    })
}

async fn pair_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> ConnectorResult<Json<PairingResult>> {
    let Json(request) = body.map_err(|e| malformed(e.body_text()))?;
    let paired = state
        .pairing
        .pair(&request.code, &request.device_name, addr.ip())
        .await?;
    Ok(Json(paired))
}

async fn pull_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Result<Query<PullParams>, QueryRejection>,
) -> ConnectorResult<Json<PullResponse>> {
    let token = bearer(&headers)?;
    let Query(params) = params.map_err(|e| malformed(e.body_text()))?;
    let items = state.queue.pull(token, params.limit).await?;
    Ok(Json(PullResponse { items }))
}

async fn push_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ResultPush>, JsonRejection>,
) -> ConnectorResult<Json<PushAck>> {
    let token = bearer(&headers)?;
    let Json(push) = body.map_err(|e| malformed(e.body_text()))?;
    let ack = state.queue.push(token, push).await?;
    Ok(Json(ack))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = state.db.health_check().await;
    let receipts = match state.db.receipts().status_counts().await {
        Ok(counts) => counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Status counts unavailable");
            Vec::new()
        }
    };

    let report = HealthReport {
        status: if database { "ok" } else { "degraded" },
        database,
        adapters: state.registry.health_report().await,
        metrics: state.metrics.snapshot(),
        receipts,
    };

    let code = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DeviceAuthenticator;
    use crate::queue::QueueSettings;
    use crate::rate_limit::IpRateLimiter;
    use crate::test_support::{cheap_hasher, enqueue, setup, CONNECTOR_STORE, ORGANIZATION};
    use axum::body::{to_bytes, Body};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app(db: &Database) -> (Router, Arc<AppState>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let hasher = cheap_hasher();
        let queue = ConnectorQueue::new(
            db.clone(),
            DeviceAuthenticator::new(db.clone(), hasher.clone()),
            metrics.clone(),
            QueueSettings {
                lease: chrono::Duration::seconds(120),
                default_limit: 10,
                max_limit: 50,
                max_attempts: 5,
            },
        );
        let pairing = PairingService::new(
            db.clone(),
            hasher,
            Arc::new(IpRateLimiter::per_minute(10)),
            chrono::Duration::minutes(10),
        );
        let state = Arc::new(AppState {
            db: db.clone(),
            queue,
            pairing,
            registry: Arc::new(AdapterRegistry::new()),
            metrics,
        });
        let router = router(state.clone()).layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 7], 51000))));
        (router, state)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_pair_pull_push_flow() {
        let db = setup().await;
        let (router, state) = app(&db).await;
        let code = state
            .pairing
            .issue_code(ORGANIZATION, CONNECTOR_STORE, None)
            .await
            .unwrap();
        let receipt_id = enqueue(&db, "S1").await;

        let (status, paired) = send(
            &router,
            json_request(
                "POST",
                "/connector/pair",
                None,
                json!({"code": code.code, "deviceName": "till-1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = paired["token"].as_str().unwrap().to_string();
        assert_eq!(paired["device"]["storeId"], CONNECTOR_STORE);

        let (status, pulled) = send(&router, get_request("/connector/queue?limit=5", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        let items = pulled["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["receiptId"], receipt_id.as_str());

        let push = json!({
            "receiptId": receipt_id,
            "status": "SENT",
            "fiscalNumber": "FN-1",
            "qr": "https://ofd.example/q?fn=FN-1",
        });
        let (status, ack) = send(&router, json_request("POST", "/connector/result", Some(&token), push.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack, json!({"ok": true, "applied": true}));

        // Duplicate delivery is acknowledged without effect
        let (status, ack) = send(&router, json_request("POST", "/connector/result", Some(&token), push)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack, json!({"ok": true, "applied": false}));

        let (_, health) = send(&router, get_request("/health", None)).await;
        assert_eq!(health["metrics"]["sent"], 1);
    }

    #[tokio::test]
    async fn test_queue_requires_bearer_token() {
        let db = setup().await;
        let (router, _) = app(&db).await;

        let (status, body) = send(&router, get_request("/connector/queue", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, _) = send(&router, get_request("/connector/queue", Some("dev.bogus"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_pairing_code_is_not_found() {
        let db = setup().await;
        let (router, _) = app(&db).await;

        let (status, body) = send(
            &router,
            json_request(
                "POST",
                "/connector/pair",
                None,
                json!({"code": "ABCD2345", "deviceName": "till-1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_overlong_pairing_code_is_not_found() {
        let db = setup().await;
        let (router, _) = app(&db).await;

        let (status, body) = send(
            &router,
            json_request(
                "POST",
                "/connector/pair",
                None,
                json!({"code": "K".repeat(40), "deviceName": "till-1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation_error() {
        let db = setup().await;
        let (router, _) = app(&db).await;

        let request = Request::builder()
            .method("POST")
            .uri("/connector/pair")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_failed");
    }

    #[tokio::test]
    async fn test_health_reports_database() {
        let db = setup().await;
        let (router, _) = app(&db).await;
        enqueue(&db, "S1").await;

        let (status, body) = send(&router, get_request("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], true);
        assert_eq!(body["receipts"][0]["status"], "QUEUED");
        assert_eq!(body["receipts"][0]["count"], 1);
    }
}
