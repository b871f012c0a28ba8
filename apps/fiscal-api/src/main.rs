//! # Fiscal API
//!
//! HTTP server for connector agents.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fiscal API Server                                │
//! │                                                                         │
//! │  Agent ───► HTTP (8080) ───► pair / queue / result ───► SQLite          │
//! │                                                           ▲             │
//! │             LeaseReclaimer + RetryScheduler sweeps ───────┘             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fiscal_connector::http::{self, AppState};
use fiscal_connector::{
    AdapterRegistry, ConnectorConfig, ConnectorQueue, DeviceAuthenticator, DispatchSettings,
    FiscalDispatchRouter, InMemoryMetrics, IpRateLimiter, LeaseReclaimer, PairingService,
    QueueSettings, RetryScheduler, TokenHasher,
};
use fiscal_core::RetryPolicy;
use fiscal_db::{Database, DbConfig};

/// Idle rate-limit buckets older than this are dropped.
const RATE_LIMIT_IDLE: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .with_target(true)
        .init();

    info!("Starting fiscal API server...");

    let config = ConnectorConfig::load().context("invalid configuration")?;
    info!(
        port = config.http_port,
        database = %config.database_path,
        lease_secs = config.lease_secs,
        max_attempts = config.max_attempts,
        "Configuration loaded"
    );

    let db = Database::new(DbConfig::new(&config.database_path))
        .await
        .context("failed to open database")?;
    info!("Database ready");

    // Shared services
    let metrics = Arc::new(InMemoryMetrics::new());
    let hasher = TokenHasher::from_config(&config)?;
    let limiter = Arc::new(IpRateLimiter::per_minute(config.pairing_attempts_per_minute));
    let registry = Arc::new(AdapterRegistry::new());
    let policy = RetryPolicy::new(config.max_attempts);

    let queue = ConnectorQueue::new(
        db.clone(),
        DeviceAuthenticator::new(db.clone(), hasher.clone()),
        metrics.clone(),
        QueueSettings::from(&config),
    );
    let pairing = PairingService::new(
        db.clone(),
        hasher,
        limiter.clone(),
        config.pairing_code_ttl(),
    );
    let dispatch = FiscalDispatchRouter::new(
        db.clone(),
        registry.clone(),
        metrics.clone(),
        DispatchSettings::from(&config),
    );
    let scheduler = RetryScheduler::new(
        db.clone(),
        dispatch,
        metrics.clone(),
        policy,
        config.lease(),
    );

    // Background sweeps
    let (reclaimer, reclaimer_handle) =
        LeaseReclaimer::new(db.clone(), metrics.clone(), policy, config.reclaim_interval());
    let reclaimer_task = tokio::spawn(reclaimer.with_scheduler(scheduler).run());

    let cleanup_limiter = limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMIT_IDLE);
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup(RATE_LIMIT_IDLE);
        }
    });

    // HTTP
    let state = Arc::new(AppState {
        db: db.clone(),
        queue,
        pairing,
        registry,
        metrics,
    });
    let app = http::router(state);

    let addr = config.listen_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "Serving connector protocol");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Err(e) = reclaimer_handle.shutdown().await {
        warn!(error = %e, "Reclaimer was not running");
    }
    if let Err(e) = reclaimer_task.await {
        error!(error = %e, "Reclaimer task panicked");
    }
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
