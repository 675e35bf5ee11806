//! Calls Service
//!
//! Cluster-aware call-session coordination node.
//!
//! # Servers
//!
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8090)
//! - WebSocket server for client signaling (default: 0.0.0.0:8091)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start health HTTP server (liveness, readiness, metrics)
//! 4. Activate the calls service (store, bot identity, cleanup, media backend,
//!    relay, cluster events, presence)
//! 5. Start the client WebSocket server
//! 6. Wait for shutdown signal, then deactivate

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use calls_service::config::Config;
use calls_service::observability::{health_router, init_metrics_recorder, HealthState};
use calls_service::service::{CallsService, ServiceDeps};
use calls_service::transport::TransportHub;
use calls_service::ws::{ws_router, WsState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calls_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Calls Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        single_handler = config.single_handler,
        health_bind_address = %config.health_bind_address,
        ws_bind_address = %config.ws_bind_address,
        rtcd_configured = config.rtcd.is_some(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Health server is up before activation so probes see "not ready"
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let hub = Arc::new(TransportHub::new(config.session_queue_capacity));
    let deps = ServiceDeps::new(Arc::clone(&hub) as _, Arc::clone(&health_state));

    let service = match CallsService::activate(&config, deps).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Calls service activation failed");
            shutdown_token.cancel();
            let _ = health_task.await;
            return Err(e.into());
        }
    };

    let ws_addr: SocketAddr = config.ws_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.ws_bind_address, "Invalid WebSocket bind address");
        format!("Invalid WebSocket bind address: {e}")
    })?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await.map_err(|e| {
        error!(error = %e, addr = %ws_addr, "Failed to bind WebSocket server");
        format!("Failed to bind WebSocket server to {ws_addr}: {e}")
    })?;

    let ws_app = ws_router(WsState {
        hub: Arc::clone(&hub),
        relay: Arc::clone(service.relay()),
    });
    let ws_shutdown_token = shutdown_token.child_token();
    let ws_task = tokio::spawn(async move {
        info!(addr = %ws_addr, "WebSocket server starting");
        let server = axum::serve(ws_listener, ws_app).with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    info!(
        node_id = %service.node_id(),
        backend = service.mode().as_label(),
        "Calls Service running - press Ctrl+C to shutdown"
    );
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    service.deactivate().await;

    shutdown_token.cancel();
    let _ = tokio::join!(ws_task, health_task);

    info!("Calls Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
