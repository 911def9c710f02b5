//! App Worker
//!
//! One worker process of a clustered real-time server.
//!
//! # Servers
//!
//! - WebSocket and HTTP transport for clients (default: 0.0.0.0:3000)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the cluster bus (Redis when `REDIS_URL` is set, in-process otherwise)
//! 4. Start the worker context
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start the client transport
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use app_worker::bus::{LocalBus, RedisBus, WorkerBus};
use app_worker::config::Config;
use app_worker::controller::{Controller, ControllerConfig, ControllerRegistry, RequestContext};
use app_worker::databox::DataboxRegistry;
use app_worker::errors::HandlerError;
use app_worker::observability::{health_router, init_metrics_recorder, HealthState};
use app_worker::token::{InMemoryTokenInfoStore, TokenInfoStore};
use app_worker::transport::transport_router;
use app_worker::worker::{Worker, WorkerApp};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Answers `"pong"` and echoes its input.
struct Ping;

#[async_trait]
impl Controller for Ping {
    async fn handle(&self, ctx: &RequestContext, input: Value) -> Result<Value, HandlerError> {
        Ok(json!({"pong": input, "group": ctx.auth.group()}))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "app_worker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting App Worker");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        worker_id = %config.worker_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        default_group = %config.default_group,
        auth_groups = config.auth_groups.len(),
        extra_secure_auth = config.extra_secure_auth,
        use_token_state_check = config.use_token_state_check,
        cluster_bus = if config.redis_url.is_some() { "redis" } else { "local" },
        "Configuration loaded successfully"
    );

    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let bus: Arc<dyn WorkerBus> = match config.redis_url() {
        Some(url) => {
            info!("Connecting to Redis...");
            let bus = RedisBus::connect(url).await.map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
            info!("Redis connection established");
            Arc::new(bus)
        }
        None => {
            info!("No REDIS_URL set, using the in-process bus");
            Arc::new(LocalBus::new())
        }
    };
    let store: Arc<dyn TokenInfoStore> = Arc::new(InMemoryTokenInfoStore::new());

    let app = WorkerApp {
        controllers: ControllerRegistry::builder()
            .controller("ping", ControllerConfig::default(), Arc::new(Ping))
            .build(),
        databoxes: DataboxRegistry::new(),
    };

    let shutdown_token = CancellationToken::new();
    let worker = Worker::start(&config, app, bus, store, shutdown_token.child_token())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start worker");
            e
        })?;

    // Health server must bind before the worker reports ready.
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let transport_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;
    let transport_listener = tokio::net::TcpListener::bind(transport_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %transport_addr, "Failed to bind transport");
            format!("Failed to bind transport to {transport_addr}: {e}")
        })?;

    let transport_shutdown_token = shutdown_token.child_token();
    let transport_app = transport_router(Arc::clone(&worker));
    tokio::spawn(async move {
        info!(addr = %transport_addr, "Transport starting");
        let server = axum::serve(transport_listener, transport_app).with_graceful_shutdown(
            async move {
                transport_shutdown_token.cancelled().await;
                info!("Transport shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Transport failed");
        }
    });

    health_state.set_ready();
    info!("App Worker running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    // Closing the sockets ends their WebSocket loops before the listeners stop.
    worker.shutdown();
    shutdown_token.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("App Worker shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the worker
/// cannot shut down gracefully.
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
