//! # Voice Call Bridge - Main Application Entry Point
//!
//! Bridges live phone calls to a realtime AI voice assistant. The telephony
//! provider streams each call's audio over a WebSocket; the bridge relays it
//! to the AI service and plays the assistant's replies back to the caller.
//! Operators can watch calls live, take over from the AI and hand back.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection and every call runs as a task on the runtime
//! - **Arc & RwLock**: shared registry, config and metrics across workers
//! - **Channels**: adapters, actors and the finalize listener talk over `mpsc`
//! - **Result<T, E>**: startup returns `anyhow::Result`, handlers return `BridgeError`
//!
//! ## Application Architecture:
//! - **audio**: frames, mu-law/PCM16 codec, bounded drop-oldest queues
//! - **call**: session state machine, transcript, registry, per-call bridge task
//! - **telephony**: media-stream protocol and adapter
//! - **realtime**: AI service protocol, connector with retry, adapter
//! - **observer**: dashboard fan-out
//! - **websocket**: actix actors for media, dashboard and operator connections
//! - **config / state / health / middleware / handlers**: the service around it

mod audio;
mod call;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod observer;
mod realtime;
mod state;
mod telephony;
mod transport;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::call::{EndReason, FinalizeEvent};
use crate::config::AppConfig;
use crate::realtime::WsConnector;
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `.env`, `config.toml` and environment variables
/// 2. **Sets up logging** with `tracing`
/// 3. **Creates shared state**: registry, realtime connector, metrics
/// 4. **Starts the finalize listener** that records every finished call
/// 5. **Serves** the WebSocket endpoints and the `/api/v1` control API
/// 6. **Shuts down gracefully**: live calls are asked to end before the server stops
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;

    info!("Starting voice-call-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.realtime.model,
        audio_format = %config.realtime.audio_format,
        max_calls = config.session.max_concurrent_calls,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );
    if config.realtime.api_key.is_none() {
        warn!("No realtime API key configured; the realtime service will refuse connections");
    }

    let connector = Arc::new(WsConnector::new(
        &config.realtime.url,
        &config.realtime.model,
        config.realtime.api_key.clone(),
    ));
    let (app_state, finalize_rx) = AppState::new(config.clone(), connector);
    tokio::spawn(record_finalized_calls(app_state.clone(), finalize_rx));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/media-stream", web::get().to(websocket::media_stream))
            .route("/dashboard-stream", web::get().to(websocket::dashboard_stream))
            .route("/human-audio/{call_id}", web::get().to(websocket::human_audio))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{call_id}", web::get().to(handlers::get_call))
                    .route("/calls/{call_id}/takeover", web::post().to(handlers::takeover_call))
                    .route("/calls/{call_id}/resume", web::post().to(handlers::resume_call))
                    .route("/calls/{call_id}/end", web::post().to(handlers::end_call)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    // Signals are handled below so live calls can be ended first.
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, ending live calls...");
            drain_calls(&app_state).await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize `tracing` with an `EnvFilter` (`RUST_LOG` overrides the default).
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_call_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Log every finished call as structured JSON and fold it into the metrics.
async fn record_finalized_calls(state: AppState, mut finalize_rx: mpsc::UnboundedReceiver<FinalizeEvent>) {
    while let Some(event) = finalize_rx.recv().await {
        state.record_finalize(&event);
        match serde_json::to_string(&event) {
            Ok(json) => info!(
                call_id = %event.call_id,
                reason = %event.end_reason,
                duration_secs = event.duration_secs,
                turns = event.transcript.len(),
                call = %json,
                "Call finalized"
            ),
            Err(err) => warn!(call_id = %event.call_id, error = %err, "Failed to serialize finalize event"),
        }
    }
}

/// Ask every call to end and give them their grace period to finalize.
async fn drain_calls(state: &AppState) {
    let ended = state.registry().end_all(EndReason::Shutdown);
    if ended == 0 {
        return;
    }

    let grace = Duration::from_millis(state.get_config().session.shutdown_grace_ms) + Duration::from_secs(1);
    let drained = tokio::time::timeout(grace, async {
        while !state.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = state.registry().len(), "Calls still registered at shutdown");
    }
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
