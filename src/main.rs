//! # Noise Detection Backend - Main Application Entry Point
//!
//! Streaming voice-activity classification over WebSocket. Clients send 16kHz
//! PCM frames as base64 JSON envelopes and get back, per frame, whether the
//! frame is noise or speech.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **audio**: frame decoding, normalization and feature extraction
//! - **inference**: model families, recurrent state store, engine, fallback
//! - **pipeline**: per-session frame processing and the wire protocol
//! - **registry**: live session directory with TTL
//! - **websocket**: the streaming endpoint
//! - **handlers / health**: REST API for administration and debugging
//! - **middleware**: request logging and metrics
//! - **state / error**: shared state and error types

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod inference;
mod middleware;
mod pipeline;
mod registry;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::pipeline::SessionPipeline;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup:
/// 1. Load `.env`, set up tracing, load and validate configuration
/// 2. Build the session pipeline (the model itself loads on the first frame)
/// 3. Start the registry sweeper
/// 4. Serve HTTP and WebSocket routes until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting noise-detection-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        "Model family: {}, artifact: {}",
        config.model.family,
        config.model.hub_repo.as_deref().unwrap_or(&config.model.path)
    );

    let pipeline = Arc::new(SessionPipeline::from_config(&config)?);
    let app_state = AppState::new(config.clone(), pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    spawn_session_sweeper(app_state.clone());
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
            .route("/ws", web::get().to(websocket::audio_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}/reset", web::post().to(handlers::reset_session))
                    .route("/sessions/{id}", web::delete().to(handlers::close_session))
                    .route("/debug/classify", web::post().to(handlers::classify_frame))
                    .route("/debug/framewise", web::post().to(handlers::framewise_analysis)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; defaults to
/// `noise_detection_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "noise_detection_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically drop sessions whose registry entry expired.
///
/// The interval is read from the live config on every tick, so a runtime
/// config update changes the sweep period too.
fn spawn_session_sweeper(state: AppState) {
    tokio::spawn(async move {
        loop {
            let interval = state.get_config().sessions.sweep_interval_secs;
            tokio::time::sleep(Duration::from_secs(interval)).await;

            if SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
                break;
            }

            let expired = state.pipeline.sweep_expired().await;
            debug!("Session sweep finished, {} expired", expired);
        }
    });
}

/// Flip the shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
