//! # Voicebot Relay - Main Application Entry Point
//!
//! This is the main entry point for the voicebot-relay server. It sits between
//! voice clients (browsers, Spectacles lenses) and a hosted voice-AI service:
//! clients ask for a session over HTTP, then stream audio over a WebSocket that
//! the relay pairs with the service's own WebSocket.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every connection is an async task or actor
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **static**: Global shutdown flag that lives for the entire program
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Shared application state and metrics
//! - **session**: Session registry, provisioning and the upstream connector
//! - **relay**: The per-client WebSocket actor and the bidirectional frame pump
//! - **audio**: Capture-block preprocessing (downmix, resample, PCM16)
//! - **lens**: Snap Lens AR hub with the fire-safety training flow
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request id logging and per-route metrics
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Error categories and HTTP error responses

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod lens;
mod middleware;
mod relay;
mod session;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** with `RUST_LOG` filtering
/// 3. **Creates shared application state** (registry, provider client, lens hub)
/// 4. **Starts the session sweeper** that drops sessions nobody attached to
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voicebot-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.upstream.api_key.is_none() {
        info!("No upstream API key configured; /chat/start will answer with a configuration error");
    }

    let app_state = AppState::new(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    spawn_session_sweeper(
        app_state.clone(),
        Duration::from_secs(config.relay.sweep_interval_secs),
        config.relay.session_ttl_secs,
    );

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
            // Middleware runs in reverse order of registration for requests
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/", web::get().to(health::root))
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .service(
                web::scope("/chat")
                    .app_data(handlers::json_config())
                    .route("/start", web::post().to(handlers::start_chat))
                    .route("/text", web::post().to(handlers::text_chat))
                    .route("/ws/{session_id}", web::get().to(relay::relay_websocket)),
            )
            // Older clients connect without the /chat prefix
            .route("/ws/{session_id}", web::get().to(relay::relay_websocket))
            .route("/snap-lens", web::get().to(lens::lens_websocket))
            .route("/status", web::get().to(handlers::status))
            .route("/clear-connections", web::post().to(handlers::clear_connections))
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

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voicebot_relay=trace")
/// - If not set, defaults to "voicebot_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicebot_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Periodically drop sessions that were started but never attached to a
/// client connection within `ttl_secs`.
fn spawn_session_sweeper(state: AppState, every: Duration, ttl_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
                break;
            }

            let swept = state.registry.sweep_unattached(ttl_secs);
            if swept > 0 {
                info!(swept, remaining = state.registry.session_count(), "Swept stale sessions");
            } else {
                debug!(sessions = state.registry.session_count(), "Session sweep found nothing stale");
            }
        }
    });
}

/// Set up signal handlers for graceful shutdown.
///
/// Listens for SIGTERM and SIGINT, then sets the global shutdown flag.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
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

/// Wait for the shutdown signal to be set, polling every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
