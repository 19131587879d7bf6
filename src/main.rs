//! # callstream-bridge - Main Application Entry Point
//!
//! Runs two listeners side by side:
//! - the **media socket** (`media.host:media.port`), where the telephony side
//!   opens WebSocket media streams
//! - the **admin HTTP API** (`server.host:server.port`), for health, metrics,
//!   configuration and per-stream control
//!
//! ## Startup:
//! 1. Load `.env`, set up tracing, load and validate configuration
//! 2. Build the media provider and the session manager
//! 3. Start the media socket, the bridge driver and the session reaper
//! 4. Serve the admin API until SIGINT/SIGTERM
//!
//! ## Shutdown:
//! One `watch` channel fans the signal out to every background task. The
//! admin server stops gracefully, then the provider closes every live stream
//! exactly once.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use callstream_bridge::bridge::{self, Bridge};
use callstream_bridge::config::AppConfig;
use callstream_bridge::state::AppState;
use callstream_bridge::{handlers, health, middleware, server};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often finished call sessions are swept.
const SESSION_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// How long a finished call stays visible in the admin API.
const SESSION_RETENTION_MINUTES: i64 = 30;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting callstream-bridge v{}", env!("CARGO_PKG_VERSION"));
    match config.to_toml() {
        Ok(rendered) => debug!("Effective configuration:\n{}", rendered),
        Err(e) => warn!("Could not render configuration: {}", e),
    }

    let app_state = AppState::from_config(config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    setup_signal_handlers(shutdown_tx.clone());

    // Media socket and bridge driver
    let media_listener = server::bind(&config.media).await?;
    let media_task = tokio::spawn(server::serve(
        media_listener,
        app_state.provider.clone(),
        config.performance.max_concurrent_streams,
        shutdown_rx.clone(),
    ));

    let bridge = Bridge::new(&app_state);
    bridge.install_dtmf_recorder();
    let incoming = bridge.listen(&config.media.path)?;
    let bridge_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { bridge.serve(incoming, shutdown).await })
    };

    let reaper_task = tokio::spawn(bridge::reap_sessions(
        app_state.sessions.clone(),
        SESSION_REAP_INTERVAL,
        chrono::Duration::minutes(SESSION_RETENTION_MINUTES),
        shutdown_rx.clone(),
    ));

    // Admin HTTP API
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting admin HTTP server on {}", bind_addr);

    let http_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/streams", web::get().to(handlers::list_streams))
                    .route("/streams/{stream_sid}", web::get().to(handlers::get_stream))
                    .route("/streams/{stream_sid}", web::delete().to(handlers::close_stream))
                    .route("/streams/{stream_sid}/mark", web::post().to(handlers::send_mark))
                    .route("/streams/{stream_sid}/clear", web::post().to(handlers::clear_stream)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let mut shutdown = shutdown_rx.clone();
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Admin server error: {}", e),
                Err(e) => error!("Admin server task error: {}", e),
                Ok(Ok(())) => {}
            }
            shutdown_tx.send_replace(true);
        }
        _ = shutdown.wait_for(|stop| *stop) => {
            info!("Shutdown signal received, stopping servers...");
            server_handle.stop(true).await;
        }
    }

    if app_state.provider.close().await {
        info!("Closed all media streams");
    }
    for (name, task) in [("media socket", media_task), ("bridge", bridge_task), ("session reaper", reaper_task)] {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to stdout. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callstream_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip the shutdown channel on SIGTERM or SIGINT (Ctrl+C).
fn setup_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("Failed to install signal handlers: {}", e);
            return;
        }
        shutdown.send_replace(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
