pub mod api;
pub mod archive;
pub mod auth;
pub mod client;
pub mod config;
pub mod deploy;
pub mod error;
pub mod path;
pub mod upload;

use api::AppState;
use axum::Router;
use config::Config;
use path::PathContext;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for logging
/// Uses journald when running as a service (no terminal), fmt when running interactively
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fde=info,tower_http=warn".into());

    if std::io::stdout().is_terminal() {
        // Running in a terminal, use formatted output
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        // Running as a service, use journald
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_journald::layer().expect("Failed to connect to journald"))
            .init();
    }
}

/// Run the deploy server
pub async fn run_service(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    init_tracing();

    // Log version early
    tracing::info!("fde-server version {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });

    let config_dir = config_path
        .map(|p| std::path::Path::new(p).parent().map(|p| p.to_path_buf()).unwrap_or_default())
        .unwrap_or_default();
    let path_ctx = PathContext::from_env(config_dir)?;

    tracing::info!(container = path_ctx.is_container, "Starting server");

    // Chunk uploads live under a scratch root; completed files land wherever
    // each environment's uploadPath resolves to.
    let upload_root = std::env::temp_dir().join("fde-chunks");
    let upload_store = upload::UploadStore::new(upload_root);
    upload::spawn_sweeper(upload_store.clone());

    let deploy_store = deploy::DeployStore::new();

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        path_ctx,
        upload_store,
        deploy_store,
        started_at: Instant::now(),
    });

    // Build API routes
    let app = Router::new()
        .merge(api::build_router(state.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
