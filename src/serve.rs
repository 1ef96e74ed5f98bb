//! Server startup and lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::{create_router, AppState};
use crate::config::{logging, LogFormat, ProxyConfig};
use crate::engine::{Autosaver, Engine, HistoryAggregator, ResetScheduler};

/// Arguments for the serve entrypoint; CLI values override the file.
pub struct ServeArgs {
    pub config: PathBuf,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

/// Load configuration with CLI overrides applied.
pub fn load_config_with_overrides(args: &ServeArgs) -> Result<ProxyConfig, Box<dyn std::error::Error>> {
    let mut config = ProxyConfig::load_or_create(&args.config)?;

    if let Some(ref host) = args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ref log_level) = args.log_level {
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

/// Initialize tracing based on configuration.
pub fn init_tracing(
    config: &crate::config::LoggingConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = logging::build_filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
    }

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    cancel_token.cancel();
}

/// Main serve entrypoint.
pub async fn run(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load and merge configuration, then validate before anything starts
    let config = load_config_with_overrides(&args)?;
    config.validate()?;

    // 2. Initialize tracing
    init_tracing(&config.logging)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting turnstile");

    // 3. Build the engine (loads and reconciles the usage snapshot)
    let engine = Arc::new(Engine::from_config(&config)?);
    tracing::info!(
        keys = config.priority_keys.len() + config.secondary_keys.len(),
        models = config.models.len(),
        "Key pool loaded"
    );

    // 4. Build router and application state
    let state = Arc::new(AppState::new(Arc::clone(&engine), Arc::new(config.clone())));
    let app = create_router(Arc::clone(&state));
    let cancel_token = state.shutdown.clone();

    // 5. Start background tasks
    let autosave_handle = Autosaver::new(Arc::clone(&engine)).start(cancel_token.clone());
    let reset_handle =
        ResetScheduler::new(Arc::clone(&engine), args.config.clone()).start(cancel_token.clone());
    let history_handle = HistoryAggregator::new(Arc::clone(&engine)).start(cancel_token.clone());

    // 6. Bind and serve
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Turnstile listening");
    tracing::info!(addr = %addr, "Dashboard: http://{}/status", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
        .await?;

    // 7. Cleanup: wait for background tasks, then flush the ledger once
    for (name, handle) in [
        ("autosave", autosave_handle),
        ("reset scheduler", reset_handle),
        ("history aggregator", history_handle),
    ] {
        tracing::info!(task = name, "Waiting for background task to stop");
        handle.await?;
    }

    engine.save_usage(true);
    tracing::info!("Turnstile stopped");
    Ok(())
}
