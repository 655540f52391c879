//! Creator Hub real-time service (chub-rt) - Main entry point
//!
//! Serves the messaging, appointment and notification API plus the per-user
//! SSE streams that push events to connected clients.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chub_common::config::{
    default_config_path, resolve_root_folder, ServiceConfig, StorageBackend, ROOT_FOLDER_ENV,
};
use chub_common::db::{init_database, models::DeliveryChannel};
use chub_rt::channels::ChannelSet;
use chub_rt::storage::{MemoryStorage, SqliteStorage, Storage};
use chub_rt::{build_router, seed_users, AppState};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

/// Command-line arguments for chub-rt
#[derive(Parser, Debug)]
#[command(name = "chub-rt")]
#[command(about = "Real-time messaging and notification service for the Creator Hub")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long)]
    root_folder: Option<String>,

    /// TOML config file (defaults to the per-user config location)
    #[arg(short, long, env = "CHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "CHUB_PORT")]
    port: Option<u16>,

    /// Storage backend: memory or sqlite (overrides config)
    #[arg(long, env = "CHUB_STORAGE")]
    storage: Option<StorageBackend>,

    /// SendGrid API key (overrides config)
    #[arg(long, env = "CHUB_SENDGRID_API_KEY", hide_env_values = true)]
    sendgrid_api_key: Option<String>,

    /// Twilio auth token (overrides config)
    #[arg(long, env = "CHUB_TWILIO_AUTH_TOKEN", hide_env_values = true)]
    twilio_auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Build identification first, before any slow startup work
    info!(
        "Starting Creator Hub real-time service (chub-rt) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();

    let mut config = match args.config.clone().or_else(default_config_path) {
        Some(path) => {
            info!("Config file: {}", path.display());
            ServiceConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => {
            info!("No config file found, using defaults");
            ServiceConfig::default()
        }
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    let storage = open_storage(&config, args.root_folder.as_deref()).await?;
    seed_users(storage.as_ref(), &config.users)
        .await
        .context("Failed to seed users")?;

    let channels = ChannelSet::from_config(&config.email, &config.sms)
        .context("Failed to configure side channels")?;
    for channel in [DeliveryChannel::Email, DeliveryChannel::Sms] {
        if channels.sender(channel).is_some() {
            info!("✓ {} channel enabled", channel);
        } else {
            info!("{} channel not configured, deliveries will be skipped", channel);
        }
    }

    let state = AppState::new(storage, channels, &config.delivery);
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.server.host))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("chub-rt listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

fn apply_overrides(config: &mut ServiceConfig, args: &Args) {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(backend) = args.storage {
        config.storage.backend = backend;
    }
    if let Some(key) = &args.sendgrid_api_key {
        config.email.api_key = key.clone();
    }
    if let Some(token) = &args.twilio_auth_token {
        config.sms.auth_token = token.clone();
    }
}

async fn open_storage(config: &ServiceConfig, root_arg: Option<&str>) -> Result<Arc<dyn Storage>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; all data is lost on shutdown");
            Ok(Arc::new(MemoryStorage::with_default_templates()))
        }
        StorageBackend::Sqlite => {
            let root_folder = resolve_root_folder(root_arg, ROOT_FOLDER_ENV, Some(config));
            std::fs::create_dir_all(&root_folder).with_context(|| {
                format!("Failed to create root folder {}", root_folder.display())
            })?;

            let db_path = config.database_path(&root_folder);
            info!("Database path: {}", db_path.display());
            let pool = init_database(&db_path)
                .await
                .context("Failed to open database")?;
            info!("✓ Connected to database");
            Ok(Arc::new(SqliteStorage::new(pool)))
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
