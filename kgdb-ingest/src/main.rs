//! kgdb-ingest - gene-disease evidence ingestion service
//!
//! Runs source pipelines as background jobs and serves the review queue,
//! scores and run progress over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kgdb_common::config::{resolve_root_folder, RootFolderInitializer};
use kgdb_ingest::cache::CacheStore;
use kgdb_ingest::config::ConfigSource;
use kgdb_ingest::services::IngestServices;
use kgdb_ingest::AppState;

/// Command-line arguments for kgdb-ingest
#[derive(Parser, Debug)]
#[command(name = "kgdb-ingest")]
#[command(about = "Gene-disease evidence ingestion and scoring service")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "KGDB_CONFIG")]
    config: Option<PathBuf>,

    /// Folder holding the database
    #[arg(short, long, env = "KGDB_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Listen address, overriding `[server] bind`
    #[arg(short, long, env = "KGDB_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let initial_root = resolve_root_folder(args.root_folder.as_deref(), None);
    let config_source = ConfigSource::locate(args.config.as_deref(), &initial_root);
    let config = config_source
        .load()
        .context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("kgdb_ingest={0},kgdb_common={0},tower_http=info", config.logging.level)
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting kgdb-ingest v{}", env!("CARGO_PKG_VERSION"));
    if let ConfigSource::File(path) = &config_source {
        info!("Config: {}", path.display());
    }

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), config.root_folder.as_deref());
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let pool = kgdb_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let recovered = kgdb_ingest::db::progress::recover_stale_runs(&pool).await?;
    if recovered > 0 {
        warn!(recovered, "Runs interrupted by a previous shutdown are now paused");
    }

    let cache = CacheStore::with_sqlite(pool.clone(), config.cache.fallback_capacity);
    let purged = cache.purge_expired().await;
    info!(purged, "Expired cache entries removed");

    let services = Arc::new(IngestServices::new(pool, config_source, cache));
    let state = AppState::new(services);
    let jobs = state.jobs.clone();
    let app = kgdb_ingest::build_router(state);

    let bind = args.bind.unwrap_or(config.server.bind);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    jobs.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install signal handler");
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
