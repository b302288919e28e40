//! Gantry server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gantry_config::{SystemConfig, load_system_config};
use gantry_db::{Database, MemoryDatabase, PgDatabase, create_pool, run_migrations};
use gantry_scheduler::SchedulerConfig;
use gantry_server::{AppState, routes};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Database URL selecting the in-memory store.
const MEMORY_URL: &str = "memory://";

#[derive(Debug, Parser)]
#[command(name = "gantry-server", version, about = "Gantry workflow run scheduler")]
struct Args {
    /// Path to the KDL system configuration file.
    #[arg(long, env = "GANTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL; overrides the configuration file. `memory://` keeps
    /// everything in process.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(url) = args.database_url {
        config.database.url = url;
    }

    let db = connect(&config.database.url).await?;
    let state = AppState::new(db, SchedulerConfig::from_system(&config));

    let worker = state.scheduler.maintenance_worker();
    tokio::spawn(async move { worker.run().await });

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!("Starting server on {}", config.server.listen);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn connect(url: &str) -> anyhow::Result<Arc<dyn Database>> {
    if url == MEMORY_URL {
        warn!("Using the in-memory store; all state is lost on exit");
        return Ok(Arc::new(MemoryDatabase::new()));
    }

    info!("Connecting to database...");
    let pool = create_pool(url).await?;
    run_migrations(&pool).await?;
    info!("Database connected");
    Ok(Arc::new(PgDatabase::new(pool)))
}
