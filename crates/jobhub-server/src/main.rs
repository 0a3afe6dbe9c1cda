//! jobhub hub server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobhub_broker::{JobBroker, JobStore, MemoryStore, RedisStore};
use jobhub_server::{http, tasks, Hub, ServerConfig};

/// jobhub hub server.
#[derive(Parser, Debug)]
#[command(name = "jobhub-server", about = "Job broker and message router hub")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Redis URL (overrides the config file; in-memory store when unset)
    #[arg(long)]
    redis_url: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.http_bind_addr = bind;
    }
    if args.redis_url.is_some() {
        config.redis_url = args.redis_url;
    }

    // Initialize tracing
    let level = args
        .log_level
        .unwrap_or_else(|| config.router.log_level.clone());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let http_addr: SocketAddr = config.http_bind_addr.parse()?;

    let store: Arc<dyn JobStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect_with_prefix(url, &config.redis_prefix).await?;
            info!(prefix = %config.redis_prefix, "Using Redis store");
            Arc::new(store)
        }
        None => {
            warn!("No Redis URL configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let broker = Arc::new(JobBroker::new(store, config.broker.clone()));
    let hub = Hub::new(broker, config.router.clone(), config.connection_buffer).await?;

    let cancel = CancellationToken::new();
    let background = tasks::spawn_background(hub.clone(), &config, cancel.clone());

    let router = http::create_router(hub);
    let listener = TcpListener::bind(http_addr).await?;
    info!(http_addr = %http_addr, "Starting jobhub server");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    if let Err(e) = result {
        tracing::error!(error = %e, "HTTP server error");
        return Err(e.into());
    }
    info!("jobhub server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
