//! CLI entry point - the composition root.
//!
//! This is the only place where infrastructure is wired together: the
//! file-backed history store, the server root, and the axum surface. The
//! server runs until ctrl-c.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use syncd_axum::{create_router, AxumContext};
use syncd_core::ports::access::AllowAll;
use syncd_core::ports::metrics::NoopMetrics;
use syncd_core::ServerConfig;
use syncd_server::SyncServer;
use syncd_store::FileHistoryFactory;

/// Realm synchronization server.
#[derive(Debug, Parser)]
#[command(name = "syncd", version, about)]
struct Cli {
    /// Directory holding the realm files.
    #[arg(long, value_name = "DIR")]
    root: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7800", value_name = "ADDR")]
    listen: SocketAddr,

    /// Optional JSON configuration file; flags override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Shared secret required by the admin endpoints.
    #[arg(long, value_name = "TOKEN")]
    admin_token: Option<String>,
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => ServerConfig::with_defaults(),
    };
    config.root_dir = Some(cli.root.clone());
    if cli.admin_token.is_some() {
        config.admin_token = cli.admin_token.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let server = SyncServer::start(
        config,
        Arc::new(AllowAll),
        Arc::new(NoopMetrics),
        Arc::new(FileHistoryFactory),
    )
    .context("starting sync server")?;

    let router = create_router(AxumContext {
        server: Arc::clone(&server),
    });
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(listen = %cli.listen, root = %cli.root.display(), "syncd listening");

    let shutdown_server = Arc::clone(&server);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("serving")?;

    shutdown_server.shutdown();
    Ok(())
}
