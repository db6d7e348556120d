mod cache;
mod config;
mod health;
mod http;
mod metrics;
mod proxy;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::CacheStore;
use crate::metrics::MetricsRegistry;
use crate::proxy::failover::MirrorFailover;
use crate::proxy::redirect::FollowRedirect;
use crate::proxy::transport::{ReqwestTransport, Transport};
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "pkgproxy",
    version,
    about = "Caching forward proxy for Linux package repositories"
)]
struct Cli {
    /// Path to the YAML repository configuration.
    #[arg(
        short,
        long,
        global = true,
        env = "PKGPROXY_CONFIG",
        default_value = "./pkgproxy.yaml"
    )]
    config: PathBuf,

    /// Base directory of the package cache.
    #[arg(long, global = true, default_value = "cache")]
    cachedir: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the caching proxy.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Overall deadline for a single mirror request, in seconds.
    #[arg(long, value_name = "SECONDS")]
    upstream_timeout: Option<u64>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub cache: CacheStore,
    pub failover: MirrorFailover,
    pub metrics: MetricsRegistry,
}

impl AppState {
    /// Wire the pipeline collaborators around `transport`.  Redirect
    /// following is layered on here.
    pub fn new(registry: Arc<Registry>, cache_dir: PathBuf, transport: Arc<dyn Transport>) -> Self {
        let metrics = MetricsRegistry::new();
        let failover = MirrorFailover::new(
            Arc::new(FollowRedirect::new(transport)),
            metrics.clone(),
        );
        Self {
            cache: CacheStore::new(cache_dir, Arc::clone(&registry)),
            registry,
            failover,
            metrics,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, args: &ServeArgs) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}:{}", args.host, args.port))?;

    let local_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    tracing::info!(%local_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let registry = Arc::new(Registry::from_config(&config)?);

    tracing::info!(
        config_path = %cli.config.display(),
        cache_dir = %cli.cachedir.display(),
        repositories = registry.len(),
        "starting pkgproxy"
    );
    if registry.is_empty() {
        tracing::warn!("no repositories configured, every request passes through");
    }
    for repo in registry.iter() {
        let mirrors: Vec<&str> = repo.mirrors.iter().map(|m| m.as_str()).collect();
        tracing::info!(
            handle = %repo.handle,
            suffixes = ?repo.cache_suffixes,
            mirrors = ?mirrors,
            "configured repository"
        );
    }

    // ---- Ensure cache directory exists ----
    tokio::fs::create_dir_all(&cli.cachedir)
        .await
        .with_context(|| format!("failed to create cache dir: {}", cli.cachedir.display()))?;

    match cli.command {
        Command::Serve(args) => {
            let transport =
                ReqwestTransport::new(args.upstream_timeout.map(Duration::from_secs))?;
            let state = AppState::new(registry, cli.cachedir.clone(), Arc::new(transport));
            run_http_server(state, &args).await?;
        }
    }

    tracing::info!("pkgproxy stopped");
    Ok(())
}
