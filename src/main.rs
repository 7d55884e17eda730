use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod balancer;
mod config;
mod metrics;
mod proxy;

use balancer::{Backend, HealthChecker};
use proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "golem")]
#[command(version, about = "HTTP reverse proxy with pluggable load balancing", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Backend server URL (comma-separated or repeated)
    #[arg(long = "backend")]
    backends: Vec<String>,

    /// Load balancing method: roundrobin, leastconn or weighted
    #[arg(long)]
    method: Option<String>,

    /// Config file path (skips the standard search locations)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the Prometheus /metrics listener
    #[arg(long, default_value = "9090")]
    metrics_port: u16,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration: explicit path, then the standard search locations,
    // then built-in defaults. CLI flags override whatever was loaded.
    let mut cfg = match cli.config.clone().or_else(config::find_config_file) {
        Some(path) => {
            let cfg = config::load_from_file(&path)?;
            info!("loaded config from {}", path.display());
            cfg
        }
        None => config::Config::default(),
    };

    cfg.apply_overrides(cli.port, cli.method.as_deref(), &cli.backends);
    cfg.validate().context("Invalid configuration")?;

    let backends: Vec<Arc<Backend>> = cfg
        .backends
        .iter()
        .map(|b| Backend::new(b.url.clone(), b.effective_weight()))
        .collect();

    metrics::init(SocketAddr::from(([0, 0, 0, 0], cli.metrics_port)))?;
    metrics::set_balancer_info(env!("CARGO_PKG_VERSION"), &cfg.method);

    let selector = balancer::build(&cfg.method, backends.clone())
        .context("Failed to create balancer")?;

    let health_checker = Arc::new(HealthChecker::new(
        backends,
        balancer::health::DEFAULT_PROBE_INTERVAL,
    ));
    health_checker.clone().start();

    let listen = format!("0.0.0.0:{}", cfg.port);
    info!(
        listen = %listen,
        method = %cfg.method,
        backends = cfg.backends.len(),
        "starting golem"
    );

    ProxyServer::new(selector, listen).run().await
}
