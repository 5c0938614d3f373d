//! Emulator Proxy - Main entry point

use emulator_proxy::{publish_emulator_host, LogFormat, ProxyConfig, ProxyServer, Router};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable naming the configuration file
const CONFIG_PATH_ENV: &str = "EMULATOR_PROXY_CONFIG";

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("emulator_proxy=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from);

    // Load configuration
    let config = ProxyConfig::load(config_path.as_deref())?;
    init_tracing(config.log_format);
    info!("Starting Emulator Proxy v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    for tenant in &config.tenants {
        info!(tenant = %tenant.id, port = tenant.port, "registering tenant");
    }

    // Still single-threaded: no runtime worker exists yet
    if let Some(host) = config.emulator_host() {
        publish_emulator_host(&host);
    }

    tokio::runtime::Runtime::new()?.block_on(serve(config))
}

async fn serve(config: ProxyConfig) -> anyhow::Result<()> {
    // Create router over the frozen registry
    let router = Arc::new(Router::new(config.registry()));
    let mut server = ProxyServer::new(router, &config)?;

    // Waits for every emulator before binding
    server.start().await?;

    server.ready(config.readiness_timeout()).await??;
    info!(host = %server.emulator_host(), "proxy ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal");
    server.shutdown().await?;

    Ok(())
}
