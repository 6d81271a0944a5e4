//! Proxy Supervisor - Entry Point
//!
//! Loads the proxy list, starts the balancing proxy server and the optional
//! health monitor, and shuts both down gracefully.

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxy_supervisor::config::{Config, LogConfig};
use proxy_supervisor::proxy::{BackoffStrategy, Balancer, Monitor, ProxyServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    init_tracing(&config.log);
    info!("Starting Proxy Supervisor");

    let balancer = Balancer::builder()
        .strategy(BackoffStrategy::new())
        .max_idle_sockets(config.proxy.max_idle_sockets)
        .infer_socks(config.proxy.infer_socks)
        .build();

    let addresses = config
        .load_proxy_list()
        .context("failed to load proxy list")?;
    balancer.add(&addresses);
    info!("Loaded {} proxies", balancer.len());

    // Start health monitor
    let monitor = match config.monitor_config()? {
        Some(monitor_config) => {
            let monitor = Monitor::new(monitor_config).context("invalid monitor configuration")?;
            balancer.subscribe(&monitor);
            monitor.start();
            Some(monitor)
        }
        None => {
            info!("MONITOR_TARGET not set, health monitoring disabled");
            None
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr = config.proxy_addr()?;
    let server = ProxyServer::new(&balancer, config.forward_options()?);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(addr, shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Some(monitor) = &monitor {
        monitor.stop();
    }

    let _ = server_task.await;

    info!("Proxy Supervisor stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proxy_supervisor={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
