//! Muxtun - Entry point
//!
//! Starts the transparent proxy server with graceful shutdown support.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muxtun::config::{Cli, Config};
use muxtun::proxy::{ProxyGroup, TproxyServer, UpstreamConfig};

#[tokio::main]
async fn main() -> muxtun::Result<()> {
    let config = Config::from_cli(Cli::parse())?;

    // Initialize tracing; -d raises the default filter to debug
    let default_filter = if config.debug {
        "muxtun=debug"
    } else {
        "muxtun=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting muxtun");

    let upstream_config = UpstreamConfig {
        connect_timeout: config.connect_timeout,
        backoff_threshold: config.backoff_threshold,
        ..UpstreamConfig::default()
    };
    let group = Arc::new(ProxyGroup::from_descriptors(
        &config.proxies,
        &config.credentials,
        &upstream_config,
    )?);
    info!(
        "Using {} upstream proxies: {:?}",
        group.len(),
        group.names()
    );

    let server = TproxyServer::new(config.listen, group);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    tokio::select! {
        // Bind failure or another fatal accept-loop error
        result = &mut server_task => {
            return result.expect("proxy server task panicked");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            server_task.await.expect("proxy server task panicked")?;
        }
    }

    info!("muxtun stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
