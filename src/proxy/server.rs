//! Transparent proxy server
//!
//! Accepts redirected TCP connections, recovers each one's original
//! destination and splices it with a tunnel dialed through the proxy group.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::proxy::group::ProxyGroup;
use crate::proxy::origdst;
use crate::proxy::tunnel::{splice, ACTIVE_DOWNLINKS, ACTIVE_UPLINKS};

/// Downstream connections currently alive
pub static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Transparent proxy accept loop
pub struct TproxyServer {
    listen: SocketAddr,
    group: Arc<ProxyGroup>,
}

impl TproxyServer {
    pub fn new(listen: SocketAddr, group: Arc<ProxyGroup>) -> Self {
        Self { listen, group }
    }

    /// Run until the shutdown signal flips.
    ///
    /// Shutdown only stops accepting; in-flight tunnels drain naturally as
    /// their peers close.
    #[instrument(skip(self, shutdown), fields(listen = %self.listen))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        info!("transparent proxy listening on {}", self.listen);

        let mut gauge_ticker = interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let group = self.group.clone();
                            tokio::spawn(async move {
                                let _gauge = ConnectionGauge::new();
                                if let Err(e) = handle_connection(stream, peer, group).await {
                                    debug!("connection from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = gauge_ticker.tick() => {
                    debug!(
                        connections = ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
                        uplinks = ACTIVE_UPLINKS.load(Ordering::Relaxed),
                        downlinks = ACTIVE_DOWNLINKS.load(Ordering::Relaxed),
                        "in-flight"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    group: Arc<ProxyGroup>,
) -> Result<()> {
    let target = origdst::original_destination(&stream)?.to_string();
    debug!("O {} => {}", peer, target);

    let tunnel = group.dial(&target).await?;
    splice(stream, tunnel).await;

    debug!("X {} => {}", peer, target);
    Ok(())
}

/// Bumps the live-connection gauge for as long as the connection task runs
struct ConnectionGauge;

impl ConnectionGauge {
    fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        Self
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }
}
