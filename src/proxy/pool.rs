//! Sharded HTTP/2 connection pool
//!
//! An HTTP/2 client multiplexes every stream to one authority onto a single
//! connection, which caps tunnel throughput at that connection's flow-control
//! window. The pool defeats this by keeping K independent connections to the
//! same proxy address and spreading CONNECT streams across them with a
//! uniformly random shard pick per checkout.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{MuxtunError, Result};
use crate::proxy::tls::TlsClient;

/// Default number of parallel connections to one proxy
pub const DEFAULT_SHARDS: usize = 5;

// Keep idle connections alive with PING frames, mirroring the read-idle
// probing expected by long-lived upstream links.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// The request handle type carried by each shard
pub type ConnectSender = SendRequest<Empty<Bytes>>;

/// K lazily-established HTTP/2 connections to a single proxy address
pub struct ShardedPool {
    proxy_addr: String,
    tls: TlsClient,
    shards: Vec<Mutex<Option<ConnectSender>>>,
}

impl ShardedPool {
    pub fn new(proxy_addr: String, tls: TlsClient, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            proxy_addr,
            tls,
            shards: (0..shards).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Check out a request handle on a randomly picked shard.
    ///
    /// Reuses the shard's live connection or dials a fresh one if the shard
    /// is empty or its connection has died. Returns the shard index so a
    /// failed send can evict exactly the connection it used.
    pub async fn checkout(&self) -> Result<(usize, ConnectSender)> {
        let shard = self.pick();
        let mut slot = self.shards[shard].lock().await;

        if let Some(sender) = slot.as_ref() {
            if !sender.is_closed() {
                return Ok((shard, sender.clone()));
            }
            debug!(shard = shard, proxy = %self.proxy_addr, "shard connection died");
        }

        let sender = self.connect(shard).await?;
        *slot = Some(sender.clone());
        Ok((shard, sender))
    }

    /// Evict a shard's connection after a transport-level failure
    pub async fn mark_dead(&self, shard: usize) {
        if let Some(slot) = self.shards.get(shard) {
            *slot.lock().await = None;
        }
    }

    fn pick(&self) -> usize {
        rand::thread_rng().gen_range(0..self.shards.len())
    }

    /// Dial the proxy: TCP, then TLS with ALPN h2, then the h2 handshake.
    async fn connect(&self, shard: usize) -> Result<ConnectSender> {
        let tcp = TcpStream::connect(&self.proxy_addr).await?;
        let tls = self.tls.connect(tcp).await?;

        let (_, session) = tls.get_ref();
        if session.alpn_protocol() != Some(b"h2") {
            return Err(MuxtunError::Transport(format!(
                "upstream {} did not negotiate h2",
                self.proxy_addr
            )));
        }

        let (sender, conn) = http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
            .keep_alive_while_idle(true)
            .handshake(TokioIo::new(tls))
            .await?;

        let proxy_addr = self.proxy_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(shard = shard, proxy = %proxy_addr, "connection closed: {}", e);
            }
        });

        debug!(shard = shard, proxy = %self.proxy_addr, "shard connection established");
        Ok(sender)
    }
}
