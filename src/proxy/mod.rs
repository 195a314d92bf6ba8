//! Tunneling engine
//!
//! This module provides the proxy core:
//! - HTTP/2 CONNECT tunnels with half-close semantics
//! - Sharded connection pooling to each upstream proxy
//! - Per-proxy backoff circuit breaking on CONNECT timeouts
//! - Ordered multi-proxy failover
//! - The transparent accept loop and bidirectional forwarder

pub mod group;
pub mod origdst;
pub mod pool;
pub mod server;
pub mod tls;
pub mod tunnel;
pub mod upstream;
pub mod watchdog;

pub use group::ProxyGroup;
pub use pool::ShardedPool;
pub use server::TproxyServer;
pub use tls::{TlsClient, TlsMode};
pub use tunnel::{splice, HttpTunnel};
pub use upstream::{HttpProxy, TunnelDialer, UpstreamConfig};
