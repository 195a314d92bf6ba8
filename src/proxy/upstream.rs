//! Upstream HTTPS proxy speaking HTTP/2 CONNECT
//!
//! Each `HttpProxy` owns a sharded connection pool to one proxy address, the
//! Basic credentials presented on every CONNECT, and a backoff circuit
//! breaker fed by CONNECT timeouts and transport failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::Credentials;
use crate::error::{MuxtunError, Result};
use crate::proxy::pool::{ShardedPool, DEFAULT_SHARDS};
use crate::proxy::tls::{TlsClient, TlsMode};
use crate::proxy::tunnel::HttpTunnel;
use crate::proxy::watchdog;

/// Dialer interface the failover group selects over
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Display name (the proxy's `host:port`)
    fn name(&self) -> &str;

    /// Whether the proxy currently accepts dials
    fn ready(&self) -> bool;

    /// Open a CONNECT tunnel to `target` (`host:port`)
    async fn dial(&self, target: &str) -> Result<HttpTunnel>;
}

/// Tuning for one upstream proxy
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Deadline for the CONNECT exchange (not for the tunnel itself)
    pub connect_timeout: Duration,
    /// Number of timeout/transport failures that trips backoff
    pub backoff_threshold: usize,
    /// Parallel HTTP/2 connections kept to the proxy
    pub shards: usize,
    /// SNI to present instead of the proxy host
    pub sni_override: Option<String>,
    /// Upstream certificate verification mode
    pub tls_mode: TlsMode,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff_threshold: 3,
            shards: DEFAULT_SHARDS,
            sni_override: None,
            tls_mode: TlsMode::Permissive,
        }
    }
}

/// One upstream HTTPS proxy
pub struct HttpProxy {
    name: String,
    auth_header: HeaderValue,
    pool: ShardedPool,
    backoff: Arc<AtomicBool>,
    hint_tx: mpsc::Sender<()>,
    connect_timeout: Duration,
}

impl HttpProxy {
    /// Build a proxy and spawn its backoff watchdog.
    ///
    /// The watchdog runs until the proxy is dropped.
    pub fn new(addr: &str, credentials: &Credentials, config: UpstreamConfig) -> Result<Self> {
        let tls = TlsClient::new(addr, config.sni_override.as_deref(), config.tls_mode)?;
        let backoff = Arc::new(AtomicBool::new(false));
        let (hint_tx, hint_rx) = watchdog::hint_channel();

        tokio::spawn(watchdog::run(
            addr.to_string(),
            backoff.clone(),
            hint_rx,
            config.backoff_threshold.max(1),
            watchdog::RESET_PERIOD,
        ));

        Ok(Self {
            name: addr.to_string(),
            auth_header: basic_auth(credentials)?,
            pool: ShardedPool::new(addr.to_string(), tls, config.shards),
            backoff,
            hint_tx,
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ready(&self) -> bool {
        !self.backoff.load(Ordering::Relaxed)
    }

    /// Open a CONNECT tunnel to `target` through this proxy.
    ///
    /// Fails fast while backing off. Timeouts and transport failures feed
    /// the watchdog; HTTP-level rejections (407, other non-200) do not —
    /// a misconfiguration will not heal by waiting.
    #[instrument(skip(self), fields(proxy = %self.name))]
    pub async fn dial(&self, target: &str) -> Result<HttpTunnel> {
        if self.backoff.load(Ordering::Relaxed) {
            return Err(MuxtunError::Backoff);
        }

        let req = self.connect_request(target)?;

        let response = match timeout(self.connect_timeout, self.exchange(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.hint();
                return Err(e);
            }
            Err(_) => {
                // Dropping the in-flight exchange cancels the stream (or the
                // half-open connection attempt).
                self.hint();
                return Err(MuxtunError::ConnectTimeout);
            }
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => return Err(MuxtunError::AuthFailed),
            status => return Err(MuxtunError::ConnectRejected(status)),
        }

        let upgraded = match hyper::upgrade::on(response).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                self.hint();
                return Err(e.into());
            }
        };

        debug!(target = %target, "tunnel established");
        Ok(HttpTunnel::new(TokioIo::new(upgraded)))
    }

    /// Send the CONNECT request over a randomly picked shard
    async fn exchange(&self, req: Request<Empty<Bytes>>) -> Result<Response<Incoming>> {
        let (shard, mut sender) = self.pool.checkout().await?;

        if let Err(e) = sender.ready().await {
            self.pool.mark_dead(shard).await;
            return Err(e.into());
        }
        match sender.send_request(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.pool.mark_dead(shard).await;
                Err(e.into())
            }
        }
    }

    /// Build the CONNECT request: authority-form URI, Basic credentials in
    /// `Proxy-Authorization`, never in `Authorization`.
    fn connect_request(&self, target: &str) -> Result<Request<Empty<Bytes>>> {
        let uri: Uri = target
            .parse()
            .map_err(|_| MuxtunError::InvalidTarget(target.to_string()))?;
        if uri.authority().is_none() {
            return Err(MuxtunError::InvalidTarget(target.to_string()));
        }

        Request::builder()
            .method(Method::CONNECT)
            .uri(uri)
            .header(PROXY_AUTHORIZATION, self.auth_header.clone())
            .body(Empty::new())
            .map_err(|e| MuxtunError::Transport(e.to_string()))
    }

    fn hint(&self) {
        // Drop on a full channel: the watchdog only needs coarse counting.
        let _ = self.hint_tx.try_send(());
    }
}

#[async_trait]
impl TunnelDialer for HttpProxy {
    fn name(&self) -> &str {
        HttpProxy::name(self)
    }

    fn ready(&self) -> bool {
        HttpProxy::ready(self)
    }

    async fn dial(&self, target: &str) -> Result<HttpTunnel> {
        HttpProxy::dial(self, target).await
    }
}

fn basic_auth(credentials: &Credentials) -> Result<HeaderValue> {
    let token = BASE64.encode(format!("{}:{}", credentials.user, credentials.password));
    let mut value = HeaderValue::from_str(&format!("Basic {token}")).map_err(|_| {
        MuxtunError::InvalidConfig("credentials contain bytes not allowed in headers".into())
    })?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::AUTHORIZATION;

    fn test_credentials() -> Credentials {
        Credentials {
            user: "user".to_string(),
            password: "passwd".to_string(),
        }
    }

    fn test_proxy() -> HttpProxy {
        HttpProxy::new(
            "127.0.0.1:4433",
            &test_credentials(),
            UpstreamConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_basic_auth_encoding() {
        let value = basic_auth(&test_credentials()).unwrap();
        assert_eq!(value.to_str().unwrap(), "Basic dXNlcjpwYXNzd2Q=");
    }

    #[tokio::test]
    async fn test_connect_request_shape() {
        let proxy = test_proxy();
        let req = proxy.connect_request("example.com:443").unwrap();

        assert_eq!(req.method(), Method::CONNECT);
        assert_eq!(req.uri().authority().unwrap().as_str(), "example.com:443");
        assert_eq!(
            req.headers().get(PROXY_AUTHORIZATION).unwrap().to_str().unwrap(),
            "Basic dXNlcjpwYXNzd2Q="
        );
        assert!(!req.headers().contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_connect_request_rejects_bad_targets() {
        let proxy = test_proxy();
        assert!(matches!(
            proxy.connect_request("/not-an-authority"),
            Err(MuxtunError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_fails_fast_while_backing_off() {
        let proxy = test_proxy();
        proxy.backoff.store(true, Ordering::Relaxed);

        assert!(!proxy.ready());
        let err = proxy.dial("example.com:443").await.unwrap_err();
        assert!(matches!(err, MuxtunError::Backoff));
    }

    #[tokio::test]
    async fn test_proxy_starts_ready() {
        let proxy = test_proxy();
        assert!(proxy.ready());
        assert_eq!(proxy.name(), "127.0.0.1:4433");
    }
}
