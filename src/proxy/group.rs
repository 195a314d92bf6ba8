//! Ordered failover across several upstream proxies
//!
//! Dials always scan the list in current order and take the first ready
//! proxy. The list is re-partitioned (ready proxies first, relative order
//! preserved) only when the head has gone unhealthy while its successor is
//! good, and only best-effort: a reorder already in progress is skipped so
//! no dial ever blocks on it.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::config::{Credentials, ProxyDescriptor};
use crate::error::{MuxtunError, Result};
use crate::proxy::tunnel::HttpTunnel;
use crate::proxy::upstream::{HttpProxy, TunnelDialer, UpstreamConfig};

/// Ordered list of proxies with health-based failover
pub struct ProxyGroup {
    proxies: RwLock<Vec<Arc<dyn TunnelDialer>>>,
    reorder_lock: Mutex<()>,
}

impl ProxyGroup {
    pub fn new(proxies: Vec<Arc<dyn TunnelDialer>>) -> Result<Self> {
        if proxies.is_empty() {
            return Err(MuxtunError::InvalidConfig(
                "proxy group needs at least one proxy".into(),
            ));
        }
        Ok(Self {
            proxies: RwLock::new(proxies),
            reorder_lock: Mutex::new(()),
        })
    }

    /// Build the group from parsed descriptors sharing credentials and tuning
    pub fn from_descriptors(
        descriptors: &[ProxyDescriptor],
        credentials: &Credentials,
        config: &UpstreamConfig,
    ) -> Result<Self> {
        let mut proxies: Vec<Arc<dyn TunnelDialer>> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let mut proxy_config = config.clone();
            proxy_config.sni_override = descriptor.sni.clone();
            proxies.push(Arc::new(HttpProxy::new(
                &descriptor.addr,
                credentials,
                proxy_config,
            )?));
        }
        Self::new(proxies)
    }

    /// Dial through the first ready proxy.
    ///
    /// No internal retry: the chosen proxy's result, error or not, is the
    /// caller's result. The group adapts between calls as backoff flags flip.
    #[instrument(skip(self))]
    pub async fn dial(&self, target: &str) -> Result<HttpTunnel> {
        let needs_reorder = {
            let proxies = self.proxies.read();
            // only reorder when the head is unhealthy and its successor is good
            proxies.len() > 1 && !proxies[0].ready() && proxies[1].ready()
        };
        if needs_reorder {
            self.reorder_by_health();
        }

        let snapshot: Vec<Arc<dyn TunnelDialer>> = self.proxies.read().clone();
        for proxy in &snapshot {
            if proxy.ready() {
                return proxy.dial(target).await;
            }
        }
        Err(MuxtunError::NoHealthyProxy)
    }

    /// Stable partition placing ready proxies first.
    ///
    /// Skipped entirely if another reorder is running.
    fn reorder_by_health(&self) {
        let Some(_guard) = self.reorder_lock.try_lock() else {
            return;
        };
        let mut proxies = self.proxies.write();
        let (ready, not_ready): (Vec<_>, Vec<_>) = proxies
            .iter()
            .cloned()
            .map(|p| (p.ready(), p))
            .partition(|(ready, _)| *ready);
        *proxies = ready
            .into_iter()
            .chain(not_ready)
            .map(|(_, proxy)| proxy)
            .collect();
        debug!(order = ?proxies.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(), "reordered by health");
    }

    /// Proxy names in current list order
    pub fn names(&self) -> Vec<String> {
        self.proxies
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ProxyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for proxy in self.proxies.read().iter() {
            writeln!(f, "{} - {}", proxy.name(), proxy.ready())?;
        }
        Ok(())
    }
}
