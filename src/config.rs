//! Command-line surface and static proxy configuration.
//!
//! The remote proxy address and credentials may also be injected at build
//! time through the `MUXTUN_PROXY_ADDR`, `MUXTUN_USER` and `MUXTUN_PASSWORD`
//! environment variables, so a binary can ship with them baked in.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::error::{MuxtunError, Result};

/// Transparent TCP proxy tunneling redirected connections through
/// HTTP/2 CONNECT upstreams.
#[derive(Parser, Debug)]
#[command(name = "muxtun", version)]
pub struct Cli {
    /// Remote proxy address list: host:port[#sni_host], comma-separated
    #[arg(short = 'r', long = "remote", value_name = "HOST:PORT[#SNI],...")]
    pub remote: Option<String>,

    /// Proxy user name
    #[arg(short = 'u', long = "user", value_name = "USER")]
    pub user: Option<String>,

    /// Proxy password
    #[arg(short = 'p', long = "password", value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Local address to bind
    #[arg(short = 'l', long = "listen", value_name = "ADDR", default_value = ":1086")]
    pub listen: String,

    /// CONNECT request timeout (seconds)
    #[arg(short = 't', long = "timeout", value_name = "SECONDS", default_value_t = 10)]
    pub timeout: u64,

    /// Number of CONNECT timeouts that trips backoff
    #[arg(short = 'b', long = "backoff", value_name = "N", default_value_t = 3)]
    pub backoff: usize,

    /// Show debug log
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

/// Basic-auth credentials shared by all upstream proxies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// One upstream proxy entry: dial address plus an optional TLS SNI override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Proxy `host:port` to dial (also the proxy's display name)
    pub addr: String,
    /// SNI to present in the ClientHello instead of the proxy host
    pub sni: Option<String>,
}

/// Resolved application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub proxies: Vec<ProxyDescriptor>,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    pub backoff_threshold: usize,
    pub debug: bool,
}

impl Config {
    /// Resolve the parsed CLI against the build-time defaults
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let remote = cli
            .remote
            .or_else(|| option_env!("MUXTUN_PROXY_ADDR").map(str::to_string))
            .ok_or_else(|| {
                MuxtunError::InvalidConfig("no remote proxy address configured (use -r)".into())
            })?;

        let credentials = Credentials {
            user: cli
                .user
                .or_else(|| option_env!("MUXTUN_USER").map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string()),
            password: cli
                .password
                .or_else(|| option_env!("MUXTUN_PASSWORD").map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string()),
        };

        Ok(Config {
            listen: parse_listen_addr(&cli.listen)?,
            proxies: parse_proxy_list(&remote)?,
            credentials,
            connect_timeout: Duration::from_secs(cli.timeout.max(1)),
            backoff_threshold: cli.backoff.max(1),
            debug: cli.debug,
        })
    }
}

/// Parse a comma-separated proxy descriptor list.
///
/// Each entry is `host:port` optionally followed by `#sni_host`.
pub fn parse_proxy_list(list: &str) -> Result<Vec<ProxyDescriptor>> {
    let mut out = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(MuxtunError::InvalidConfig(format!(
                "empty entry in proxy list: {list:?}"
            )));
        }
        let (addr, sni) = match entry.split_once('#') {
            Some((addr, sni)) if !sni.is_empty() => (addr, Some(sni.to_string())),
            Some((addr, _)) => (addr, None),
            None => (entry, None),
        };
        validate_host_port(addr)?;
        out.push(ProxyDescriptor {
            addr: addr.to_string(),
            sni,
        });
    }
    Ok(out)
}

/// Normalize a listen address; a bare `:port` binds all interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map_err(|_| MuxtunError::InvalidConfig(format!("invalid listen address: {addr}")))
}

fn validate_host_port(addr: &str) -> Result<()> {
    let err = || MuxtunError::InvalidConfig(format!("proxy address must be host:port: {addr}"));
    let (host, port) = addr.rsplit_once(':').ok_or_else(err)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(err());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("muxtun").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let cli = parse_cli(&["-r", "proxy.example:443"]);
        assert_eq!(cli.listen, ":1086");
        assert_eq!(cli.timeout, 10);
        assert_eq!(cli.backoff, 3);
        assert!(!cli.debug);
    }

    #[test]
    fn test_config_from_cli() {
        let cli = parse_cli(&[
            "-r",
            "p1.example:443,p2.example:8443#front.example",
            "-u",
            "alice",
            "-p",
            "secret",
            "-l",
            "127.0.0.1:2086",
            "-t",
            "5",
            "-b",
            "2",
            "-d",
        ]);
        let config = Config::from_cli(cli).unwrap();

        assert_eq!(config.listen, "127.0.0.1:2086".parse().unwrap());
        assert_eq!(config.proxies.len(), 2);
        assert_eq!(config.proxies[0].addr, "p1.example:443");
        assert_eq!(config.proxies[0].sni, None);
        assert_eq!(config.proxies[1].addr, "p2.example:8443");
        assert_eq!(config.proxies[1].sni.as_deref(), Some("front.example"));
        assert_eq!(config.credentials.user, "alice");
        assert_eq!(config.credentials.password, "secret");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff_threshold, 2);
        assert!(config.debug);
    }

    #[test]
    fn test_proxy_list_single_entry() {
        let proxies = parse_proxy_list("proxy.example:443").unwrap();
        assert_eq!(
            proxies,
            vec![ProxyDescriptor {
                addr: "proxy.example:443".to_string(),
                sni: None,
            }]
        );
    }

    #[test]
    fn test_proxy_list_rejects_empty_entries() {
        assert!(parse_proxy_list("").is_err());
        assert!(parse_proxy_list("proxy.example:443,,other.example:443").is_err());
    }

    #[test]
    fn test_proxy_list_rejects_missing_port() {
        assert!(parse_proxy_list("proxy.example").is_err());
        assert!(parse_proxy_list("proxy.example:http").is_err());
    }

    #[test]
    fn test_listen_addr_normalization() {
        assert_eq!(
            parse_listen_addr(":1086").unwrap(),
            "0.0.0.0:1086".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("nonsense").is_err());
    }
}
