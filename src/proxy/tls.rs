//! TLS client setup for upstream proxy connections
//!
//! Every upstream connection negotiates `h2` via ALPN. Certificate
//! verification is permissive by default, matching the expectation that
//! upstream proxies are frequently fronted by certificates that do not
//! match their dial address; strict verification against the webpki roots
//! can be opted into.

use std::io;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::{MuxtunError, Result};

/// How upstream server certificates are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Accept any certificate the upstream presents
    #[default]
    Permissive,
    /// Verify against the bundled webpki roots
    Strict,
}

/// TLS dialer pinned to one upstream proxy
///
/// The server name presented in the ClientHello is fixed at construction:
/// either the configured SNI override or the host part of the proxy address.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    pub fn new(proxy_addr: &str, sni_override: Option<&str>, mode: TlsMode) -> Result<Self> {
        let host = match sni_override {
            Some(sni) => sni,
            None => host_of(proxy_addr),
        };
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            MuxtunError::InvalidConfig(format!("invalid TLS server name: {host}"))
        })?;

        let mut config = match mode {
            TlsMode::Permissive => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
            TlsMode::Strict => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Perform the TLS handshake over an established TCP connection
    pub async fn connect(&self, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        self.connector.connect(self.server_name.clone(), tcp).await
    }
}

/// Extract the host part of a `host:port` address, unwrapping IPv6 brackets
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Accepts any upstream certificate
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("proxy.example:443"), "proxy.example");
        assert_eq!(host_of("10.0.0.1:8443"), "10.0.0.1");
        assert_eq!(host_of("[::1]:443"), "::1");
    }

    #[test]
    fn test_sni_override_beats_proxy_host() {
        // The override is accepted even when the dial address is an IP.
        let client =
            TlsClient::new("10.0.0.1:443", Some("front.example"), TlsMode::Permissive).unwrap();
        assert_eq!(
            client.server_name,
            ServerName::try_from("front.example").unwrap()
        );
    }

    #[test]
    fn test_invalid_server_name_rejected() {
        let result = TlsClient::new("proxy.example:443", Some("bad name"), TlsMode::Permissive);
        assert!(matches!(result, Err(MuxtunError::InvalidConfig(_))));
    }
}
