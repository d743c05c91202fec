//! Outbound HTTPS round trips to the origin server

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HOST;
use hyper::{HeaderMap, Request, StatusCode, Version};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Port every intercepted request is forwarded to
pub const UPSTREAM_PORT: u16 = 443;

/// How the proxy checks the certificate presented by the origin server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamVerification {
    /// Verify against the bundled web PKI roots, using the `Host` name
    #[default]
    WebPki,
    /// Accept any certificate
    Insecure,
}

/// A fully buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("HTTP exchange with {addr} failed: {source}")]
    Http {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Message of the underlying failure, without the proxy's own context
    pub fn message(&self) -> String {
        match self {
            UpstreamError::Connect { source, .. } | UpstreamError::Tls { source, .. } => {
                source.to_string()
            }
            UpstreamError::Http { source, .. } => source.to_string(),
            UpstreamError::Timeout(_) => self.to_string(),
        }
    }
}

/// Performs a single request against an upstream address.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        addr: Ipv4Addr,
        request: Request<Full<Bytes>>,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// TLS client configuration for upstream connections, HTTP/1.1 only
pub fn client_config(verification: UpstreamVerification) -> ClientConfig {
    let mut config = match verification {
        UpstreamVerification::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        UpstreamVerification::Insecure => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Name to verify the upstream certificate against.
///
/// The `Host` header names the site; when it is missing or not a valid
/// server name the resolved address is used instead.
fn verification_name<B>(request: &Request<B>, addr: Ipv4Addr) -> ServerName<'static> {
    request
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(strip_port)
        .and_then(|host| ServerName::try_from(host.to_string()).ok())
        .unwrap_or_else(|| ServerName::IpAddress(IpAddr::V4(addr).into()))
}

/// `example.test:8443` -> `example.test`
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Upstream client that opens one TLS connection per request
pub struct HttpsUpstream {
    connector: TlsConnector,
    port: u16,
    timeout: Option<Duration>,
}

impl HttpsUpstream {
    pub fn new(verification: UpstreamVerification) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(client_config(verification))),
            port: UPSTREAM_PORT,
            timeout: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(
        &self,
        addr: SocketAddr,
        server_name: ServerName<'static>,
        request: Request<Full<Bytes>>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| UpstreamError::Connect { addr, source })?;

        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|source| UpstreamError::Tls { addr, source })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|source| UpstreamError::Http { addr, source })?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection error: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|source| UpstreamError::Http { addr, source })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|source| UpstreamError::Http { addr, source })?
            .to_bytes();

        Ok(UpstreamResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }
}

#[async_trait]
impl Upstream for HttpsUpstream {
    async fn send(
        &self,
        addr: Ipv4Addr,
        request: Request<Full<Bytes>>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let server_name = verification_name(&request, addr);
        let socket_addr = SocketAddr::from((addr, self.port));

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(socket_addr, server_name, request))
                .await
                .map_err(|_| UpstreamError::Timeout(limit))?,
            None => self.exchange(socket_addr, server_name, request).await,
        }
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.test"), "example.test");
        assert_eq!(strip_port("example.test:8443"), "example.test");
        assert_eq!(strip_port("example.test:"), "example.test");
        assert_eq!(strip_port(":443"), ":443");
    }

    #[test]
    fn test_verification_name_prefers_host_header() {
        let addr = Ipv4Addr::new(203, 0, 113, 5);
        let req = Request::builder()
            .header(HOST, "example.test:443")
            .body(())
            .unwrap();
        assert_eq!(
            verification_name(&req, addr),
            ServerName::try_from("example.test").unwrap()
        );

        let no_host = Request::builder().body(()).unwrap();
        assert_eq!(
            verification_name(&no_host, addr),
            ServerName::IpAddress(IpAddr::V4(addr).into())
        );
    }

    #[test]
    fn test_client_configs_force_http1() {
        for verification in [UpstreamVerification::WebPki, UpstreamVerification::Insecure] {
            let config = client_config(verification);
            assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        }
    }

    #[tokio::test]
    async fn test_refused_connection_reports_io_message() {
        // Grab a free port and release it so nothing is listening there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let upstream = HttpsUpstream::new(UpstreamVerification::Insecure).with_port(port);
        let request = Request::builder()
            .uri("/")
            .header(HOST, "localhost")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = upstream.send(Ipv4Addr::LOCALHOST, request).await.unwrap_err();
        match &err {
            UpstreamError::Connect { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
                assert_eq!(err.message(), source.to_string());
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
