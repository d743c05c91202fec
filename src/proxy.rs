//! TLS-terminating gateway
//! Accepts client connections, forges a certificate for the SNI hostname and
//! feeds the decrypted HTTP/1.1 stream into the request pipeline

use crate::certificate::{CertificateProvisioner, CertificateStore};
use crate::pipeline::Pipeline;
use crate::resolver::AddressResolver;
use crate::upstream::{HttpsUpstream, UpstreamVerification, UPSTREAM_PORT};
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub cert_dir: PathBuf,
    pub upstream_port: u16,
    pub upstream_verification: UpstreamVerification,
    pub upstream_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            cert_dir: PathBuf::from("./cert"),
            upstream_port: UPSTREAM_PORT,
            upstream_verification: UpstreamVerification::WebPki,
            upstream_timeout: None,
        }
    }
}

/// Picks the server certificate from the SNI name of each handshake
pub struct SniCertResolver {
    provisioner: Arc<CertificateProvisioner>,
}

impl SniCertResolver {
    pub fn new(provisioner: Arc<CertificateProvisioner>) -> Self {
        Self { provisioner }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("cached", &self.provisioner.len())
            .finish()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(hostname) = client_hello.server_name() else {
            warn!("Rejecting handshake without SNI");
            return None;
        };

        info!("SNI {}", hostname);

        match self.provisioner.obtain_identity(hostname) {
            Ok(identity) => Some(identity.certified_key.clone()),
            Err(e) => {
                error!("No certificate for {}: {}", hostname, e);
                None
            }
        }
    }
}

/// TLS acceptor presenting per-host certificates, HTTP/1.1 only
pub fn tls_acceptor(provisioner: Arc<CertificateProvisioner>) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(provisioner)));

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    provisioner: Arc<CertificateProvisioner>,
    pipeline: Arc<Pipeline>,
    acceptor: TlsAcceptor,
}

impl ProxyServer {
    /// Create a proxy server from explicitly built collaborators
    pub fn new(
        config: ProxyConfig,
        provisioner: Arc<CertificateProvisioner>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        let acceptor = tls_acceptor(provisioner.clone());
        Self {
            config,
            provisioner,
            pipeline,
            acceptor,
        }
    }

    /// Wire up the default collaborators: on-disk store, system DNS, HTTPS upstream
    pub fn from_config(config: ProxyConfig) -> Result<Self> {
        let store = CertificateStore::open(&config.cert_dir)
            .with_context(|| format!("cannot open certificate store {}", config.cert_dir.display()))?;
        let provisioner = Arc::new(CertificateProvisioner::new(store));

        let upstream = HttpsUpstream::new(config.upstream_verification)
            .with_port(config.upstream_port)
            .with_timeout(config.upstream_timeout);
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(AddressResolver::system()),
            Arc::new(upstream),
        ));

        Ok(Self::new(config, provisioner, pipeline))
    }

    pub fn provisioner(&self) -> &Arc<CertificateProvisioner> {
        &self.provisioner
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("cannot listen on {}", self.config.listen_addr))?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Interception proxy listening on {}", listener.local_addr()?);

        if self.config.upstream_verification == UpstreamVerification::Insecure {
            warn!("Upstream certificates are NOT verified");
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    // Out of descriptors and similar; the listener itself is fine
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Terminate TLS on one connection and serve its requests
    async fn handle_connection(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| anyhow!("TLS handshake with {} failed: {}", remote_addr, e))?;

        let pipeline = self.pipeline.clone();

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(
                TokioIo::new(tls),
                service_fn(move |req: Request<Incoming>| {
                    let pipeline = pipeline.clone();
                    async move { Ok::<_, Infallible>(pipeline.handle(req).await) }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }
}
