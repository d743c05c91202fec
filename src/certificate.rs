//! Per-host certificate provisioning
//!
//! Every hostname seen at handshake time gets its own self-signed identity.
//! Identities are generated once, written to the certificate store as
//! `<hostname>-key.pem` / `<hostname>-cert.pem`, and kept in memory as a
//! ready-to-serve [`CertifiedKey`].

use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, RcgenError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Validity of generated certificates, roughly two hundred years.
pub const CERT_VALIDITY_DAYS: i64 = 73_000;

/// Errors raised while provisioning an identity
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("hostname {0:?} cannot be used as a certificate store name")]
    InvalidHostname(String),

    #[error("certificate store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] RcgenError),

    #[error("invalid key material for {hostname}: {message}")]
    Material { hostname: String, message: String },
}

/// PEM encoded key and certificate, as produced by a generator or read from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMaterial {
    pub key_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
}

/// Capability that synthesizes a fresh key pair and certificate for a host.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self, hostname: &str) -> Result<IdentityMaterial, ProvisionError>;
}

/// Generates self-signed ECDSA P-256 / SHA-256 certificates with `rcgen`
#[derive(Debug, Clone)]
pub struct SelfSignedGenerator {
    validity_days: i64,
}

impl Default for SelfSignedGenerator {
    fn default() -> Self {
        Self {
            validity_days: CERT_VALIDITY_DAYS,
        }
    }
}

impl SelfSignedGenerator {
    /// Subject used for every generated certificate
    fn distinguished_name(hostname: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, "JP");
        dn.push(DnType::StateOrProvinceName, "Tokyo");
        dn.push(DnType::LocalityName, hostname);
        dn.push(DnType::OrganizationName, hostname);
        dn.push(DnType::OrganizationalUnitName, hostname);
        dn.push(DnType::CommonName, hostname);
        dn
    }
}

impl IdentityGenerator for SelfSignedGenerator {
    fn generate(&self, hostname: &str) -> Result<IdentityMaterial, ProvisionError> {
        let mut params = CertificateParams::new(vec![hostname.to_string()]);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.distinguished_name = Self::distinguished_name(hostname);

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(self.validity_days);

        let cert = Certificate::from_params(params)?;
        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();

        Ok(IdentityMaterial {
            key_pem: key_pem.into_bytes(),
            cert_pem: cert_pem.into_bytes(),
        })
    }
}

/// Directory of persisted per-host identities
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// Open the store, creating the directory if it does not exist yet
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, ProvisionError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| ProvisionError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reject hostnames that would escape the store or make odd file names
    fn validate_hostname(hostname: &str) -> Result<(), ProvisionError> {
        let unsafe_name = hostname.is_empty()
            || hostname == "."
            || hostname.contains("..")
            || hostname
                .chars()
                .any(|c| c == '/' || c == '\\' || c.is_control());

        if unsafe_name {
            return Err(ProvisionError::InvalidHostname(hostname.to_string()));
        }
        Ok(())
    }

    pub fn key_path(&self, hostname: &str) -> PathBuf {
        self.dir.join(format!("{}-key.pem", hostname))
    }

    pub fn cert_path(&self, hostname: &str) -> PathBuf {
        self.dir.join(format!("{}-cert.pem", hostname))
    }

    /// Read a previously persisted identity
    pub fn load(&self, hostname: &str) -> Result<IdentityMaterial, ProvisionError> {
        Self::validate_hostname(hostname)?;

        let read = |path: PathBuf| {
            fs::read(&path).map_err(|source| ProvisionError::Io { path, source })
        };

        Ok(IdentityMaterial {
            key_pem: read(self.key_path(hostname))?,
            cert_pem: read(self.cert_path(hostname))?,
        })
    }

    /// Persist an identity, key first
    pub fn save(&self, hostname: &str, material: &IdentityMaterial) -> Result<(), ProvisionError> {
        Self::validate_hostname(hostname)?;

        let write = |path: PathBuf, data: &[u8]| {
            fs::write(&path, data).map_err(|source| ProvisionError::Io { path, source })
        };

        write(self.key_path(hostname), &material.key_pem)?;
        write(self.cert_path(hostname), &material.cert_pem)
    }
}

/// A provisioned host identity, ready for the TLS layer
pub struct CertificateIdentity {
    pub hostname: String,
    pub material: IdentityMaterial,
    pub certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateIdentity")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

impl CertificateIdentity {
    /// Parse PEM material into a rustls certified key
    pub fn from_material(hostname: &str, material: IdentityMaterial) -> Result<Self, ProvisionError> {
        let invalid = |message: String| ProvisionError::Material {
            hostname: hostname.to_string(),
            message,
        };

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &material.cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("unreadable certificate PEM: {}", e)))?;

        if chain.is_empty() {
            return Err(invalid("no certificate found in PEM".to_string()));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &material.key_pem[..])
            .map_err(|e| invalid(format!("unreadable key PEM: {}", e)))?
            .ok_or_else(|| invalid("no private key found in PEM".to_string()))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            hostname: hostname.to_string(),
            material,
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }
}

/// Hands out server identities per hostname, generating them on first use
pub struct CertificateProvisioner {
    store: CertificateStore,
    generator: Arc<dyn IdentityGenerator>,
    cache: DashMap<String, Arc<CertificateIdentity>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateProvisioner {
    /// Create a provisioner backed by the self-signed `rcgen` generator
    pub fn new(store: CertificateStore) -> Self {
        Self::with_generator(store, Arc::new(SelfSignedGenerator::default()))
    }

    pub fn with_generator(store: CertificateStore, generator: Arc<dyn IdentityGenerator>) -> Self {
        Self {
            store,
            generator,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Cached identity for `hostname`, without touching the store
    pub fn cached(&self, hostname: &str) -> Option<Arc<CertificateIdentity>> {
        self.cache.get(hostname).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Return the identity for `hostname`, loading or generating it if needed.
    ///
    /// Concurrent callers for the same uncached hostname are serialized, so a
    /// hostname is generated at most once per process.
    pub fn obtain_identity(&self, hostname: &str) -> Result<Arc<CertificateIdentity>, ProvisionError> {
        if let Some(identity) = self.cached(hostname) {
            return Ok(identity);
        }

        let lock = self
            .in_flight
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();

        // Another caller may have finished while we waited
        let result = match self.cached(hostname) {
            Some(identity) => Ok(identity),
            None => self.provision(hostname),
        };

        // Drop the lock entry only when no other caller holds or waits on it
        self.in_flight
            .remove_if(hostname, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    fn provision(&self, hostname: &str) -> Result<Arc<CertificateIdentity>, ProvisionError> {
        let material = match self.store.load(hostname) {
            Ok(material) => {
                debug!("Loaded stored certificate for {}", hostname);
                material
            }
            Err(ProvisionError::InvalidHostname(name)) => {
                warn!("Refusing to provision certificate for {:?}", name);
                return Err(ProvisionError::InvalidHostname(name));
            }
            Err(e) => {
                debug!("No usable stored certificate for {}: {}", hostname, e);
                let material = self.generator.generate(hostname)?;
                self.store.save(hostname, &material)?;
                info!("Generated self-signed certificate for: {}", hostname);
                material
            }
        };

        let identity = Arc::new(CertificateIdentity::from_material(hostname, material)?);
        self.cache.insert(hostname.to_string(), identity.clone());
        Ok(identity)
    }
}
