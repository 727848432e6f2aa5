//! rustls configuration for the TLS client and TLS server roles.
//!
//! Certificates are either a static PEM pair loaded at startup, or a bundle
//! kept up to date on disk by an external certificate manager. The managed
//! source only ever serves the single configured domain.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default directory the certificate manager writes bundles into.
pub const DEFAULT_CERT_CACHE_DIR: &str = "certs";

/// TLS configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Where the TLS server role gets its certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertSource {
    /// PEM certificate chain and private key files.
    Static { cert: PathBuf, key: PathBuf },
    /// PEM bundle `<cache_dir>/<domain>` maintained by a certificate manager.
    Managed { domain: String, cache_dir: PathBuf },
}

impl CertSource {
    pub fn managed(domain: impl Into<String>) -> Self {
        Self::Managed {
            domain: domain.into(),
            cache_dir: PathBuf::from(DEFAULT_CERT_CACHE_DIR),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client configuration trusting the bundled web PKI roots.
pub fn client_config() -> Result<ClientConfig, TlsConfigError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    client_config_with_roots(roots)
}

/// Client configuration trusting exactly `roots`.
pub fn client_config_with_roots(roots: RootCertStore) -> Result<ClientConfig, TlsConfigError> {
    Ok(ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Server configuration for the given certificate source.
///
/// A static pair is loaded and validated immediately.
pub fn server_config(source: &CertSource) -> Result<ServerConfig, TlsConfigError> {
    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth();

    match source {
        CertSource::Static { cert, key } => {
            let certs = load_certs(cert)?;
            let key = load_private_key(key)?;
            info!(cert = %cert.display(), chain_len = certs.len(), "Loaded static certificate");
            Ok(builder.with_single_cert(certs, key)?)
        }
        CertSource::Managed { domain, cache_dir } => {
            info!(domain = %domain, cache_dir = %cache_dir.display(), "Using managed certificate");
            Ok(builder.with_cert_resolver(Arc::new(ManagedCertResolver::new(
                domain.clone(),
                cache_dir,
            ))))
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    fs::read(path).map_err(|source| TlsConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(pem: &[u8], path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8], path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    parse_certs(&read_file(path)?, path)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    parse_private_key(&read_file(path)?, path)
}

/// Serves the certificate manager's bundle for one whitelisted domain.
///
/// The bundle holds the private key and the certificate chain in PEM form.
/// It is re-read whenever its modification time changes, so renewals are
/// picked up without a restart.
#[derive(Debug)]
pub struct ManagedCertResolver {
    domain: String,
    bundle_path: PathBuf,
    provider: Arc<CryptoProvider>,
    cached: RwLock<Option<CachedKey>>,
}

#[derive(Debug)]
struct CachedKey {
    modified: Option<SystemTime>,
    key: Arc<CertifiedKey>,
}

impl ManagedCertResolver {
    pub fn new(domain: String, cache_dir: &Path) -> Self {
        let bundle_path = cache_dir.join(&domain);
        Self {
            domain,
            bundle_path,
            provider: provider(),
            cached: RwLock::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Current certificate, reloading the bundle if it changed on disk.
    pub fn current(&self) -> Result<Arc<CertifiedKey>, TlsConfigError> {
        let modified = fs::metadata(&self.bundle_path)
            .and_then(|m| m.modified())
            .ok();

        {
            let cached = self.cached.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cached.as_ref() {
                if modified.is_some() && cached.modified == modified {
                    return Ok(Arc::clone(&cached.key));
                }
            }
        }

        let key = Arc::new(self.load_bundle()?);
        debug!(bundle = %self.bundle_path.display(), "Loaded managed certificate bundle");

        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        *cached = Some(CachedKey {
            modified,
            key: Arc::clone(&key),
        });
        Ok(key)
    }

    fn load_bundle(&self) -> Result<CertifiedKey, TlsConfigError> {
        let pem = read_file(&self.bundle_path)?;
        let certs = parse_certs(&pem, &self.bundle_path)?;
        let key = parse_private_key(&pem, &self.bundle_path)?;
        let signing_key = self.provider.key_provider.load_private_key(key)?;
        Ok(CertifiedKey::new(certs, signing_key))
    }
}

impl ResolvesServerCert for ManagedCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let requested = client_hello.server_name().unwrap_or(&self.domain);
        if !requested.eq_ignore_ascii_case(&self.domain) {
            debug!(requested = %requested, domain = %self.domain, "Server name not whitelisted");
            return None;
        }

        match self.current() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(domain = %self.domain, error = %e, "Managed certificate unavailable");
                None
            }
        }
    }
}
