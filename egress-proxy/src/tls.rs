//! TLS contexts and client certificate identity
//!
//! Builds the rustls server config for the listener (optionally verifying
//! client certificates against a CA bundle) and the client config for the
//! outbound leg. Identity is pulled from the verified leaf certificate:
//! subject CN, SAN DNS names and serial.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use x509_parser::prelude::*;

use crate::config::MtlsConfig;

// ============================================================================
// Peer Identity
// ============================================================================

/// Identity carried by a client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject CN, or the first SAN DNS name when the subject has none
    pub common_name: String,
    pub dns_names: Vec<String>,
    /// Hex serial, colon separated
    pub serial: String,
}

impl PeerIdentity {
    /// Parse a DER-encoded leaf certificate.
    pub fn from_der(der_cert: &[u8]) -> Result<Self, TlsError> {
        let (_, cert) = X509Certificate::from_der(der_cert)
            .map_err(|e| TlsError::Certificate(format!("{}", e)))?;

        let dns_names: Vec<String> = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_lowercase()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|s| s.to_string())
            .or_else(|| dns_names.first().cloned())
            .ok_or(TlsError::MissingCommonName)?;

        Ok(PeerIdentity {
            common_name,
            dns_names,
            serial: cert.raw_serial_as_string(),
        })
    }

    /// Identity of the first certificate in a presented chain
    pub fn from_chain(chain: Option<&[CertificateDer<'_>]>) -> Option<Result<Self, TlsError>> {
        chain
            .and_then(|certs| certs.first())
            .map(|leaf| Self::from_der(leaf.as_ref()))
    }

    /// Whether the CN or a SAN DNS name equals `name` (case-insensitive)
    pub fn names_service(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.common_name.eq_ignore_ascii_case(name)
            || self.dns_names.iter().any(|dns| dns.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// PEM Loading
// ============================================================================

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::Io(path.to_path_buf(), e))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(|e| TlsError::Io(path.to_path_buf(), e))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Io(path.to_path_buf(), e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ============================================================================
// Contexts
// ============================================================================

/// Listener and upstream TLS configuration
#[derive(Clone)]
pub struct TlsContext {
    server: Arc<ServerConfig>,
    client: Option<Arc<ClientConfig>>,
}

impl TlsContext {
    pub fn from_config(mtls: &MtlsConfig) -> Result<Self, TlsError> {
        let server = server_config(mtls)?;
        let client = match &mtls.upstream_ca_path {
            Some(ca) => Some(client_config(
                ca,
                mtls.client_cert_path.as_deref(),
                mtls.client_key_path.as_deref(),
            )?),
            None => {
                log::info!("No upstream CA configured; backend connections stay plain TCP");
                None
            }
        };
        Ok(TlsContext {
            server: Arc::new(server),
            client: client.map(Arc::new),
        })
    }

    pub fn new(server: Arc<ServerConfig>, client: Option<Arc<ClientConfig>>) -> Self {
        TlsContext { server, client }
    }

    pub fn accept(&self) -> Result<ServerConnection, TlsError> {
        Ok(ServerConnection::new(Arc::clone(&self.server))?)
    }

    /// Whether backend dials are wrapped in TLS
    pub fn has_upstream(&self) -> bool {
        self.client.is_some()
    }

    /// Client session for `host`, or `None` when upstream TLS is off
    pub fn connect(&self, host: &str) -> Option<Result<ClientConnection, TlsError>> {
        let config = self.client.as_ref()?;
        let name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(_) => return Some(Err(TlsError::InvalidServerName(host.to_string()))),
        };
        Some(ClientConnection::new(Arc::clone(config), name).map_err(TlsError::from))
    }
}

fn server_config(mtls: &MtlsConfig) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(&mtls.server_cert_path)?;
    let key = load_private_key(&mtls.server_key_path)?;

    let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;

    let verify = mtls.require_client_cert || mtls.verify_client_cert;
    let builder = match (&mtls.client_ca_path, verify) {
        (Some(ca), true) => {
            let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(ca)?), provider());
            if !mtls.require_client_cert {
                verifier = verifier.allow_unauthenticated();
            }
            let verifier = verifier
                .build()
                .map_err(|e| TlsError::Verifier(e.to_string()))?;
            log::info!(
                "Client certificates {} (CA: {})",
                if mtls.require_client_cert { "required" } else { "verified if presented" },
                ca.display()
            );
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(builder.with_single_cert(certs, key)?)
}

fn client_config(
    ca: &Path,
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<ClientConfig, TlsError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(load_roots(ca)?);

    let config = match (cert, key) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum TlsError {
    Io(PathBuf, io::Error),
    NoCertificates(PathBuf),
    NoPrivateKey(PathBuf),
    Rustls(rustls::Error),
    Verifier(String),
    InvalidServerName(String),
    /// DER could not be parsed
    Certificate(String),
    MissingCommonName,
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Io(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            TlsError::NoCertificates(path) => write!(f, "no certificates in {}", path.display()),
            TlsError::NoPrivateKey(path) => write!(f, "no private key in {}", path.display()),
            TlsError::Rustls(e) => write!(f, "TLS error: {}", e),
            TlsError::Verifier(msg) => write!(f, "client verifier: {}", msg),
            TlsError::InvalidServerName(name) => write!(f, "invalid server name '{}'", name),
            TlsError::Certificate(msg) => write!(f, "certificate parse error: {}", msg),
            TlsError::MissingCommonName => write!(f, "certificate has no Common Name or DNS name"),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Rustls(e)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::fs;

    fn build_cert(cn: Option<&str>, san_dns: &[&str]) -> (String, String, Vec<u8>) {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        match cn {
            Some(cn) => dn.push(DnType::CommonName, cn),
            None => dn.push(DnType::OrganizationName, "TestOrg"),
        }
        params.distinguished_name = dn;
        for dns in san_dns {
            params
                .subject_alt_names
                .push(SanType::DnsName(dns.to_string().try_into().unwrap()));
        }
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem(), cert.der().to_vec())
    }

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("egress-tls-{}-{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_identity_from_certificate() {
        let (_, _, der) = build_cert(Some("billing-client"), &["Billing.internal", "alt.internal"]);
        let identity = PeerIdentity::from_der(&der).unwrap();
        assert_eq!(identity.common_name, "billing-client");
        assert_eq!(identity.dns_names, vec!["billing.internal", "alt.internal"]);
        assert!(!identity.serial.is_empty());
        assert!(identity.names_service("billing.internal"));
        assert!(identity.names_service("BILLING-CLIENT"));
        assert!(!identity.names_service("other"));
        assert!(!identity.names_service(""));
    }

    #[test]
    fn test_identity_falls_back_to_dns_name() {
        let (_, _, der) = build_cert(None, &["svc.internal"]);
        let identity = PeerIdentity::from_der(&der).unwrap();
        assert_eq!(identity.common_name, "svc.internal");
    }

    #[test]
    fn test_identity_requires_some_name() {
        let (_, _, der) = build_cert(None, &[]);
        assert!(matches!(PeerIdentity::from_der(&der), Err(TlsError::MissingCommonName)));
    }

    #[test]
    fn test_identity_invalid_der() {
        assert!(matches!(
            PeerIdentity::from_der(b"not a certificate"),
            Err(TlsError::Certificate(_))
        ));
        assert!(PeerIdentity::from_chain(None).is_none());
    }

    #[test]
    fn test_context_from_pem_files() {
        let (cert_pem, key_pem, _) = build_cert(Some("proxy"), &["localhost"]);
        let cert = write_temp("server.pem", &cert_pem);
        let key = write_temp("server.key", &key_pem);

        let mtls = MtlsConfig {
            server_cert_path: cert.clone(),
            server_key_path: key.clone(),
            ..Default::default()
        };
        let ctx = TlsContext::from_config(&mtls).unwrap();
        assert!(!ctx.has_upstream());
        assert!(ctx.connect("localhost").is_none());
        assert!(ctx.accept().is_ok());

        // Verifying clients against the server's own cert as CA
        let mtls = MtlsConfig {
            client_ca_path: Some(cert.clone()),
            require_client_cert: true,
            upstream_ca_path: Some(cert.clone()),
            ..mtls
        };
        let ctx = TlsContext::from_config(&mtls).unwrap();
        assert!(ctx.has_upstream());
        assert!(matches!(ctx.connect("localhost"), Some(Ok(_))));

        let _ = fs::remove_file(cert);
        let _ = fs::remove_file(key);
    }

    #[test]
    fn test_missing_files_reported() {
        let mtls = MtlsConfig {
            server_cert_path: PathBuf::from("/nonexistent/cert.pem"),
            server_key_path: PathBuf::from("/nonexistent/key.pem"),
            ..Default::default()
        };
        assert!(matches!(TlsContext::from_config(&mtls), Err(TlsError::Io(_, _))));

        let empty = write_temp("empty.pem", "");
        assert!(matches!(load_certs(&empty), Err(TlsError::NoCertificates(_))));
        assert!(matches!(load_private_key(&empty), Err(TlsError::NoPrivateKey(_))));
        let _ = fs::remove_file(empty);
    }
}
