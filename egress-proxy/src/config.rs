//! Process configuration
//!
//! `ProxyConfig` is read from a JSON file where every field is optional;
//! command-line flags override it in the binary. The cluster snapshot lives
//! in its own file and is reloaded on SIGHUP.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use packet_classifier::{ClusterConfig, ModelError, DEFAULT_SERVICE_TTL, DEFAULT_TOKEN_TTL};
use serde::Deserialize;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// UDP listens this far above the TCP port unless configured
pub const UDP_PORT_OFFSET: u16 = 1000;

pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_UDP_REPLY_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CACHE_TTL_SECS: u64 = DEFAULT_SERVICE_TTL.as_secs();
pub const DEFAULT_AUTH_TOKEN_TTL_SECS: u64 = DEFAULT_TOKEN_TTL.as_secs();

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}
fn default_auth_timeout() -> u64 {
    DEFAULT_AUTH_TIMEOUT_SECS
}
fn default_tls_handshake_timeout() -> u64 {
    DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_udp_reply_timeout() -> u64 {
    DEFAULT_UDP_REPLY_TIMEOUT_SECS
}
fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}
fn default_auth_token_ttl() -> u64 {
    DEFAULT_AUTH_TOKEN_TTL_SECS
}
fn default_true() -> bool {
    true
}

// ============================================================================
// Proxy Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Derived from `listen_addr` when absent
    #[serde(default)]
    pub udp_listen_addr: Option<String>,
    #[serde(default)]
    pub cluster_config_path: Option<PathBuf>,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_udp_reply_timeout")]
    pub udp_reply_timeout_secs: u64,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_auth_token_ttl")]
    pub auth_token_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub deep_inspection: bool,
    #[serde(default)]
    pub enable_acceleration: bool,
    #[serde(default)]
    pub mtls: Option<MtlsConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            udp_listen_addr: None,
            cluster_config_path: None,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            tls_handshake_timeout_secs: DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            udp_reply_timeout_secs: DEFAULT_UDP_REPLY_TIMEOUT_SECS,
            idle_timeout_secs: None,
            max_connections: None,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            auth_token_ttl_secs: DEFAULT_AUTH_TOKEN_TTL_SECS,
            deep_inspection: true,
            enable_acceleration: false,
            mtls: None,
        }
    }
}

/// Certificates for the TLS listener and the outbound leg
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MtlsConfig {
    pub server_cert_path: PathBuf,
    pub server_key_path: PathBuf,
    /// Trust anchors for client certificates
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
    #[serde(default)]
    pub require_client_cert: bool,
    #[serde(default)]
    pub verify_client_cert: bool,
    /// Trust anchors for backends; outbound TLS is off without it
    #[serde(default)]
    pub upstream_ca_path: Option<PathBuf>,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
}

impl ProxyConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: ProxyConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_socket_addr()?;
        self.udp_socket_addr()?;
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be at least 1".to_string()));
        }
        let timeouts = [
            ("auth_timeout_secs", Some(self.auth_timeout_secs)),
            ("tls_handshake_timeout_secs", Some(self.tls_handshake_timeout_secs)),
            ("connect_timeout_secs", Some(self.connect_timeout_secs)),
            ("udp_reply_timeout_secs", Some(self.udp_reply_timeout_secs)),
            ("idle_timeout_secs", self.idle_timeout_secs),
        ];
        // Socket deadlines reject a zero duration
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == Some(0)) {
            return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
        }
        if let Some(mtls) = &self.mtls {
            if mtls.require_client_cert && mtls.client_ca_path.is_none() {
                return Err(ConfigError::Invalid(
                    "require_client_cert needs client_ca_path".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", self.listen_addr)))
    }

    /// Explicit UDP address, or the TCP address with the port shifted up
    pub fn udp_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.udp_listen_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid UDP listen address '{}'", addr)));
        }
        let mut addr = self.listen_socket_addr()?;
        let port = addr.port().checked_add(UDP_PORT_OFFSET).ok_or_else(|| {
            ConfigError::Invalid(format!("cannot derive UDP port from {}", addr.port()))
        })?;
        addr.set_port(port);
        Ok(addr)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn udp_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_reply_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

// ============================================================================
// Cluster Snapshot
// ============================================================================

/// Read a cluster snapshot and check the mapping invariant
pub fn load_cluster_config(path: &Path) -> Result<ClusterConfig, ConfigError> {
    let data = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config = ClusterConfig::from_json(&data)?;
    config.validate()?;
    log::info!(
        "Loaded cluster config from {} ({} services, {} mappings)",
        path.display(),
        config.services.len(),
        config.mappings.len()
    );
    Ok(config)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Model(ModelError),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "cannot read {}: {}", path.display(), source),
            ConfigError::Parse(e) => write!(f, "invalid config: {}", e),
            ConfigError::Model(e) => write!(f, "{}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<ModelError> for ConfigError {
    fn from(e: ModelError) -> Self {
        ConfigError::Model(e)
    }
}
