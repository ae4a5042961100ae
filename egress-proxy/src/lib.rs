//! Egress Proxy
//!
//! Userspace half of the egress dataplane:
//! - TCP proxy with the in-band `SERVICE_ID:TOKEN` handshake and optional mTLS
//! - Stateless UDP relay
//! - Service authentication (shared token, HS256 JWT, client certificate)
//! - Atomic metrics rendered for Prometheus

pub mod auth;
pub mod config;
pub mod jwt;
pub mod metrics;
pub mod relay;
pub mod routing;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use auth::{AuthError, Authenticator, Credentials};
pub use config::{ConfigError, MtlsConfig, ProxyConfig};
pub use metrics::Metrics;
pub use tcp::{ProxyError, TcpOptions, TcpProxy, TcpProxyHandle};
pub use tls::{PeerIdentity, TlsContext, TlsError};
pub use udp::{UdpProxy, UdpProxyHandle};
