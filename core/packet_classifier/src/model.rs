//! Cluster configuration model
//!
//! Services, mappings and the snapshot that carries them. Field names follow
//! the control plane's JSON so a snapshot can be deserialized as delivered.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Destination port used by TCP mappings with an empty or unparseable port spec
pub const DEFAULT_TCP_PORT: u16 = 80;

/// Destination port used by UDP mappings with an empty or unparseable port spec
pub const DEFAULT_UDP_PORT: u16 = 53;

/// Service ID as assigned by the control plane
pub type ServiceId = u32;

// ============================================================================
// Protocol
// ============================================================================

/// Transport protocol named by a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// IP protocol number
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp => 1,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            1 => Some(Protocol::Icmp),
            _ => None,
        }
    }

    /// Fallback destination port when a mapping's port spec gives none
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp => DEFAULT_UDP_PORT,
            _ => DEFAULT_TCP_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

// ============================================================================
// Auth Type
// ============================================================================

/// Authentication a service demands from its callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    #[serde(rename = "none")]
    None,
    /// Shared secret presented verbatim (stored Base64 by the control plane)
    #[serde(rename = "base64", alias = "base64-token", alias = "simple-token")]
    Base64Token,
    #[serde(rename = "jwt")]
    Jwt,
    /// Identity taken from the peer's client certificate
    #[serde(rename = "tls")]
    Tls,
    /// Anything the fast path cannot evaluate
    #[serde(rename = "complex")]
    Complex,
}

impl AuthType {
    /// Whether a cached token is enough to admit traffic without userspace
    pub fn is_simple(self) -> bool {
        matches!(self, AuthType::None | AuthType::Base64Token)
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthType::None => "none",
            AuthType::Base64Token => "base64",
            AuthType::Jwt => "jwt",
            AuthType::Tls => "tls",
            AuthType::Complex => "complex",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Service
// ============================================================================

/// A routable backend or caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    #[serde(default)]
    pub name: String,
    /// IP address or FQDN
    #[serde(rename = "ip_fqdn", default)]
    pub address: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub auth_type: AuthType,
    /// Shared secret for `base64` services
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt_secret: String,
    /// JWT lifetime in seconds; 0 means the one hour default
    #[serde(default)]
    pub jwt_expiry: u64,
    /// TLS must be terminated in userspace
    #[serde(default)]
    pub requires_tls: bool,
    #[serde(default)]
    pub allow_websocket: bool,
    /// Packets per second per source, 0 = unlimited
    #[serde(default)]
    pub rate_limit_pps: u32,
    /// Bytes per second, 0 = unlimited
    #[serde(default)]
    pub bandwidth_limit: u64,
}

// ============================================================================
// Port Spec
// ============================================================================

/// Parsed form of a mapping's `ports` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// Empty field: the protocol's well-known port
    Default,
    Single(u16),
    List(Vec<u16>),
    Range(u16, u16),
    /// Present but unparseable; treated like `Default`
    Invalid,
}

impl PortSpec {
    pub fn parse(spec: &str) -> PortSpec {
        let spec = spec.trim();
        if spec.is_empty() {
            return PortSpec::Default;
        }

        if let Some((start, end)) = spec.split_once('-') {
            return match (start.trim().parse::<u16>(), end.trim().parse::<u16>()) {
                (Ok(s), Ok(e)) if s <= e => PortSpec::Range(s, e),
                _ => PortSpec::Invalid,
            };
        }

        if spec.contains(',') {
            let ports: Result<Vec<u16>, _> =
                spec.split(',').map(|p| p.trim().parse::<u16>()).collect();
            return match ports {
                Ok(ports) if !ports.is_empty() => PortSpec::List(ports),
                _ => PortSpec::Invalid,
            };
        }

        match spec.parse::<u16>() {
            Ok(port) => PortSpec::Single(port),
            Err(_) => PortSpec::Invalid,
        }
    }

    /// First listed port (range start for a range), or the protocol default
    pub fn first(&self, protocol: Protocol) -> u16 {
        match self {
            PortSpec::Single(p) => *p,
            PortSpec::List(ports) => ports.first().copied().unwrap_or(protocol.default_port()),
            PortSpec::Range(start, _) => *start,
            PortSpec::Default | PortSpec::Invalid => protocol.default_port(),
        }
    }

    pub fn contains(&self, port: u16, protocol: Protocol) -> bool {
        match self {
            PortSpec::Single(p) => *p == port,
            PortSpec::List(ports) => ports.contains(&port),
            PortSpec::Range(start, end) => (*start..=*end).contains(&port),
            PortSpec::Default | PortSpec::Invalid => port == protocol.default_port(),
        }
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// Routing rule from source services to destination services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_services: Vec<ServiceId>,
    #[serde(default)]
    pub dest_services: Vec<ServiceId>,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub auth_required: bool,
}

impl Mapping {
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }

    pub fn port_spec(&self) -> PortSpec {
        PortSpec::parse(&self.ports)
    }

    /// Destination port for `protocol`: single port, first list entry, or default
    ///
    /// A list with a bad entry further along still yields its first entry.
    pub fn destination_port(&self, protocol: Protocol) -> u16 {
        match self.port_spec() {
            PortSpec::Invalid => self
                .ports
                .split(',')
                .next()
                .and_then(|first| first.trim().parse::<u16>().ok())
                .unwrap_or(protocol.default_port()),
            spec => spec.first(protocol),
        }
    }

    pub fn allows_source(&self, service_id: ServiceId) -> bool {
        self.source_services.contains(&service_id)
    }

    /// An authenticated mapping must name at least one caller
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.auth_required && self.source_services.is_empty() {
            return Err(ModelError::AuthWithoutSources {
                mapping: self.name.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Cluster Config
// ============================================================================

/// Configuration snapshot delivered by the control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(default)]
    pub version: String,
}

impl ClusterConfig {
    pub fn from_json(data: &str) -> Result<Self, ModelError> {
        serde_json::from_str(data).map_err(|e| ModelError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        self.mappings.iter().try_for_each(Mapping::validate)
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    /// First mapping, in configuration order, that carries `protocol`
    pub fn first_mapping(&self, protocol: Protocol) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.supports(protocol))
    }

    /// First destination of `mapping` present in this snapshot
    pub fn destination_for(&self, mapping: &Mapping) -> Option<&Service> {
        mapping.dest_services.iter().find_map(|id| self.service(*id))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ModelError {
    /// Snapshot JSON could not be decoded
    Parse(String),
    /// `auth_required` set on a mapping with no source services
    AuthWithoutSources { mapping: String },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Parse(msg) => write!(f, "invalid cluster config: {}", msg),
            ModelError::AuthWithoutSources { mapping } => write!(
                f,
                "mapping '{}' requires authentication but has no source services",
                mapping
            ),
        }
    }
}

impl std::error::Error for ModelError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec_forms() {
        assert_eq!(PortSpec::parse(""), PortSpec::Default);
        assert_eq!(PortSpec::parse("443"), PortSpec::Single(443));
        assert_eq!(PortSpec::parse("80, 443,8080"), PortSpec::List(vec![80, 443, 8080]));
        assert_eq!(PortSpec::parse("8000-8100"), PortSpec::Range(8000, 8100));
        assert_eq!(PortSpec::parse("http"), PortSpec::Invalid);
        assert_eq!(PortSpec::parse("9000-8000"), PortSpec::Invalid);
    }

    #[test]
    fn test_destination_port_defaults() {
        let mut mapping = Mapping::default();
        assert_eq!(mapping.destination_port(Protocol::Tcp), 80);
        assert_eq!(mapping.destination_port(Protocol::Udp), 53);

        mapping.ports = "garbage".to_string();
        assert_eq!(mapping.destination_port(Protocol::Tcp), 80);
        assert_eq!(mapping.destination_port(Protocol::Udp), 53);

        mapping.ports = "5432,5433".to_string();
        assert_eq!(mapping.destination_port(Protocol::Tcp), 5432);

        mapping.ports = "9000-9010".to_string();
        assert_eq!(mapping.destination_port(Protocol::Udp), 9000);
    }

    #[test]
    fn test_destination_port_takes_first_list_entry() {
        let mut mapping = Mapping {
            ports: "5432,abc".to_string(),
            ..Default::default()
        };
        assert_eq!(mapping.port_spec(), PortSpec::Invalid);
        assert_eq!(mapping.destination_port(Protocol::Tcp), 5432);
        // Matching still treats the whole field as unparseable
        assert!(!mapping.port_spec().contains(5432, Protocol::Tcp));

        mapping.ports = " 6379 , ".to_string();
        assert_eq!(mapping.destination_port(Protocol::Tcp), 6379);

        mapping.ports = "abc,5432".to_string();
        assert_eq!(mapping.destination_port(Protocol::Tcp), 80);
        assert_eq!(mapping.destination_port(Protocol::Udp), 53);
    }

    #[test]
    fn test_port_spec_contains() {
        assert!(PortSpec::parse("").contains(80, Protocol::Tcp));
        assert!(PortSpec::parse("").contains(53, Protocol::Udp));
        assert!(!PortSpec::parse("").contains(53, Protocol::Tcp));
        assert!(PortSpec::parse("8000-8100").contains(8050, Protocol::Tcp));
        assert!(!PortSpec::parse("8000-8100").contains(8101, Protocol::Tcp));
        assert!(PortSpec::parse("80,443").contains(443, Protocol::Tcp));
    }

    #[test]
    fn test_mapping_auth_requires_sources() {
        let mapping = Mapping {
            name: "locked".to_string(),
            auth_required: true,
            ..Default::default()
        };
        assert!(matches!(
            mapping.validate(),
            Err(ModelError::AuthWithoutSources { .. })
        ));

        let mapping = Mapping {
            source_services: vec![1],
            ..mapping
        };
        assert!(mapping.validate().is_ok());
    }

    #[test]
    fn test_cluster_config_from_control_plane_json() {
        let json = r#"{
            "services": [
                {"id": 42, "name": "billing", "ip_fqdn": "10.0.0.5", "auth_type": "base64", "auth_token": "c2VjcmV0"},
                {"id": 7, "name": "api", "ip_fqdn": "api.internal", "auth_type": "jwt", "jwt_secret": "k", "jwt_expiry": 600}
            ],
            "mappings": [
                {"id": 1, "name": "dns", "source_services": [42], "dest_services": [7], "protocols": ["udp"], "ports": ""},
                {"id": 2, "name": "web", "source_services": [42], "dest_services": [99, 7], "protocols": ["tcp"], "ports": "8443", "auth_required": true}
            ]
        }"#;
        let config = ClusterConfig::from_json(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.service(42).unwrap().auth_type, AuthType::Base64Token);
        assert_eq!(config.service(7).unwrap().jwt_expiry, 600);

        let tcp = config.first_mapping(Protocol::Tcp).unwrap();
        assert_eq!(tcp.name, "web");
        // 99 is unknown, so the first resolvable destination wins
        assert_eq!(config.destination_for(tcp).unwrap().id, 7);
        assert_eq!(tcp.destination_port(Protocol::Tcp), 8443);

        let udp = config.first_mapping(Protocol::Udp).unwrap();
        assert_eq!(udp.destination_port(Protocol::Udp), 53);
    }

    #[test]
    fn test_auth_type_aliases() {
        let t: AuthType = serde_json::from_str("\"base64-token\"").unwrap();
        assert_eq!(t, AuthType::Base64Token);
        let t: AuthType = serde_json::from_str("\"tls\"").unwrap();
        assert_eq!(t, AuthType::Tls);
        assert!(AuthType::Base64Token.is_simple());
        assert!(!AuthType::Jwt.is_simple());
    }
}
