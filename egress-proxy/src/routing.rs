//! Routing table shared by the TCP and UDP proxies
//!
//! Holds the current cluster snapshot. Handlers take an `Arc` to it once, at
//! match time, and keep routing against that copy for the rest of the
//! connection; a swap only affects connections accepted afterwards.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};

use packet_classifier::{ClusterConfig, Mapping, Protocol, ServiceId};

// ============================================================================
// Backend
// ============================================================================

/// Destination chosen for a connection or datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub service_id: ServiceId,
    /// IP or FQDN as configured
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, RouteError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| RouteError::Unresolvable(self.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(RouteError::Unresolvable(self.to_string()));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (service {})", self.host, self.port, self.service_id)
    }
}

// ============================================================================
// Route Table
// ============================================================================

pub struct RouteTable {
    snapshot: RwLock<Arc<ClusterConfig>>,
}

impl RouteTable {
    pub fn new(config: ClusterConfig) -> Self {
        RouteTable {
            snapshot: RwLock::new(Arc::new(config)),
        }
    }

    /// Current snapshot; the lock is held only for the clone
    pub fn snapshot(&self) -> Arc<ClusterConfig> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, config: ClusterConfig) {
        log::info!(
            "Routing updated: {} services, {} mappings (version '{}')",
            config.services.len(),
            config.mappings.len(),
            config.version
        );
        let config = Arc::new(config);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

/// First mapping carrying `protocol`
pub fn select_mapping(config: &ClusterConfig, protocol: Protocol) -> Result<&Mapping, RouteError> {
    config
        .first_mapping(protocol)
        .ok_or(RouteError::NoMapping(protocol))
}

/// First destination of `mapping` known to the snapshot, with its port
pub fn select_backend(
    config: &ClusterConfig,
    mapping: &Mapping,
    protocol: Protocol,
) -> Result<Backend, RouteError> {
    let service = config
        .destination_for(mapping)
        .ok_or_else(|| RouteError::NoDestination(mapping.name.clone()))?;
    Ok(Backend {
        service_id: service.id,
        host: service.address.clone(),
        port: mapping.destination_port(protocol),
    })
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum RouteError {
    NoMapping(Protocol),
    /// None of the mapping's destinations exist in the snapshot
    NoDestination(String),
    Unresolvable(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::NoMapping(p) => write!(f, "no {} mapping", p),
            RouteError::NoDestination(m) => write!(f, "mapping '{}' has no known destination", m),
            RouteError::Unresolvable(b) => write!(f, "cannot resolve {}", b),
        }
    }
}

impl std::error::Error for RouteError {}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_classifier::Service;

    fn config(dest_addr: &str) -> ClusterConfig {
        ClusterConfig {
            services: vec![Service {
                id: 5,
                address: dest_addr.to_string(),
                ..Default::default()
            }],
            mappings: vec![
                Mapping {
                    name: "dns".to_string(),
                    dest_services: vec![5],
                    protocols: vec![Protocol::Udp],
                    ..Default::default()
                },
                Mapping {
                    name: "web".to_string(),
                    dest_services: vec![404, 5],
                    protocols: vec![Protocol::Tcp],
                    ports: "8443,9443".to_string(),
                    ..Default::default()
                },
                Mapping {
                    name: "shadowed".to_string(),
                    dest_services: vec![5],
                    protocols: vec![Protocol::Tcp],
                    ports: "1".to_string(),
                    ..Default::default()
                },
            ],
            version: "3".to_string(),
        }
    }

    #[test]
    fn test_first_match_wins() {
        let cfg = config("127.0.0.1");
        assert_eq!(select_mapping(&cfg, Protocol::Tcp).unwrap().name, "web");
        assert_eq!(select_mapping(&cfg, Protocol::Udp).unwrap().name, "dns");
        assert_eq!(
            select_mapping(&cfg, Protocol::Icmp),
            Err(RouteError::NoMapping(Protocol::Icmp))
        );
    }

    #[test]
    fn test_backend_selection() {
        let cfg = config("127.0.0.1");
        let web = select_mapping(&cfg, Protocol::Tcp).unwrap();
        let backend = select_backend(&cfg, web, Protocol::Tcp).unwrap();
        assert_eq!(backend.service_id, 5);
        assert_eq!(backend.port, 8443);
        assert_eq!(backend.resolve().unwrap()[0], "127.0.0.1:8443".parse::<SocketAddr>().unwrap());

        let dns = select_mapping(&cfg, Protocol::Udp).unwrap();
        assert_eq!(select_backend(&cfg, dns, Protocol::Udp).unwrap().port, 53);

        let orphan = Mapping {
            name: "orphan".to_string(),
            dest_services: vec![404],
            ..Default::default()
        };
        assert_eq!(
            select_backend(&cfg, &orphan, Protocol::Tcp),
            Err(RouteError::NoDestination("orphan".to_string()))
        );
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let table = RouteTable::new(config("127.0.0.1"));
        let held = table.snapshot();
        table.replace(ClusterConfig::default());
        assert_eq!(held.mappings.len(), 3);
        assert!(table.snapshot().mappings.is_empty());
    }
}
