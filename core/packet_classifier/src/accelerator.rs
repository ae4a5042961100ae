//! Offload capability
//!
//! Fast-path backends (XDP, AF_XDP, NIC offload) plug in behind
//! [`Accelerator`]. [`SoftwareAccelerator`] runs the classifier in process and
//! is the reference the hardware adapters are tested against.

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{FlowKey, RuleCache, ServiceLookup};
use crate::classifier::{ClassifierConfig, ClassifierStatsSnapshot, PacketClassifier, PacketDecision};
use crate::model::ClusterConfig;

/// Counters every backend reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcceleratorStats {
    pub packets_processed: u64,
    pub packets_passed: u64,
    pub packets_dropped: u64,
    pub packets_redirected: u64,
    pub services: u64,
    pub mappings: u64,
}

pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// Install a new rule set; replaces whatever was loaded before
    fn sync_rules(&self, config: &ClusterConfig);

    fn stats(&self) -> AcceleratorStats;

    /// Whether the backend forwards this flow itself, so userspace must not
    fn handles_flow(&self, _flow: &FlowKey) -> bool {
        false
    }
}

/// In-process accelerator built on [`PacketClassifier`]
pub struct SoftwareAccelerator {
    cache: Arc<RuleCache>,
    classifier: PacketClassifier,
    enabled: bool,
}

impl SoftwareAccelerator {
    pub fn new(cache: Arc<RuleCache>, config: ClassifierConfig, enabled: bool) -> Self {
        let lookup: Arc<dyn ServiceLookup> = cache.clone();
        Self {
            cache,
            classifier: PacketClassifier::new(lookup, config),
            enabled,
        }
    }

    pub fn classify(&self, frame: &[u8]) -> PacketDecision {
        self.classifier.classify(frame)
    }

    pub fn classifier_stats(&self) -> ClassifierStatsSnapshot {
        self.classifier.stats()
    }
}

impl Accelerator for SoftwareAccelerator {
    fn name(&self) -> &str {
        "software"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn sync_rules(&self, config: &ClusterConfig) {
        log::info!(
            "Syncing {} services and {} mappings into {} accelerator",
            config.services.len(),
            config.mappings.len(),
            self.name()
        );
        self.cache.update_snapshot(config.clone());
    }

    fn stats(&self) -> AcceleratorStats {
        let c = self.classifier.stats();
        let snapshot = self.cache.snapshot();
        AcceleratorStats {
            packets_processed: c.packets,
            packets_passed: c.fast_path + c.no_match,
            packets_dropped: c.policy_drops + c.malformed_drops,
            packets_redirected: c.redirected,
            services: snapshot.services.len() as u64,
            mappings: snapshot.mappings.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Action;
    use crate::model::{Mapping, Protocol, Service};
    use std::net::Ipv4Addr;

    fn rules() -> ClusterConfig {
        ClusterConfig {
            services: vec![Service {
                id: 9,
                address: "10.1.1.1".to_string(),
                ..Default::default()
            }],
            mappings: vec![Mapping {
                dest_services: vec![9],
                protocols: vec![Protocol::Udp],
                ..Default::default()
            }],
            version: "7".to_string(),
        }
    }

    fn dns_frame() -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2([0; 6], [0; 6])
            .ipv4([10, 1, 1, 200], [10, 1, 1, 1], 64)
            .udp(5353, 53);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"lookup").unwrap();
        frame
    }

    #[test]
    fn test_sync_rules_changes_decisions() {
        let accel = SoftwareAccelerator::new(
            Arc::new(RuleCache::default()),
            ClassifierConfig::default(),
            true,
        );
        assert_eq!(accel.classify(&dns_frame()).reason, "no service match");

        accel.sync_rules(&rules());
        let decision = accel.classify(&dns_frame());
        assert_eq!(decision.action, Action::Pass);
        assert_eq!(decision.service_id, Some(9));

        let stats = accel.stats();
        assert_eq!(stats.packets_processed, 2);
        assert_eq!(stats.packets_passed, 2);
        assert_eq!(stats.services, 1);
        assert_eq!(stats.mappings, 1);
    }

    #[test]
    fn test_software_never_claims_flows() {
        let accel = SoftwareAccelerator::new(
            Arc::new(RuleCache::default()),
            ClassifierConfig::default(),
            true,
        );
        accel.sync_rules(&rules());
        let flow = FlowKey::new(Ipv4Addr::new(10, 1, 1, 1), 53, 17);
        assert!(!accel.handles_flow(&flow));
        assert_eq!(accel.name(), "software");
    }
}
