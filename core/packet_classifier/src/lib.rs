//! Egress Packet Classifier
//!
//! Core of the egress dataplane offload decision:
//! - Cluster configuration model (services, mappings, port specs)
//! - Service/Rule Cache with token memo and TTL sweep
//! - TLS/HTTP sniffing and per-packet classification
//! - `Accelerator` capability for fast-path backends

// ============================================================================
// Modules
// ============================================================================

pub mod accelerator;
pub mod cache;
pub mod classifier;
pub mod http;
pub mod model;

pub use accelerator::{Accelerator, AcceleratorStats, SoftwareAccelerator};
pub use cache::{
    CacheSweeper, CachedService, FlowKey, RuleCache, ServiceLookup, TokenCache,
    DEFAULT_SERVICE_TTL, DEFAULT_SWEEP_INTERVAL, DEFAULT_TOKEN_TTL,
};
pub use classifier::{
    Action, ClassifierConfig, ClassifierStatsSnapshot, PacketClassifier, PacketDecision,
};
pub use model::{
    AuthType, ClusterConfig, Mapping, ModelError, PortSpec, Protocol, Service, ServiceId,
};
