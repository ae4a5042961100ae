//! Packet Classifier
//!
//! Decides, for one raw Ethernet frame, whether the fast path may forward it,
//! must drop it, or has to hand it to the userspace proxy. This is the
//! reference behaviour that offload backends reproduce in-kernel or in-NIC.
//!
//! # Decision order
//!
//! 1. Frame sanity: Ethernet + IPv4 with a complete transport header
//! 2. Service lookup on `dst ip:dst port:protocol` (miss passes)
//! 3. Per-source rate limit
//! 4. Protocol handling (TLS/HTTP inspection for TCP, auth for UDP)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use serde::Serialize;
use serde_json::Value;

use crate::cache::{CachedService, FlowKey, ServiceLookup};
use crate::http::{self, HttpRequestInfo};
use crate::model::{AuthType, ServiceId};

// ============================================================================
// Constants
// ============================================================================

const ETHERNET_HEADER_LEN: usize = 14;

/// Ethernet header plus a minimal IPv4 header
pub const MIN_FRAME_LEN: usize = 34;

const ETHERTYPE_IPV4: u16 = 0x0800;

const IPV4_MIN_HEADER_LEN: usize = 20;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ICMP_HEADER_LEN: usize = 8;

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

// ============================================================================
// Decision
// ============================================================================

/// What the fast path does with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pass,
    Drop,
    /// Hand to the userspace proxy
    Redirect,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Pass => write!(f, "pass"),
            Action::Drop => write!(f, "drop"),
            Action::Redirect => write!(f, "redirect-to-userspace"),
        }
    }
}

/// Verdict for a single packet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketDecision {
    pub action: Action,
    pub reason: &'static str,
    pub service_id: Option<ServiceId>,
    pub metadata: BTreeMap<&'static str, Value>,
}

impl PacketDecision {
    fn new(action: Action, reason: &'static str, service_id: Option<ServiceId>) -> Self {
        Self {
            action,
            reason,
            service_id,
            metadata: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key, value.into());
        self
    }
}

// ============================================================================
// Configuration and Statistics
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Parse HTTP request lines and headers in TCP payloads
    pub deep_inspection: bool,
    pub max_inspect_bytes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            deep_inspection: true,
            max_inspect_bytes: http::DEFAULT_MAX_INSPECT_BYTES,
        }
    }
}

#[derive(Debug, Default)]
struct ClassifierStats {
    packets: AtomicU64,
    fast_path: AtomicU64,
    redirected: AtomicU64,
    policy_drops: AtomicU64,
    malformed_drops: AtomicU64,
    rate_limited: AtomicU64,
    no_match: AtomicU64,
    tls_detected: AtomicU64,
    websocket_detected: AtomicU64,
    http_requests: AtomicU64,
    token_cache_hits: AtomicU64,
    http_methods: Mutex<HashMap<String, u64>>,
}

/// Point-in-time copy of the classifier counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierStatsSnapshot {
    pub packets: u64,
    pub fast_path: u64,
    pub redirected: u64,
    pub policy_drops: u64,
    pub malformed_drops: u64,
    pub rate_limited: u64,
    pub no_match: u64,
    pub tls_detected: u64,
    pub websocket_detected: u64,
    pub http_requests: u64,
    pub token_cache_hits: u64,
    pub http_methods: BTreeMap<String, u64>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// Frame Parsing
// ============================================================================

/// Transport-level view of a frame
#[derive(Debug)]
struct FrameInfo<'a> {
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    dst_port: u16,
    payload: &'a [u8],
}

#[derive(Debug)]
enum Parsed<'a> {
    Full(FrameInfo<'a>),
    /// Non-first IPv4 fragment, no transport header to look at
    Fragment,
}

#[derive(Debug, PartialEq, Eq)]
enum ParseError {
    /// Too short, not Ethernet/IPv4, or a broken IP header
    Invalid,
    /// IP header fine, transport header truncated or inconsistent
    Malformed,
}

fn parse_frame(frame: &[u8]) -> Result<Parsed<'_>, ParseError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(ParseError::Invalid);
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV4 {
        return Err(ParseError::Invalid);
    }

    let ip = &frame[ETHERNET_HEADER_LEN..];
    if ip[0] >> 4 != 4 {
        return Err(ParseError::Invalid);
    }
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER_LEN || ip.len() < ihl {
        return Err(ParseError::Invalid);
    }
    let total_len = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
    if total_len < ihl {
        return Err(ParseError::Invalid);
    }
    if ip.len() < total_len {
        return Err(ParseError::Malformed);
    }
    // Ethernet padding is not part of the datagram
    let ip = &ip[..total_len];

    let fragment_offset = u16::from_be_bytes([ip[6], ip[7]]) & 0x1fff;
    if fragment_offset != 0 {
        return Ok(Parsed::Fragment);
    }

    // Bounds-check the fixed transport header before handing off to etherparse
    let protocol = ip[9];
    let transport = &ip[ihl..];
    let needed = match protocol {
        PROTO_TCP => {
            if transport.len() < TCP_MIN_HEADER_LEN {
                return Err(ParseError::Malformed);
            }
            usize::from(transport[12] >> 4) * 4
        }
        PROTO_UDP => UDP_HEADER_LEN,
        PROTO_ICMP => ICMP_HEADER_LEN,
        _ => 0,
    };
    if transport.len() < needed || (protocol == PROTO_TCP && needed < TCP_MIN_HEADER_LEN) {
        return Err(ParseError::Malformed);
    }

    let sliced = SlicedPacket::from_ethernet(frame).map_err(|_| ParseError::Malformed)?;

    let (src_ip, dst_ip) = match &sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => (header.source_addr(), header.destination_addr()),
        _ => return Err(ParseError::Invalid),
    };

    let dst_port = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp.destination_port(),
        Some(TransportSlice::Udp(udp)) => udp.destination_port(),
        Some(_) => 0,
        None if protocol == PROTO_TCP || protocol == PROTO_UDP || protocol == PROTO_ICMP => {
            return Err(ParseError::Malformed)
        }
        None => 0,
    };

    Ok(Parsed::Full(FrameInfo {
        src_ip,
        dst_ip,
        protocol,
        dst_port,
        payload: sliced.payload,
    }))
}

// ============================================================================
// Classifier
// ============================================================================

pub struct PacketClassifier {
    lookup: Arc<dyn ServiceLookup>,
    config: ClassifierConfig,
    stats: ClassifierStats,
}

impl PacketClassifier {
    pub fn new(lookup: Arc<dyn ServiceLookup>, config: ClassifierConfig) -> Self {
        Self {
            lookup,
            config,
            stats: ClassifierStats::default(),
        }
    }

    /// Classify one raw Ethernet frame. Never panics on arbitrary input.
    pub fn classify(&self, frame: &[u8]) -> PacketDecision {
        bump(&self.stats.packets);

        let info = match parse_frame(frame) {
            Ok(Parsed::Full(info)) => info,
            Ok(Parsed::Fragment) => {
                bump(&self.stats.redirected);
                return PacketDecision::new(Action::Redirect, "fragmented packet", None);
            }
            Err(ParseError::Invalid) => {
                bump(&self.stats.malformed_drops);
                return PacketDecision::new(Action::Drop, "invalid packet", None);
            }
            Err(ParseError::Malformed) => {
                bump(&self.stats.malformed_drops);
                return PacketDecision::new(Action::Drop, "malformed packet", None);
            }
        };

        let key = FlowKey::new(info.dst_ip, info.dst_port, info.protocol);
        let Some(service) = self.lookup.lookup(&key) else {
            bump(&self.stats.no_match);
            log::trace!("No service for {}:{}/{}", info.dst_ip, info.dst_port, info.protocol);
            return PacketDecision::new(Action::Pass, "no service match", None);
        };

        if service.rate_limit_pps > 0
            && !self
                .lookup
                .check_rate(service.service_id, info.src_ip, service.rate_limit_pps)
        {
            bump(&self.stats.rate_limited);
            bump(&self.stats.policy_drops);
            return PacketDecision::new(Action::Drop, "rate limited", Some(service.service_id));
        }

        let decision = match info.protocol {
            PROTO_TCP => self.classify_tcp(&info, &service),
            PROTO_UDP => self.classify_udp(&service),
            PROTO_ICMP => PacketDecision::new(Action::Pass, "icmp", Some(service.service_id)),
            _ => PacketDecision::new(Action::Pass, "unknown protocol", Some(service.service_id)),
        };

        match decision.action {
            Action::Pass => bump(&self.stats.fast_path),
            Action::Redirect => bump(&self.stats.redirected),
            Action::Drop => bump(&self.stats.policy_drops),
        }
        decision
    }

    fn classify_tcp(&self, info: &FrameInfo<'_>, service: &CachedService) -> PacketDecision {
        let id = Some(service.service_id);

        if http::is_tls_handshake(info.payload) {
            bump(&self.stats.tls_detected);
            if service.requires_tls {
                return PacketDecision::new(Action::Redirect, "TLS termination required", id)
                    .with("tls", true);
            }
        }

        if self.config.deep_inspection && http::is_http(info.payload) {
            bump(&self.stats.http_requests);
            if let Some(request) = http::parse_request(info.payload, self.config.max_inspect_bytes)
            {
                if let Some(decision) = self.classify_http(&request, service) {
                    return decision;
                }
            }
        }

        PacketDecision::new(Action::Redirect, "complex processing", id)
    }

    /// `None` when the request has nothing fast-pathable and falls through
    fn classify_http(
        &self,
        request: &HttpRequestInfo,
        service: &CachedService,
    ) -> Option<PacketDecision> {
        let id = Some(service.service_id);

        if let Ok(mut methods) = self.stats.http_methods.lock() {
            *methods.entry(request.method.clone()).or_insert(0) += 1;
        }

        if request.is_websocket {
            bump(&self.stats.websocket_detected);
            let decision = if service.allows_websocket {
                PacketDecision::new(Action::Redirect, "WebSocket upgrade required", id)
                    .with("websocket", true)
                    .with("method", request.method.as_str())
            } else {
                PacketDecision::new(Action::Drop, "WebSocket not allowed", id)
            };
            return Some(decision);
        }

        if !service.auth_type.is_simple() {
            return Some(
                PacketDecision::new(Action::Redirect, "authentication required", id)
                    .with("auth", service.auth_type.to_string())
                    .with("method", request.method.as_str()),
            );
        }
        if service.auth_type == AuthType::Base64Token {
            let cached = request
                .bearer_token
                .as_deref()
                .map(|token| self.lookup.token_valid(token, service.service_id))
                .unwrap_or(false);
            if !cached {
                return Some(PacketDecision::new(Action::Drop, "authentication failed", id));
            }
            bump(&self.stats.token_cache_hits);
        }

        if request.is_fast_path_candidate() {
            return Some(
                PacketDecision::new(Action::Pass, "fast-path HTTP", id)
                    .with("method", request.method.as_str())
                    .with("fastpath", true),
            );
        }
        None
    }

    fn classify_udp(&self, service: &CachedService) -> PacketDecision {
        let id = Some(service.service_id);
        if service.auth_type == AuthType::None {
            PacketDecision::new(Action::Pass, "udp", id)
        } else {
            PacketDecision::new(Action::Redirect, "UDP authentication required", id)
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn stats(&self) -> ClassifierStatsSnapshot {
        let s = &self.stats;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let http_methods = s
            .http_methods
            .lock()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();

        ClassifierStatsSnapshot {
            packets: load(&s.packets),
            fast_path: load(&s.fast_path),
            redirected: load(&s.redirected),
            policy_drops: load(&s.policy_drops),
            malformed_drops: load(&s.malformed_drops),
            rate_limited: load(&s.rate_limited),
            no_match: load(&s.no_match),
            tls_detected: load(&s.tls_detected),
            websocket_detected: load(&s.websocket_detected),
            http_requests: load(&s.http_requests),
            token_cache_hits: load(&s.token_cache_hits),
            http_methods,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RuleCache;
    use crate::cache::TokenCache;
    use crate::model::{ClusterConfig, Mapping, Protocol, Service};
    use ring::rand::{SecureRandom, SystemRandom};
    use std::time::Duration;

    const CLIENT: [u8; 4] = [192, 168, 1, 10];
    const WEB: [u8; 4] = [10, 0, 0, 1];
    const LOCKED: [u8; 4] = [10, 0, 0, 2];
    const JWT: [u8; 4] = [10, 0, 0, 3];
    const LIMITED: [u8; 4] = [10, 0, 0, 4];

    fn service(id: u32, ip: [u8; 4]) -> Service {
        Service {
            id,
            name: format!("svc-{}", id),
            address: Ipv4Addr::from(ip).to_string(),
            ..Default::default()
        }
    }

    fn classifier() -> (PacketClassifier, Arc<RuleCache>) {
        let mut locked = service(2, LOCKED);
        locked.auth_type = AuthType::Base64Token;
        locked.requires_tls = true;
        let mut jwt = service(3, JWT);
        jwt.auth_type = AuthType::Jwt;
        let mut limited = service(4, LIMITED);
        limited.rate_limit_pps = 2;

        let config = ClusterConfig {
            services: vec![service(1, WEB), locked, jwt, limited],
            mappings: vec![
                Mapping {
                    dest_services: vec![1, 2, 3, 4],
                    protocols: vec![Protocol::Tcp, Protocol::Udp],
                    ports: "80,443".to_string(),
                    ..Default::default()
                },
                Mapping {
                    dest_services: vec![1, 2],
                    protocols: vec![Protocol::Udp],
                    ports: "53".to_string(),
                    ..Default::default()
                },
            ],
            version: String::new(),
        };
        let cache = Arc::new(RuleCache::with_snapshot(config, Duration::from_secs(300)));
        let lookup: Arc<dyn ServiceLookup> = cache.clone();
        (PacketClassifier::new(lookup, ClassifierConfig::default()), cache)
    }

    fn tcp_frame(dst: [u8; 4], port: u16, payload: &[u8]) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(CLIENT, dst, 64)
            .tcp(40000, port, 1, 65535);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn udp_frame(dst: [u8; 4], port: u16, payload: &[u8]) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(CLIENT, dst, 64)
            .udp(40000, port);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn icmp_frame(dst: [u8; 4]) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(CLIENT, dst, 64)
            .icmpv4_echo_request(1, 1);
        let mut frame = Vec::with_capacity(builder.size(4));
        builder.write(&mut frame, b"ping").unwrap();
        frame
    }

    #[test]
    fn test_http_get_fast_path() {
        let (c, _) = classifier();
        let d = c.classify(&tcp_frame(WEB, 80, b"GET /index.html HTTP/1.1\r\nHost: web\r\n\r\n"));
        assert_eq!(d.action, Action::Pass);
        assert_eq!(d.reason, "fast-path HTTP");
        assert_eq!(d.service_id, Some(1));
        assert_eq!(d.metadata.get("method"), Some(&Value::from("GET")));
        assert_eq!(d.metadata.get("fastpath"), Some(&Value::from(true)));
        assert_eq!(c.stats().http_methods.get("GET"), Some(&1));
    }

    #[test]
    fn test_websocket_blocked() {
        let (c, _) = classifier();
        let req = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let d = c.classify(&tcp_frame(WEB, 80, req));
        assert_eq!(d.action, Action::Drop);
        assert_eq!(d.reason, "WebSocket not allowed");
        assert_eq!(c.stats().websocket_detected, 1);
        assert_eq!(c.stats().policy_drops, 1);
    }

    #[test]
    fn test_websocket_upgrade_allowed() {
        let mut chat = service(5, [10, 0, 0, 5]);
        chat.allow_websocket = true;
        let config = ClusterConfig {
            services: vec![chat],
            mappings: vec![Mapping {
                dest_services: vec![5],
                protocols: vec![Protocol::Tcp],
                ports: "80".to_string(),
                ..Default::default()
            }],
            version: String::new(),
        };
        let lookup: Arc<dyn ServiceLookup> =
            Arc::new(RuleCache::with_snapshot(config, Duration::from_secs(300)));
        let c = PacketClassifier::new(lookup, ClassifierConfig::default());

        let req = b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let d = c.classify(&tcp_frame([10, 0, 0, 5], 80, req));
        assert_eq!(d.action, Action::Redirect);
        assert_eq!(d.reason, "WebSocket upgrade required");
        assert_eq!(d.service_id, Some(5));
        assert_eq!(d.metadata.get("websocket"), Some(&Value::from(true)));
        assert_eq!(d.metadata.get("method"), Some(&Value::from("GET")));
        assert_eq!(c.stats().websocket_detected, 1);
        assert_eq!(c.stats().redirected, 1);
    }

    #[test]
    fn test_other_ip_protocol_passes() {
        let (c, _) = classifier();
        // Rewrite a UDP frame's protocol to GRE (47); the checksum is not inspected
        let mut frame = udp_frame(WEB, 53, b"tunnel");
        frame[14 + 9] = 47;
        let d = c.classify(&frame);
        assert_eq!(d.action, Action::Pass);
        assert_eq!(d.reason, "unknown protocol");
        assert_eq!(d.service_id, Some(1));

        let mut frame = udp_frame([8, 8, 8, 8], 53, b"tunnel");
        frame[14 + 9] = 47;
        assert_eq!(c.classify(&frame).reason, "no service match");
    }

    #[test]
    fn test_unknown_destination_passes() {
        let (c, _) = classifier();
        let d = c.classify(&tcp_frame([8, 8, 8, 8], 80, b"GET / HTTP/1.1\r\n\r\n"));
        assert_eq!(d.action, Action::Pass);
        assert_eq!(d.reason, "no service match");
        assert_eq!(d.service_id, None);
        // Port outside the mapping is also a miss
        let d = c.classify(&tcp_frame(WEB, 8080, b""));
        assert_eq!(d.reason, "no service match");
    }

    #[test]
    fn test_tls_termination_redirect() {
        let (c, _) = classifier();
        let hello = [0x16, 0x03, 0x01, 0x00, 0x2f, 0x01, 0x00, 0x00];
        let d = c.classify(&tcp_frame(LOCKED, 443, &hello));
        assert_eq!(d.action, Action::Redirect);
        assert_eq!(d.reason, "TLS termination required");
        assert_eq!(d.metadata.get("tls"), Some(&Value::from(true)));

        // Same handshake to a service that does not terminate TLS
        let d = c.classify(&tcp_frame(WEB, 443, &hello));
        assert_eq!(d.reason, "complex processing");
        assert_eq!(c.stats().tls_detected, 2);
    }

    #[test]
    fn test_simple_token_requires_cached_token() {
        let (c, cache) = classifier();
        let req = b"GET / HTTP/1.1\r\nAuthorization: Bearer tok-1\r\n\r\n";

        let d = c.classify(&tcp_frame(LOCKED, 80, req));
        assert_eq!(d.action, Action::Drop);
        assert_eq!(d.reason, "authentication failed");

        cache.remember("tok-1", 2, Duration::from_secs(60));
        let d = c.classify(&tcp_frame(LOCKED, 80, req));
        assert_eq!(d.action, Action::Pass);
        assert_eq!(c.stats().token_cache_hits, 1);

        // A token cached for another service does not count
        cache.remember("tok-other", 1, Duration::from_secs(60));
        let req = b"GET / HTTP/1.1\r\nAuthorization: Bearer tok-other\r\n\r\n";
        assert_eq!(c.classify(&tcp_frame(LOCKED, 80, req)).action, Action::Drop);
    }

    #[test]
    fn test_jwt_service_redirects() {
        let (c, _) = classifier();
        let req = b"GET / HTTP/1.1\r\nAuthorization: Bearer a.b.c\r\n\r\n";
        let d = c.classify(&tcp_frame(JWT, 80, req));
        assert_eq!(d.action, Action::Redirect);
        assert_eq!(d.reason, "authentication required");
    }

    #[test]
    fn test_non_fast_path_http_redirects() {
        let (c, _) = classifier();
        let req = b"POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data\r\n\r\n";
        let d = c.classify(&tcp_frame(WEB, 80, req));
        assert_eq!(d.action, Action::Redirect);
        assert_eq!(d.reason, "complex processing");
    }

    #[test]
    fn test_deep_inspection_disabled() {
        let (_, cache) = classifier();
        let lookup: Arc<dyn ServiceLookup> = cache;
        let c = PacketClassifier::new(
            lookup,
            ClassifierConfig {
                deep_inspection: false,
                ..Default::default()
            },
        );
        let d = c.classify(&tcp_frame(WEB, 80, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert_eq!(d.action, Action::Redirect);
        assert_eq!(c.stats().http_requests, 0);
    }

    #[test]
    fn test_udp_and_icmp() {
        let (c, _) = classifier();
        assert_eq!(c.classify(&udp_frame(WEB, 53, b"query")).action, Action::Pass);

        let d = c.classify(&udp_frame(LOCKED, 53, b"query"));
        assert_eq!(d.action, Action::Redirect);
        assert_eq!(d.reason, "UDP authentication required");

        let d = c.classify(&icmp_frame(LOCKED));
        assert_eq!(d.action, Action::Pass);
        assert_eq!(d.service_id, Some(2));
    }

    #[test]
    fn test_rate_limit_drops() {
        let (c, _) = classifier();
        let frame = udp_frame(LIMITED, 80, b"x");
        assert_eq!(c.classify(&frame).action, Action::Pass);
        assert_eq!(c.classify(&frame).action, Action::Pass);
        let d = c.classify(&frame);
        assert_eq!(d.action, Action::Drop);
        assert_eq!(d.reason, "rate limited");
        assert_eq!(c.stats().rate_limited, 1);
    }

    #[test]
    fn test_non_ipv4_and_short_frames_invalid() {
        let (c, _) = classifier();
        let mut frame = tcp_frame(WEB, 80, b"");
        frame[12] = 0x86;
        frame[13] = 0xdd;
        let d = c.classify(&frame);
        assert_eq!(d.action, Action::Drop);
        assert_eq!(d.reason, "invalid packet");
        assert_eq!(c.classify(&[]).reason, "invalid packet");
        assert_eq!(c.stats().malformed_drops, 2);
    }

    #[test]
    fn test_fragment_redirected() {
        let (c, _) = classifier();
        let mut frame = udp_frame(WEB, 53, b"payload");
        // Fragment offset 185 (1480 bytes), no more fragments
        frame[20] = 0x00;
        frame[21] = 0xb9;
        let d = c.classify(&frame);
        assert_eq!(d.action, Action::Redirect);
        assert_eq!(d.reason, "fragmented packet");
    }

    #[test]
    fn test_truncated_frames_never_pass() {
        let (c, _) = classifier();
        let rng = SystemRandom::new();
        let frames = [
            tcp_frame(WEB, 80, b""),
            udp_frame(WEB, 53, b""),
            icmp_frame(WEB),
        ];

        for frame in frames.iter() {
            // Every cut inside the headers must be dropped
            for len in 0..frame.len() {
                let d = c.classify(&frame[..len]);
                assert_eq!(d.action, Action::Drop, "len {} of {}", len, frame.len());
            }
        }

        // Random garbage of random length never panics
        for _ in 0..500 {
            let mut len = [0u8; 1];
            rng.fill(&mut len).unwrap();
            let mut data = vec![0u8; usize::from(len[0])];
            rng.fill(&mut data).unwrap();
            let _ = c.classify(&data);
        }
    }

    #[test]
    fn test_classification_deterministic() {
        let (c, _) = classifier();
        let frames = [
            tcp_frame(WEB, 80, b"GET / HTTP/1.1\r\n\r\n"),
            tcp_frame(JWT, 443, b"\x16\x03\x01\x00\x10\x01"),
            udp_frame(LOCKED, 53, b"q"),
        ];
        for frame in frames.iter() {
            assert_eq!(c.classify(frame), c.classify(frame));
        }
    }
}
