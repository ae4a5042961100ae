//! Service/Rule Cache
//!
//! Resolves a flow's `(destination IP, destination port, protocol)` to the
//! service it targets, caches the projection with a last-access stamp, and
//! remembers hashes of simple tokens that were already validated. The
//! classifier only sees it through [`ServiceLookup`] so tests can swap in a
//! fixed table.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ring::digest;

use crate::model::{AuthType, ClusterConfig, Protocol, ServiceId};

// ============================================================================
// Constants
// ============================================================================

/// Idle lifetime of a resolved service entry
pub const DEFAULT_SERVICE_TTL: Duration = Duration::from_secs(300);

/// Default lifetime of a remembered token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Interval between background sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed rate-limit window
const RATE_WINDOW: Duration = Duration::from_secs(1);

// ============================================================================
// Keys and Entries
// ============================================================================

/// Lookup key of a flow as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    /// IP protocol number
    pub protocol: u8,
}

impl FlowKey {
    pub fn new(dst_ip: Ipv4Addr, dst_port: u16, protocol: u8) -> Self {
        Self {
            dst_ip,
            dst_port,
            protocol,
        }
    }
}

/// Classifier-local projection of a service
#[derive(Debug, Clone, PartialEq)]
pub struct CachedService {
    pub service_id: ServiceId,
    pub name: String,
    pub auth_type: AuthType,
    pub requires_tls: bool,
    pub allows_websocket: bool,
    pub rate_limit_pps: u32,
    pub bandwidth_limit: u64,
    pub last_access: Instant,
}

/// A validated simple token, identified by its digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthToken {
    pub service_id: ServiceId,
    pub expires_at: Instant,
}

fn token_key(token: &str) -> u64 {
    let d = digest::digest(&digest::SHA256, token.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&d.as_ref()[..8]);
    u64::from_be_bytes(prefix)
}

// ============================================================================
// Traits
// ============================================================================

/// Read side used by the classifier
pub trait ServiceLookup: Send + Sync {
    fn lookup(&self, key: &FlowKey) -> Option<CachedService>;

    /// Whether `token` was validated for `service_id` and has not expired
    fn token_valid(&self, token: &str, service_id: ServiceId) -> bool;

    /// Count one packet from `src` and report whether it is within the limit
    fn check_rate(&self, service_id: ServiceId, src: Ipv4Addr, limit_pps: u32) -> bool;
}

/// Write side fed by the authenticator after a successful token check
pub trait TokenCache: Send + Sync {
    fn remember(&self, token: &str, service_id: ServiceId, ttl: Duration);
}

// ============================================================================
// Rule Cache
// ============================================================================

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Default [`ServiceLookup`] backed by a cluster snapshot
pub struct RuleCache {
    snapshot: RwLock<Arc<ClusterConfig>>,
    services: Mutex<HashMap<FlowKey, CachedService>>,
    tokens: Mutex<HashMap<u64, AuthToken>>,
    rates: Mutex<HashMap<(ServiceId, Ipv4Addr), RateWindow>>,
    service_ttl: Duration,
}

impl RuleCache {
    pub fn new(service_ttl: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(ClusterConfig::default())),
            services: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            rates: Mutex::new(HashMap::new()),
            service_ttl,
        }
    }

    pub fn with_snapshot(config: ClusterConfig, service_ttl: Duration) -> Self {
        let cache = Self::new(service_ttl);
        cache.update_snapshot(config);
        cache
    }

    /// Swap the snapshot and forget every resolved entry
    pub fn update_snapshot(&self, config: ClusterConfig) {
        let config = Arc::new(config);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        if let Ok(mut services) = self.services.lock() {
            services.clear();
        }
        if let Ok(mut rates) = self.rates.lock() {
            rates.clear();
        }
        log::debug!("Rule cache snapshot replaced");
    }

    pub fn snapshot(&self) -> Arc<ClusterConfig> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Number of resolved service entries
    pub fn service_count(&self) -> usize {
        self.services.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Drop idle service entries, expired tokens and stale rate windows
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;

        if let Ok(mut services) = self.services.lock() {
            let before = services.len();
            services.retain(|_, s| now.saturating_duration_since(s.last_access) <= self.service_ttl);
            removed += before - services.len();
        }

        if let Ok(mut tokens) = self.tokens.lock() {
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at > now);
            removed += before - tokens.len();
        }

        if let Ok(mut rates) = self.rates.lock() {
            rates.retain(|_, w| now.saturating_duration_since(w.started) < RATE_WINDOW);
        }

        if removed > 0 {
            log::debug!("Cache sweep removed {} entries", removed);
        }
        removed
    }

    fn resolve(config: &ClusterConfig, key: &FlowKey) -> Option<CachedService> {
        let protocol = Protocol::from_number(key.protocol);
        let ip = key.dst_ip.to_string();

        let service = config.services.iter().find(|svc| {
            svc.address == ip
                && config.mappings.iter().any(|m| {
                    if !m.dest_services.contains(&svc.id) {
                        return false;
                    }
                    // Portless protocols match on address alone
                    match protocol {
                        Some(Protocol::Icmp) | None => true,
                        Some(p) => m.supports(p) && m.port_spec().contains(key.dst_port, p),
                    }
                })
        })?;

        Some(CachedService {
            service_id: service.id,
            name: service.name.clone(),
            auth_type: service.auth_type,
            requires_tls: service.requires_tls,
            allows_websocket: service.allow_websocket,
            rate_limit_pps: service.rate_limit_pps,
            bandwidth_limit: service.bandwidth_limit,
            last_access: Instant::now(),
        })
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_TTL)
    }
}

impl ServiceLookup for RuleCache {
    fn lookup(&self, key: &FlowKey) -> Option<CachedService> {
        let now = Instant::now();
        let mut services = self.services.lock().ok()?;

        if let Some(entry) = services.get_mut(key) {
            entry.last_access = now;
            return Some(entry.clone());
        }

        let resolved = Self::resolve(&self.snapshot(), key)?;
        services.insert(*key, resolved.clone());
        Some(resolved)
    }

    fn token_valid(&self, token: &str, service_id: ServiceId) -> bool {
        let key = token_key(token);
        let Ok(tokens) = self.tokens.lock() else {
            return false;
        };
        tokens
            .get(&key)
            .map(|t| t.service_id == service_id && t.expires_at > Instant::now())
            .unwrap_or(false)
    }

    fn check_rate(&self, service_id: ServiceId, src: Ipv4Addr, limit_pps: u32) -> bool {
        if limit_pps == 0 {
            return true;
        }
        let now = Instant::now();
        let Ok(mut rates) = self.rates.lock() else {
            return true;
        };
        let window = rates.entry((service_id, src)).or_insert(RateWindow {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(window.started) >= RATE_WINDOW {
            window.started = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);
        window.count <= limit_pps
    }
}

impl TokenCache for RuleCache {
    fn remember(&self, token: &str, service_id: ServiceId, ttl: Duration) {
        let entry = AuthToken {
            service_id,
            expires_at: Instant::now() + ttl,
        };
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(token_key(token), entry);
        }
    }
}

// ============================================================================
// Background Sweeper
// ============================================================================

/// Thread that calls [`RuleCache::sweep`] at a fixed interval
pub struct CacheSweeper {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CacheSweeper {
    pub fn start(cache: Arc<RuleCache>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        // Sleep in short slices so stop() returns promptly
        let tick = interval.min(Duration::from_millis(100));

        let handle = thread::spawn(move || {
            let mut last = Instant::now();
            while !flag.load(Ordering::Relaxed) {
                thread::sleep(tick);
                if last.elapsed() >= interval {
                    cache.sweep(Instant::now());
                    last = Instant::now();
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
