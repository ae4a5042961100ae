//! Lightweight Prometheus-compatible metrics for the egress proxy.
//!
//! Atomic counters shared by the TCP and UDP proxies and the authenticator.
//! Rendered in Prometheus text exposition format for an external exporter.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Accepted TCP connections (counter)
    pub tcp_connections_total: AtomicU64,
    /// TCP connections currently being handled (gauge)
    pub active_connections: AtomicU64,
    /// Datagrams received on the UDP listener (counter)
    pub udp_packets_total: AtomicU64,
    /// Bytes relayed in either direction, TCP and UDP (counter)
    pub bytes_transferred_total: AtomicU64,
    pub auth_success_total: AtomicU64,
    pub auth_failure_total: AtomicU64,
    /// Connections or datagrams with no usable mapping (counter)
    pub mapping_misses_total: AtomicU64,
    /// Backend resolve or dial failures (counter)
    pub backend_failures_total: AtomicU64,
    /// Connections closed because max_connections was reached (counter)
    pub rejected_at_limit_total: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tcp_connections_total: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            udp_packets_total: AtomicU64::new(0),
            bytes_transferred_total: AtomicU64::new(0),
            auth_success_total: AtomicU64::new(0),
            auth_failure_total: AtomicU64::new(0),
            mapping_misses_total: AtomicU64::new(0),
            backend_failures_total: AtomicU64::new(0),
            rejected_at_limit_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrement a gauge without wrapping below zero
    pub fn dec(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let series: [(&str, &str, &str, u64); 10] = [
            ("tcp_connections_total", "Total accepted TCP connections", "counter", self.tcp_connections_total.load(Ordering::Relaxed)),
            ("active_connections", "Current number of TCP connections being handled", "gauge", self.active_connections.load(Ordering::Relaxed)),
            ("udp_packets_total", "Total datagrams received", "counter", self.udp_packets_total.load(Ordering::Relaxed)),
            ("bytes_transferred_total", "Total bytes relayed in either direction", "counter", self.bytes_transferred_total.load(Ordering::Relaxed)),
            ("auth_success_total", "Total successful authentications", "counter", self.auth_success_total.load(Ordering::Relaxed)),
            ("auth_failure_total", "Total failed authentications", "counter", self.auth_failure_total.load(Ordering::Relaxed)),
            ("mapping_misses_total", "Total connections or datagrams with no matching mapping", "counter", self.mapping_misses_total.load(Ordering::Relaxed)),
            ("backend_failures_total", "Total backend resolve or dial failures", "counter", self.backend_failures_total.load(Ordering::Relaxed)),
            ("rejected_at_limit_total", "Total connections rejected at max_connections", "counter", self.rejected_at_limit_total.load(Ordering::Relaxed)),
            ("uptime_seconds", "Proxy uptime in seconds", "gauge", self.start_time.elapsed().as_secs()),
        ];

        let mut out = String::new();
        for (name, help, kind, value) in series {
            let _ = write!(
                out,
                "# HELP egress_proxy_{name} {help}\n\
                 # TYPE egress_proxy_{name} {kind}\n\
                 egress_proxy_{name} {value}\n"
            );
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
