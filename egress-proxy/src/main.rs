//! Egress Proxy
//!
//! Runs the TCP and UDP proxies over a cluster snapshot file and, when
//! enabled, the software accelerator with its cache sweeper.
//! SIGHUP reloads the snapshot; SIGINT/SIGTERM drain and exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use egress_proxy::config::{self, ProxyConfig};
use egress_proxy::{Authenticator, Metrics, TcpOptions, TcpProxy, TlsContext, UdpProxy};
use packet_classifier::{
    Accelerator, CacheSweeper, ClassifierConfig, ClusterConfig, RuleCache, SoftwareAccelerator,
    DEFAULT_SWEEP_INTERVAL,
};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mut config = match parse_arg(&args, "--config") {
        Some(path) => ProxyConfig::from_file(Path::new(&path))?,
        None => ProxyConfig::default(),
    };
    if let Some(listen) = parse_arg(&args, "--listen") {
        config.listen_addr = listen;
    }
    if let Some(udp) = parse_arg(&args, "--udp-listen") {
        config.udp_listen_addr = Some(udp);
    }
    if let Some(cluster) = parse_arg(&args, "--cluster-config") {
        config.cluster_config_path = Some(PathBuf::from(cluster));
    }
    config.validate()?;

    let snapshot = match &config.cluster_config_path {
        Some(path) => config::load_cluster_config(path)?,
        None => {
            log::warn!("No cluster config given; every connection will be closed until one is loaded");
            ClusterConfig::default()
        }
    };

    log::info!("Egress proxy starting...");
    log::info!("  TCP:  {}", config.listen_socket_addr()?);
    log::info!("  UDP:  {}", config.udp_socket_addr()?);
    log::info!("  mTLS: {}", if config.mtls.is_some() { "enabled" } else { "disabled" });
    log::info!("  Acceleration: {}", if config.enable_acceleration { "software" } else { "off" });

    let metrics = Arc::new(Metrics::new());

    // Fast path: rule cache, classifier and sweeper
    let rule_cache = Arc::new(RuleCache::with_snapshot(
        snapshot.clone(),
        Duration::from_secs(config.cache_ttl_secs),
    ));
    let accelerator: Option<Arc<SoftwareAccelerator>> = config.enable_acceleration.then(|| {
        Arc::new(SoftwareAccelerator::new(
            Arc::clone(&rule_cache),
            ClassifierConfig {
                deep_inspection: config.deep_inspection,
                ..Default::default()
            },
            true,
        ))
    });
    let mut sweeper = accelerator
        .as_ref()
        .map(|_| CacheSweeper::start(Arc::clone(&rule_cache), DEFAULT_SWEEP_INTERVAL));

    let mut authenticator = Authenticator::new(&snapshot.services, Arc::clone(&metrics));
    if accelerator.is_some() {
        authenticator = authenticator.with_token_cache(
            rule_cache.clone(),
            Duration::from_secs(config.auth_token_ttl_secs),
        );
    }
    let authenticator = Arc::new(authenticator);

    let mut tcp = TcpProxy::bind(
        config.listen_socket_addr()?,
        snapshot.clone(),
        Arc::clone(&authenticator),
        Arc::clone(&metrics),
        TcpOptions::from_config(&config),
    )?;
    if let Some(mtls) = &config.mtls {
        tcp = tcp.with_tls(TlsContext::from_config(mtls)?);
    }
    if let Some(accelerator) = &accelerator {
        tcp = tcp.with_accelerator(accelerator.clone());
    }
    let mut tcp = tcp.start()?;

    let mut udp = UdpProxy::bind(
        config.udp_socket_addr()?,
        snapshot,
        Arc::clone(&metrics),
        config.udp_reply_timeout(),
    )?
    .start()?;

    // Block on signals
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    for signal in signals.forever() {
        if signal != SIGHUP {
            log::info!("Received signal {}, shutting down", signal);
            break;
        }
        let Some(path) = &config.cluster_config_path else {
            log::warn!("SIGHUP received but no cluster config path is set");
            continue;
        };
        match config::load_cluster_config(path) {
            Ok(snapshot) => {
                if let Some(accelerator) = &accelerator {
                    accelerator.sync_rules(&snapshot);
                }
                udp.update_configuration(snapshot.clone());
                tcp.update_configuration(snapshot);
            }
            Err(e) => log::error!("Reload failed, keeping current snapshot: {}", e),
        }
    }

    udp.stop();
    tcp.stop();
    if let Some(sweeper) = sweeper.as_mut() {
        sweeper.stop();
    }
    if let Some(accelerator) = &accelerator {
        let stats = accelerator.stats();
        log::info!(
            "Accelerator: {} packets, {} passed, {} redirected, {} dropped",
            stats.packets_processed,
            stats.packets_passed,
            stats.packets_redirected,
            stats.packets_dropped
        );
        if let Ok(detail) = serde_json::to_string(&accelerator.classifier_stats()) {
            log::debug!("Classifier: {}", detail);
        }
    }
    log::info!("Final metrics:\n{}", metrics.render());
    Ok(())
}

/// Value following `flag`, if present
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
