//! Stateless UDP relay
//!
//! Every datagram is routed on its own: first `udp` mapping, first known
//! destination, a throwaway socket connected to the backend, one reply
//! awaited for at most the reply timeout and sent back to the original
//! sender. Nothing is kept between datagrams.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use packet_classifier::{ClusterConfig, Protocol};

use crate::metrics::Metrics;
use crate::routing::{select_backend, select_mapping, RouteTable};
use crate::tcp::ProxyError;

/// Largest datagram received or relayed
const MAX_DATAGRAM: usize = 65_535;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

struct Shared {
    routes: RouteTable,
    metrics: Arc<Metrics>,
    reply_timeout: Duration,
    stopping: AtomicBool,
}

/// A bound, not yet running, UDP proxy
pub struct UdpProxy {
    socket: UdpSocket,
    routes: RouteTable,
    metrics: Arc<Metrics>,
    reply_timeout: Duration,
}

impl UdpProxy {
    pub fn bind(
        addr: SocketAddr,
        snapshot: ClusterConfig,
        metrics: Arc<Metrics>,
        reply_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        Ok(UdpProxy {
            socket: UdpSocket::bind(addr)?,
            routes: RouteTable::new(snapshot),
            metrics,
            reply_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn start(self) -> Result<UdpProxyHandle, ProxyError> {
        let local_addr = self.socket.local_addr()?;
        self.socket.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let fd = self.socket.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), SOCKET, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let shared = Arc::new(Shared {
            routes: self.routes,
            metrics: self.metrics,
            reply_timeout: self.reply_timeout,
            stopping: AtomicBool::new(false),
        });
        log::info!("UDP proxy listening on {}", local_addr);

        let socket = Arc::new(self.socket);
        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("udp-recv".to_string())
            .spawn(move || receive_loop(poll, socket, loop_shared))?;

        Ok(UdpProxyHandle {
            shared,
            waker,
            thread: Some(thread),
            local_addr,
        })
    }
}

pub struct UdpProxyHandle {
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl UdpProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn update_configuration(&self, config: ClusterConfig) {
        self.shared.routes.replace(config);
    }

    /// Stop receiving. Datagrams already dispatched finish within the reply timeout.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            log::error!("Failed to wake UDP receive loop: {}", e);
        }
        if thread.join().is_err() {
            log::error!("UDP receive thread panicked");
        }
        log::info!("UDP proxy on {} stopped", self.local_addr);
    }
}

impl Drop for UdpProxyHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(mut poll: Poll, socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(64);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("UDP poll failed: {}", e);
            break;
        }
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        for event in events.iter() {
            if event.token() != SOCKET {
                continue;
            }
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, client)) => {
                        Metrics::inc(&shared.metrics.udp_packets_total);
                        let datagram = buf[..n].to_vec();
                        let shared = Arc::clone(&shared);
                        let socket = Arc::clone(&socket);
                        let spawned = thread::Builder::new()
                            .name(format!("udp-{}", client))
                            .spawn(move || handle_datagram(&shared, &socket, &datagram, client));
                        if let Err(e) = spawned {
                            log::error!("Failed to spawn handler for datagram from {}: {}", client, e);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        if !shared.stopping.load(Ordering::SeqCst) {
                            log::warn!("UDP receive failed: {}", e);
                        }
                        break;
                    }
                }
            }
        }
    }
}

fn handle_datagram(shared: &Shared, listener: &UdpSocket, datagram: &[u8], client: SocketAddr) {
    match forward(shared, datagram, client) {
        Ok(Some(reply)) => {
            if let Err(e) = send_reply(listener, &reply, client) {
                log::debug!("Reply to {} not delivered: {}", client, e);
                return;
            }
            Metrics::add(
                &shared.metrics.bytes_transferred_total,
                (datagram.len() + reply.len()) as u64,
            );
        }
        Ok(None) => {}
        Err(e) => log::debug!("Datagram from {} dropped: {}", client, e),
    }
}

/// Relay one datagram; `None` when it was dropped by policy or got no reply
fn forward(shared: &Shared, datagram: &[u8], client: SocketAddr) -> Result<Option<Vec<u8>>, ProxyError> {
    let snapshot = shared.routes.snapshot();
    let mapping = match select_mapping(&snapshot, Protocol::Udp) {
        Ok(m) => m,
        Err(e) => {
            Metrics::inc(&shared.metrics.mapping_misses_total);
            log::debug!("Datagram from {}: {}", client, e);
            return Ok(None);
        }
    };
    if mapping.auth_required {
        log::debug!(
            "Datagram from {} dropped: mapping '{}' requires authentication",
            client,
            mapping.name
        );
        return Ok(None);
    }

    let backend = select_backend(&snapshot, mapping, Protocol::Udp).map_err(|e| {
        Metrics::inc(&shared.metrics.mapping_misses_total);
        e
    })?;
    let target = backend.resolve().map_err(|e| {
        Metrics::inc(&shared.metrics.backend_failures_total);
        e
    })?[0];

    let bind_addr: SocketAddr = match target {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => ([0u16; 8], 0).into(),
    };
    let upstream = UdpSocket::bind(bind_addr)?;
    upstream.connect(target)?;
    upstream.set_read_timeout(Some(shared.reply_timeout))?;
    upstream.send(datagram)?;
    log::trace!("Forwarded {} bytes from {} to {}", datagram.len(), client, backend);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    match upstream.recv(&mut buf) {
        Ok(n) => {
            buf.truncate(n);
            Ok(Some(buf))
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            log::debug!("No reply from {} for {} within {:?}", backend, client, shared.reply_timeout);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn send_reply(listener: &UdpSocket, reply: &[u8], client: SocketAddr) -> io::Result<()> {
    // The listener is non-blocking; a full send buffer is rare enough to retry briefly
    for _ in 0..3 {
        match listener.send_to(reply, client) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(1)),
            Err(e) => return Err(e),
        }
    }
    Err(io::ErrorKind::WouldBlock.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_classifier::{Mapping, Service};

    fn snapshot(backend_port: u16, auth_required: bool) -> ClusterConfig {
        ClusterConfig {
            services: vec![Service {
                id: 3,
                address: "127.0.0.1".to_string(),
                ..Default::default()
            }],
            mappings: vec![Mapping {
                name: "dns".to_string(),
                source_services: vec![1],
                dest_services: vec![3],
                protocols: vec![Protocol::Udp],
                ports: backend_port.to_string(),
                auth_required,
                ..Default::default()
            }],
            version: String::new(),
        }
    }

    fn shared(config: ClusterConfig) -> Shared {
        Shared {
            routes: RouteTable::new(config),
            metrics: Arc::new(Metrics::new()),
            reply_timeout: Duration::from_millis(300),
            stopping: AtomicBool::new(false),
        }
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_forward_gets_reply() {
        let backend = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = backend.local_addr().unwrap().port();
        let echo = thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (n, from) = backend.recv_from(&mut buf).unwrap();
            backend.send_to(&buf[..n], from).unwrap();
        });

        let shared = shared(snapshot(port, false));
        let reply = forward(&shared, b"query", client_addr()).unwrap();
        echo.join().unwrap();
        assert_eq!(reply.as_deref(), Some(&b"query"[..]));
    }

    #[test]
    fn test_no_mapping_is_silent() {
        let shared = shared(ClusterConfig::default());
        assert!(forward(&shared, b"x", client_addr()).unwrap().is_none());
        assert_eq!(shared.metrics.mapping_misses_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_auth_required_fails_closed() {
        let backend = UdpSocket::bind("127.0.0.1:0").unwrap();
        backend.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let port = backend.local_addr().unwrap().port();

        let shared = shared(snapshot(port, true));
        assert!(forward(&shared, b"x", client_addr()).unwrap().is_none());

        // Nothing reached the backend
        let mut buf = [0u8; 16];
        assert!(backend.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_silent_backend_times_out() {
        let backend = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = backend.local_addr().unwrap().port();
        let shared = shared(snapshot(port, false));

        let start = std::time::Instant::now();
        assert!(forward(&shared, b"x", client_addr()).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
