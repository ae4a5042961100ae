//! TCP connection proxy
//!
//! One thread runs a mio poll over the listening socket; every accepted
//! connection gets its own handler thread which walks
//! `handshake -> mapping -> auth -> backend -> relay` and closes the client
//! on the first failure. Rejected clients get no explanation.

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use packet_classifier::{Accelerator, ClusterConfig, FlowKey, Mapping, Protocol, ServiceId};

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::relay::{self, Leg};
use crate::routing::{select_backend, select_mapping, Backend, RouteError, RouteTable};
use crate::tls::{PeerIdentity, TlsContext, TlsError};

// ============================================================================
// Constants
// ============================================================================

pub const AUTH_CHALLENGE: &[u8] =
    b"MARCHPROXY_AUTH\nPlease provide authentication in format:\nSERVICE_ID:TOKEN\n";
pub const AUTH_OK: &[u8] = b"AUTH_OK\n";

/// Longest accepted `SERVICE_ID:TOKEN` line
pub const MAX_AUTH_LINE: usize = 1024;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub auth_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
}

impl TcpOptions {
    pub fn from_config(config: &ProxyConfig) -> Self {
        TcpOptions {
            auth_timeout: config.auth_timeout(),
            tls_handshake_timeout: config.tls_handshake_timeout(),
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections,
        }
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions::from_config(&ProxyConfig::default())
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    routes: RouteTable,
    authenticator: Arc<Authenticator>,
    metrics: Arc<Metrics>,
    tls: Option<TlsContext>,
    accelerator: Option<Arc<dyn Accelerator>>,
    options: TcpOptions,
    stopping: AtomicBool,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

impl Shared {
    fn in_flight(&self) -> usize {
        match self.in_flight.lock() {
            Ok(n) => *n,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Reserve a handler slot unless `max_connections` is reached
    fn try_admit(self: &Arc<Self>) -> Option<HandlerGuard> {
        let mut n = match self.in_flight.lock() {
            Ok(n) => n,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(max) = self.options.max_connections {
            if *n >= max {
                return None;
            }
        }
        *n += 1;
        Metrics::inc(&self.metrics.active_connections);
        Some(HandlerGuard {
            shared: Arc::clone(self),
        })
    }

    fn wait_drained(&self) {
        let mut n = match self.in_flight.lock() {
            Ok(n) => n,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *n > 0 {
            n = match self.drained.wait(n) {
                Ok(n) => n,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/// Releases the handler slot when the connection thread ends
struct HandlerGuard {
    shared: Arc<Shared>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        let mut n = match self.shared.in_flight.lock() {
            Ok(n) => n,
            Err(poisoned) => poisoned.into_inner(),
        };
        *n = n.saturating_sub(1);
        Metrics::dec(&self.shared.metrics.active_connections);
        self.shared.drained.notify_all();
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// A bound, not yet running, TCP proxy
pub struct TcpProxy {
    listener: TcpListener,
    routes: RouteTable,
    authenticator: Arc<Authenticator>,
    metrics: Arc<Metrics>,
    tls: Option<TlsContext>,
    accelerator: Option<Arc<dyn Accelerator>>,
    options: TcpOptions,
}

impl TcpProxy {
    pub fn bind(
        addr: SocketAddr,
        snapshot: ClusterConfig,
        authenticator: Arc<Authenticator>,
        metrics: Arc<Metrics>,
        options: TcpOptions,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)?;
        Ok(TcpProxy {
            listener,
            routes: RouteTable::new(snapshot),
            authenticator,
            metrics,
            tls: None,
            accelerator: None,
            options,
        })
    }

    /// Serve TLS on the listener (and on the backend leg if the context has an upstream CA)
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept thread
    pub fn start(self) -> Result<TcpProxyHandle, ProxyError> {
        let local_addr = self.listener.local_addr()?;
        self.listener.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let fd = self.listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let shared = Arc::new(Shared {
            routes: self.routes,
            authenticator: self.authenticator,
            metrics: self.metrics,
            tls: self.tls,
            accelerator: self.accelerator,
            options: self.options,
            stopping: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
        });

        log::info!(
            "TCP proxy listening on {}{}",
            local_addr,
            if shared.tls.is_some() { " (TLS)" } else { "" }
        );

        let listener = self.listener;
        let accept_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("tcp-accept".to_string())
            .spawn(move || accept_loop(poll, listener, accept_shared))?;

        Ok(TcpProxyHandle {
            shared,
            waker,
            thread: Some(thread),
            local_addr,
        })
    }
}

/// Control surface of a running TCP proxy
pub struct TcpProxyHandle {
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl TcpProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Swap the routing snapshot. Connections already past mapping keep theirs.
    pub fn update_configuration(&self, config: ClusterConfig) {
        self.shared.authenticator.update_services(&config.services);
        self.shared.routes.replace(config);
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Close the listener and wait for every in-flight handler to finish
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            log::error!("Failed to wake TCP accept loop: {}", e);
        }
        if thread.join().is_err() {
            log::error!("TCP accept thread panicked");
        }

        let pending = self.shared.in_flight();
        if pending > 0 {
            log::info!("Waiting for {} TCP connections to finish", pending);
        }
        self.shared.wait_drained();
        log::info!("TCP proxy on {} stopped", self.local_addr);
    }
}

impl Drop for TcpProxyHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

fn accept_loop(mut poll: Poll, listener: TcpListener, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(64);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("TCP poll failed: {}", e);
            break;
        }
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        for event in events.iter() {
            if event.token() != LISTENER {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => dispatch(&shared, stream, peer),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        if !shared.stopping.load(Ordering::SeqCst) {
                            log::warn!("Accept failed: {}", e);
                        }
                        break;
                    }
                }
            }
        }
    }
}

fn dispatch(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    Metrics::inc(&shared.metrics.tcp_connections_total);

    let Some(guard) = shared.try_admit() else {
        Metrics::inc(&shared.metrics.rejected_at_limit_total);
        log::warn!("Connection limit reached, closing {}", peer);
        return;
    };

    let handler_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("tcp-{}", peer))
        .spawn(move || {
            let _guard = guard;
            log::info!("Accepted connection from {}", peer);
            match handle_connection(&handler_shared, stream, peer) {
                Ok(()) => {}
                Err(e) => log::warn!("Closed connection from {}: {}", peer, e),
            }
        });
    if let Err(e) = spawned {
        log::error!("Failed to spawn handler for {}: {}", peer, e);
    }
}

// ============================================================================
// Connection Handler
// ============================================================================

fn handle_connection(shared: &Shared, stream: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;

    if claimed_by_accelerator(shared, local) {
        log::debug!("Flow to {} is handled by the accelerator, closing {}", local, peer);
        return Ok(());
    }

    let mut client = match &shared.tls {
        Some(tls) => {
            let mut leg = Leg::tls(stream, Box::new(tls.accept()?));
            leg.complete_handshake(shared.options.tls_handshake_timeout)?;
            leg
        }
        None => Leg::plain(stream),
    };
    let identity = log_tls_metadata(&client, peer);

    let snapshot = shared.routes.snapshot();
    let mapping = select_mapping(&snapshot, Protocol::Tcp).map_err(|e| {
        Metrics::inc(&shared.metrics.mapping_misses_total);
        e
    })?;

    if mapping.auth_required {
        let service_id = authenticate_client(shared, &mut client, mapping, identity.as_ref())?;
        log::info!("Connection from {} authenticated as service {}", peer, service_id);
    }

    let backend = select_backend(&snapshot, mapping, Protocol::Tcp).map_err(|e| {
        Metrics::inc(&shared.metrics.mapping_misses_total);
        e
    })?;
    let mut upstream = dial(shared, &backend).map_err(|e| {
        Metrics::inc(&shared.metrics.backend_failures_total);
        e
    })?;
    log::debug!("Relaying {} <-> {} via mapping '{}'", peer, backend, mapping.name);

    let outcome = relay::relay(&mut client, &mut upstream, shared.options.idle_timeout);
    Metrics::add(&shared.metrics.bytes_transferred_total, outcome.total());

    match outcome.error {
        Some(e) => log::warn!(
            "Relay {} <-> {} ended with error after {}/{} bytes: {}",
            peer,
            backend,
            outcome.client_to_backend,
            outcome.backend_to_client,
            e
        ),
        None => log::info!(
            "Closed connection from {} ({} bytes up, {} bytes down)",
            peer,
            outcome.client_to_backend,
            outcome.backend_to_client
        ),
    }
    Ok(())
}

fn claimed_by_accelerator(shared: &Shared, local: SocketAddr) -> bool {
    let Some(accelerator) = shared.accelerator.as_ref().filter(|a| a.enabled()) else {
        return false;
    };
    match local {
        SocketAddr::V4(v4) => {
            accelerator.handles_flow(&FlowKey::new(*v4.ip(), v4.port(), Protocol::Tcp.number()))
        }
        SocketAddr::V6(_) => false,
    }
}

fn log_tls_metadata(client: &Leg, peer: SocketAddr) -> Option<PeerIdentity> {
    let (protocol, cipher) = client.negotiated()?;
    match client.peer_identity() {
        Some(Ok(identity)) => {
            log::info!(
                "TLS from {}: {} {} client CN={} serial={}",
                peer,
                protocol,
                cipher,
                identity.common_name,
                identity.serial
            );
            Some(identity)
        }
        Some(Err(e)) => {
            log::warn!("TLS from {}: {} {} unreadable client certificate: {}", peer, protocol, cipher, e);
            None
        }
        None => {
            log::info!("TLS from {}: {} {} (no client certificate)", peer, protocol, cipher);
            None
        }
    }
}

/// Split `SERVICE_ID:TOKEN`
pub fn parse_auth_line(line: &str) -> Option<(ServiceId, &str)> {
    let (id, token) = line.trim().split_once(':')?;
    let id = id.trim().parse().ok()?;
    Some((id, token))
}

fn authenticate_client(
    shared: &Shared,
    client: &mut Leg,
    mapping: &Mapping,
    peer: Option<&PeerIdentity>,
) -> Result<ServiceId, ProxyError> {
    client.set_timeout(Some(shared.options.auth_timeout))?;
    client.write_all(AUTH_CHALLENGE)?;
    client.flush()?;

    let line = relay::read_line(client, MAX_AUTH_LINE)?;
    let Some((service_id, token)) = parse_auth_line(&line) else {
        Metrics::inc(&shared.metrics.auth_failure_total);
        return Err(ProxyError::MalformedAuthLine);
    };
    if !mapping.allows_source(service_id) {
        Metrics::inc(&shared.metrics.auth_failure_total);
        return Err(ProxyError::SourceNotAllowed {
            service_id,
            mapping: mapping.name.clone(),
        });
    }

    shared
        .authenticator
        .authenticate(service_id, &Credentials { token, peer })?;

    client.write_all(AUTH_OK)?;
    client.flush()?;
    client.set_timeout(None)?;
    Ok(service_id)
}

fn dial(shared: &Shared, backend: &Backend) -> Result<Leg, ProxyError> {
    let mut last_error = None;
    let mut stream = None;
    for addr in backend.resolve()? {
        match TcpStream::connect_timeout(&addr, shared.options.connect_timeout) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let stream = match (stream, last_error) {
        (Some(s), _) => s,
        (None, Some(e)) => {
            return Err(ProxyError::Dial {
                backend: backend.to_string(),
                source: e,
            })
        }
        (None, None) => return Err(RouteError::Unresolvable(backend.to_string()).into()),
    };
    stream.set_nodelay(true)?;

    match shared.tls.as_ref().and_then(|tls| tls.connect(&backend.host)) {
        Some(session) => {
            let mut leg = Leg::tls(stream, Box::new(session?));
            leg.complete_handshake(shared.options.tls_handshake_timeout)?;
            if let Some((protocol, cipher)) = leg.negotiated() {
                log::debug!("Upstream TLS to {}: {} {}", backend, protocol, cipher);
            }
            Ok(leg)
        }
        None => Ok(Leg::plain(stream)),
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ProxyError {
    Io(io::Error),
    Tls(TlsError),
    Route(RouteError),
    Auth(AuthError),
    MalformedAuthLine,
    SourceNotAllowed { service_id: ServiceId, mapping: String },
    Dial { backend: String, source: io::Error },
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "I/O error: {}", e),
            ProxyError::Tls(e) => write!(f, "{}", e),
            ProxyError::Route(e) => write!(f, "routing: {}", e),
            ProxyError::Auth(e) => write!(f, "authentication: {}", e),
            ProxyError::MalformedAuthLine => write!(f, "malformed authentication line"),
            ProxyError::SourceNotAllowed { service_id, mapping } => write!(
                f,
                "service {} is not a source of mapping '{}'",
                service_id, mapping
            ),
            ProxyError::Dial { backend, source } => write!(f, "cannot connect to {}: {}", backend, source),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        ProxyError::Io(e)
    }
}

impl From<TlsError> for ProxyError {
    fn from(e: TlsError) -> Self {
        ProxyError::Tls(e)
    }
}

impl From<RouteError> for ProxyError {
    fn from(e: RouteError) -> Self {
        ProxyError::Route(e)
    }
}

impl From<AuthError> for ProxyError {
    fn from(e: AuthError) -> Self {
        ProxyError::Auth(e)
    }
}
