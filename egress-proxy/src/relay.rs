//! Connection legs and the bidirectional relay
//!
//! A [`Leg`] is one side of a proxied connection: a TCP stream, optionally
//! wrapped in a rustls session. Legs are used blocking (with deadlines) for
//! the handshake and the in-band auth exchange, then switched to
//! non-blocking and pumped by [`relay`] from a per-connection mio poll.
//!
//! Termination: as soon as one side reaches EOF and everything it sent has
//! been written to the other side, both legs are closed. Any other I/O error
//! ends the relay the same way and is reported in the outcome.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustls::pki_types::CertificateDer;

use crate::tls::{PeerIdentity, TlsError};

// ============================================================================
// Constants
// ============================================================================

/// Bytes read from one side per call
const CHUNK_SIZE: usize = 16 * 1024;

/// Stop reading a side while this much is waiting to be written to the other
const HIGH_WATER_MARK: usize = 64 * 1024;

const CLIENT: Token = Token(0);
const BACKEND: Token = Token(1);

// ============================================================================
// TLS Session
// ============================================================================

/// The parts of a rustls connection the relay drives, client or server side
pub trait TlsSession: Send {
    fn recv_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize>;
    fn send_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize>;
    fn process_records(&mut self) -> Result<(), rustls::Error>;
    fn plaintext_reader(&mut self) -> rustls::Reader<'_>;
    fn plaintext_writer(&mut self) -> rustls::Writer<'_>;
    fn has_pending_output(&self) -> bool;
    fn handshaking(&self) -> bool;
    fn close_notify(&mut self);
    fn peer_chain(&self) -> Option<&[CertificateDer<'static>]>;
    fn cipher_suite(&self) -> Option<String>;
    fn protocol(&self) -> Option<String>;
}

macro_rules! tls_session {
    ($conn:ty) => {
        impl TlsSession for $conn {
            fn recv_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
                self.read_tls(rd)
            }
            fn send_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
                self.write_tls(wr)
            }
            fn process_records(&mut self) -> Result<(), rustls::Error> {
                self.process_new_packets().map(|_| ())
            }
            fn plaintext_reader(&mut self) -> rustls::Reader<'_> {
                self.reader()
            }
            fn plaintext_writer(&mut self) -> rustls::Writer<'_> {
                self.writer()
            }
            fn has_pending_output(&self) -> bool {
                self.wants_write()
            }
            fn handshaking(&self) -> bool {
                self.is_handshaking()
            }
            fn close_notify(&mut self) {
                self.send_close_notify()
            }
            fn peer_chain(&self) -> Option<&[CertificateDer<'static>]> {
                self.peer_certificates()
            }
            fn cipher_suite(&self) -> Option<String> {
                self.negotiated_cipher_suite()
                    .map(|s| format!("{:?}", s.suite()))
            }
            fn protocol(&self) -> Option<String> {
                self.protocol_version().map(|v| format!("{:?}", v))
            }
        }
    };
}

tls_session!(rustls::ClientConnection);
tls_session!(rustls::ServerConnection);

/// Write queued TLS records; `WouldBlock` if the socket fills first
fn flush_tls(tls: &mut dyn TlsSession, stream: &mut TcpStream) -> io::Result<()> {
    while tls.has_pending_output() {
        tls.send_tls(stream)?;
    }
    Ok(())
}

fn timed_out(e: io::Error, what: &str) -> io::Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
        }
        _ => e,
    }
}

// ============================================================================
// Leg
// ============================================================================

pub struct Leg {
    stream: TcpStream,
    tls: Option<Box<dyn TlsSession>>,
}

impl Leg {
    pub fn plain(stream: TcpStream) -> Self {
        Leg { stream, tls: None }
    }

    pub fn tls(stream: TcpStream, session: Box<dyn TlsSession>) -> Self {
        Leg {
            stream,
            tls: Some(session),
        }
    }

    /// Read and write deadline for the blocking phase
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    /// Drive the TLS handshake to completion within `timeout`. No-op for plain legs.
    pub fn complete_handshake(&mut self, timeout: Duration) -> io::Result<()> {
        let Leg { stream, tls } = self;
        let Some(tls) = tls.as_deref_mut() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        while tls.handshaking() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?;
            stream.set_read_timeout(Some(remaining))?;
            stream.set_write_timeout(Some(remaining))?;

            if tls.has_pending_output() {
                flush_tls(tls, stream).map_err(|e| timed_out(e, "TLS handshake"))?;
                continue;
            }

            let n = tls
                .recv_tls(stream)
                .map_err(|e| timed_out(e, "TLS handshake"))?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during TLS handshake",
                ));
            }
            if let Err(e) = tls.process_records() {
                // Best effort: deliver the alert
                let _ = flush_tls(tls, stream);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }

        flush_tls(tls, stream).map_err(|e| timed_out(e, "TLS handshake"))
    }

    /// Identity from the peer's certificate, if one was presented
    pub fn peer_identity(&self) -> Option<Result<PeerIdentity, TlsError>> {
        PeerIdentity::from_chain(self.tls.as_ref()?.peer_chain())
    }

    /// Negotiated protocol version and cipher suite
    pub fn negotiated(&self) -> Option<(String, String)> {
        let tls = self.tls.as_ref()?;
        Some((tls.protocol()?, tls.cipher_suite()?))
    }

    fn tls_output_pending(&self) -> bool {
        self.tls.as_ref().map(|t| t.has_pending_output()).unwrap_or(false)
    }

    /// Send close_notify if TLS and close both directions
    pub fn shutdown(&mut self) {
        if let Some(tls) = self.tls.as_deref_mut() {
            tls.close_notify();
            let _ = flush_tls(tls, &mut self.stream);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Read for Leg {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Leg { stream, tls } = self;
        let Some(tls) = tls.as_deref_mut() else {
            return stream.read(buf);
        };

        loop {
            // Plaintext already decrypted goes first
            match tls.plaintext_reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if tls.recv_tls(stream)? == 0 {
                return Ok(0);
            }
            if let Err(e) = tls.process_records() {
                let _ = flush_tls(tls, stream);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
            match flush_tls(tls, stream) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for Leg {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Leg { stream, tls } = self;
        let Some(tls) = tls.as_deref_mut() else {
            return stream.write(buf);
        };

        // Refuse new plaintext until earlier records are on the wire
        flush_tls(tls, stream)?;
        let n = tls.plaintext_writer().write(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        match flush_tls(tls, stream) {
            Ok(()) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(n),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(tls) = self.tls.as_deref_mut() {
            flush_tls(tls, &mut self.stream)?;
        }
        self.stream.flush()
    }
}

/// Read one `\n`-terminated line of at most `max_len` bytes.
///
/// Reads byte by byte so nothing past the newline is consumed. A trailing
/// `\r` is stripped. EOF before the newline, an over-long line, invalid
/// UTF-8 or a deadline expiry are all errors.
pub fn read_line<R: Read>(reader: &mut R, max_len: usize) -> io::Result<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of line",
                ))
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                if line.len() == max_len {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
                }
                line.push(byte[0]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(timed_out(e, "line read")),
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ============================================================================
// Relay
// ============================================================================

/// Byte counts and the error that ended the relay, if any
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub error: Option<io::Error>,
}

impl RelayOutcome {
    pub fn total(&self) -> u64 {
        self.client_to_backend + self.backend_to_client
    }
}

/// Data read from one leg and not yet written to the other
#[derive(Default)]
struct Direction {
    pending: Vec<u8>,
    eof: bool,
}

impl Direction {
    fn fill(&mut self, src: &mut Leg) -> io::Result<bool> {
        let mut progress = false;
        let mut chunk = [0u8; CHUNK_SIZE];

        while !self.eof && self.pending.len() < HIGH_WATER_MARK {
            match src.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    progress = true;
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(progress)
    }

    fn drain(&mut self, dst: &mut Leg, counter: &mut u64) -> io::Result<bool> {
        let mut progress = false;

        while !self.pending.is_empty() {
            match dst.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                    *counter += n as u64;
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(tls) = dst.tls.as_deref_mut() {
            match flush_tls(tls, &mut dst.stream) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(progress)
    }

    /// Source closed and everything it sent has been delivered
    fn finished(&self, dst: &Leg) -> bool {
        self.eof && self.pending.is_empty() && !dst.tls_output_pending()
    }
}

/// Relay bytes between `client` and `backend` until one side finishes.
///
/// Both legs are shut down before returning.
pub fn relay(client: &mut Leg, backend: &mut Leg, idle_timeout: Option<Duration>) -> RelayOutcome {
    let mut outcome = RelayOutcome::default();
    if let Err(e) = pump(client, backend, idle_timeout, &mut outcome) {
        outcome.error = Some(e);
    }
    client.shutdown();
    backend.shutdown();
    outcome
}

fn pump(
    client: &mut Leg,
    backend: &mut Leg,
    idle_timeout: Option<Duration>,
    outcome: &mut RelayOutcome,
) -> io::Result<()> {
    client.set_timeout(None)?;
    backend.set_timeout(None)?;
    client.stream.set_nonblocking(true)?;
    backend.stream.set_nonblocking(true)?;

    let mut poll = Poll::new()?;
    let interest = Interest::READABLE | Interest::WRITABLE;
    let client_fd = client.stream.as_raw_fd();
    let backend_fd = backend.stream.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&client_fd), CLIENT, interest)?;
    poll.registry()
        .register(&mut SourceFd(&backend_fd), BACKEND, interest)?;

    let mut events = Events::with_capacity(8);
    let mut upstream = Direction::default();
    let mut downstream = Direction::default();
    let mut last_activity = Instant::now();

    loop {
        // Edge-triggered: always work until every call would block
        let mut progress = upstream.fill(client)?;
        progress |= upstream.drain(backend, &mut outcome.client_to_backend)?;
        progress |= downstream.fill(backend)?;
        progress |= downstream.drain(client, &mut outcome.backend_to_client)?;

        if upstream.finished(backend) || downstream.finished(client) {
            break;
        }
        if progress {
            last_activity = Instant::now();
            continue;
        }

        let timeout = match idle_timeout {
            Some(idle) => {
                let elapsed = last_activity.elapsed();
                if elapsed >= idle {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"));
                }
                Some(idle - elapsed)
            }
            None => None,
        };

        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let _ = poll.registry().deregister(&mut SourceFd(&client_fd));
    let _ = poll.registry().deregister(&mut SourceFd(&backend_fd));
    Ok(())
}
