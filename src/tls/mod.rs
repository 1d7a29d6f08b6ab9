//! TLS session layered over a [`SocketEngine`].
//!
//! A [`TlsSession`] owns one engine and makes an encrypted connection behave
//! like a plain nonblocking byte stream. All progress happens in
//! [`TlsSession::transmit`], which is driven by readiness events passed to
//! [`TlsSession::handle_event`] and by the session's own read and write calls.
//! Until encryption starts the session passes bytes straight through to the
//! engine.

pub mod config;
pub mod verifier;

pub use config::{load_certificates, load_private_key, PeerVerifyMode, TlsConfiguration, TlsProtocol};
pub use verifier::{
    is_matching_hostname, CertificateVerifier, Denylist, DenylistEntry, IgnoredErrorSet, Purpose,
    VerificationError,
};

use crate::error::Error;
use crate::socket::address::endpoint;
use crate::socket::{
    ConnectOutcome, HostResolver, NativeSocketEngine, SocketEngine, SocketErrorKind, SocketEvent,
    SocketState, Transfer,
};

use mio::{Registry, Token};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ProtocolVersion, SupportedCipherSuite};
use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use tracing::{debug, error, info, instrument, trace, warn};

const PLAIN_READ_CHUNK: usize = 16 * 1024;

/// Where a session is in its encryption lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Unencrypted,
    ClientHandshake,
    ServerHandshake,
    Encrypted,
    /// Terminal; the engine has been closed.
    Failed,
}

/// Notifications collected by a session, drained with [`TlsSession::take_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The underlying connection was established.
    Connected,
    /// The handshake completed and the peer was accepted.
    Encrypted,
    /// New plaintext is available to `read`.
    ReadyRead,
    /// Plaintext bytes handed to the encryption layer or the socket.
    BytesWritten(usize),
    /// Problems found with the peer certificate, fatal or not.
    PeerVerifyErrors(Vec<VerificationError>),
    /// The session paused on verification errors and waits for `resume`.
    Paused,
    Disconnected,
}

// Internal enum for TLS connection type
enum TlsConnection {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(rd),
            TlsConnection::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(wr),
            TlsConnection::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }

    fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        let chain = match self {
            TlsConnection::Server(conn) => conn.peer_certificates(),
            TlsConnection::Client(conn) => conn.peer_certificates(),
        };
        chain.map(<[_]>::to_vec).unwrap_or_default()
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match self {
            TlsConnection::Server(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
            TlsConnection::Client(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
        }
    }

    fn protocol_version(&self) -> Option<ProtocolVersion> {
        match self {
            TlsConnection::Server(conn) => conn.protocol_version(),
            TlsConnection::Client(conn) => conn.protocol_version(),
        }
    }

    fn negotiated_cipher_suite(&self) -> Option<SupportedCipherSuite> {
        match self {
            TlsConnection::Server(conn) => conn.negotiated_cipher_suite(),
            TlsConnection::Client(conn) => conn.negotiated_cipher_suite(),
        }
    }
}

// Adapts an engine to the io traits rustls reads and writes through.
struct EngineIo<'a, E: SocketEngine> {
    engine: &'a mut E,
}

impl<E: SocketEngine> Read for EngineIo<'_, E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.engine.read(buf) {
            Ok(Transfer::Done(n)) => Ok(n),
            Ok(Transfer::WouldBlock) => Err(ErrorKind::WouldBlock.into()),
            Err(kind) => Err(io::Error::other(kind)),
        }
    }
}

impl<E: SocketEngine> Write for EngineIo<'_, E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.engine.write(buf) {
            Ok(Transfer::Done(n)) => Ok(n),
            Ok(Transfer::WouldBlock) => Err(ErrorKind::WouldBlock.into()),
            Err(kind) => Err(io::Error::other(kind)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn socket_error_kind(err: &io::Error) -> SocketErrorKind {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<SocketErrorKind>())
        .cloned()
        .unwrap_or_else(|| SocketErrorKind::Unknown(err.to_string()))
}

// Internal data type for one pass of the pump
#[derive(Default)]
struct Pump {
    progress: bool,
    handshake_done: bool,
    peer_closed: bool,
}

// Internal reason for a pump pass to stop the session
enum PumpFailure {
    Transport(SocketErrorKind),
    Tls(rustls::Error),
    Plaintext(io::Error),
}

/// An encrypted (or not yet encrypted) stream over one engine.
pub struct TlsSession<E: SocketEngine = NativeSocketEngine> {
    engine: E,
    config: TlsConfiguration,
    connection: Option<TlsConnection>,
    handshake: HandshakeState,
    write_buffer: Vec<u8>,
    read_buffer: Vec<u8>,
    ignored: IgnoredErrorSet,
    verification_errors: Vec<VerificationError>,
    verification_pending: bool,
    peer_chain: Vec<CertificateDer<'static>>,
    negotiated_alpn: Option<Vec<u8>>,
    protocol_version: Option<ProtocolVersion>,
    cipher_suite: Option<SupportedCipherSuite>,
    expected_host: String,
    auto_start: bool,
    paused: bool,
    pending_close: bool,
    close_notify_sent: bool,
    events: Vec<SessionEvent>,
    plaintext_written: usize,
    plaintext_read: usize,
    spurious_wakeups: usize,
}

// ============================================================================
// Constructors
// ============================================================================

impl<E: SocketEngine> TlsSession<E> {
    /// Wraps `engine`, taking a private copy of `config`.
    pub fn new(engine: E, config: &TlsConfiguration) -> Self {
        Self {
            engine,
            config: config.clone(),
            connection: None,
            handshake: HandshakeState::Unencrypted,
            write_buffer: Vec::new(),
            read_buffer: Vec::new(),
            ignored: IgnoredErrorSet::new(),
            verification_errors: Vec::new(),
            verification_pending: false,
            peer_chain: Vec::new(),
            negotiated_alpn: None,
            protocol_version: None,
            cipher_suite: None,
            expected_host: String::new(),
            auto_start: false,
            paused: false,
            pending_close: false,
            close_notify_sent: false,
            events: Vec::new(),
            plaintext_written: 0,
            plaintext_read: 0,
            spurious_wakeups: 0,
        }
    }

    /// Registers the engine with an event loop.
    pub fn attach(&mut self, registry: &Registry, token: Token) -> Result<(), Error> {
        self.engine.attach_notifier(registry, token)?;
        Ok(())
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl<E: SocketEngine> TlsSession<E> {
    /// Connects in plain mode. Encryption can be started later.
    #[instrument(skip(self, resolver))]
    pub fn connect_to_host(
        &mut self,
        host: &str,
        port: u16,
        resolver: &dyn HostResolver,
    ) -> Result<(), Error> {
        self.expected_host = host.to_string();
        self.auto_start = false;
        self.begin_connect(host, port, resolver)
    }

    /// Connects and starts the client handshake as soon as the connection is up.
    #[instrument(skip(self, resolver))]
    pub fn connect_to_host_encrypted(
        &mut self,
        host: &str,
        port: u16,
        resolver: &dyn HostResolver,
    ) -> Result<(), Error> {
        self.expected_host = host.to_string();
        self.auto_start = true;
        self.begin_connect(host, port, resolver)
    }

    /// Starts the client handshake on a connected engine.
    ///
    /// On an engine that is still connecting the handshake starts once the
    /// connection completes.
    #[instrument(skip(self))]
    pub fn start_client_encryption(&mut self) -> Result<(), Error> {
        if self.handshake != HandshakeState::Unencrypted {
            warn!(state = ?self.handshake, "Encryption already started");
            return Ok(());
        }
        match self.engine.state() {
            SocketState::Connected => {}
            SocketState::Connecting | SocketState::HostLookup => {
                self.auto_start = true;
                return Ok(());
            }
            _ => return Err(Error::NotConnected),
        }

        let config = self.config.client_config()?;
        let name = self.server_name();
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| Error::TlsInvalidServerName(name))?;
        let conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| Error::TlsHandshake(e.to_string()))?;

        self.begin_handshake(TlsConnection::Client(conn), HandshakeState::ClientHandshake)
    }

    /// Starts the server handshake on a connected (typically accepted) engine.
    #[instrument(skip(self))]
    pub fn start_server_encryption(&mut self) -> Result<(), Error> {
        if self.handshake != HandshakeState::Unencrypted {
            warn!(state = ?self.handshake, "Encryption already started");
            return Ok(());
        }
        if self.engine.state() != SocketState::Connected {
            return Err(Error::NotConnected);
        }

        let config = self.config.server_config()?;
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| Error::TlsHandshake(e.to_string()))?;

        self.begin_handshake(TlsConnection::Server(conn), HandshakeState::ServerHandshake)
    }

    /// Closes once queued data has been flushed; an encrypted session sends
    /// `close_notify` first. Closing a failed or closed session does nothing.
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<(), Error> {
        if self.handshake == HandshakeState::Failed || !self.engine.is_valid() {
            return Ok(());
        }
        self.pending_close = true;
        match self.handshake {
            HandshakeState::Unencrypted => {
                self.finish_close("Closed connection");
                Ok(())
            }
            HandshakeState::ClientHandshake | HandshakeState::ServerHandshake => {
                if !self.write_buffer.is_empty() {
                    debug!(
                        len = self.write_buffer.len(),
                        "Deferring close until the handshake completes"
                    );
                }
                self.continue_close();
                Ok(())
            }
            HandshakeState::Encrypted => {
                self.transmit()?;
                self.continue_close();
                Ok(())
            }
            HandshakeState::Failed => Ok(()),
        }
    }

    /// Closes immediately, discarding buffered data in both directions.
    #[instrument(skip(self))]
    pub fn abort(&mut self) {
        if self.handshake == HandshakeState::Failed {
            return;
        }
        self.write_buffer.clear();
        self.read_buffer.clear();
        if self.engine.is_valid() {
            self.finish_close("Aborted connection");
        }
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl<E: SocketEngine> TlsSession<E> {
    /// Copies available plaintext into `buf` without blocking.
    ///
    /// Returns 0 when nothing is available yet.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.auto_start_if_due()?;
        if self.connection.is_some() {
            self.transmit()?;
        } else if self.read_buffer.is_empty() && self.engine.state() == SocketState::Connected {
            return self.read_plain(buf);
        }

        let n = buf.len().min(self.read_buffer.len());
        buf[..n].copy_from_slice(&self.read_buffer[..n]);
        self.read_buffer.drain(..n);
        trace!(len = n, "Read plaintext");
        Ok(n)
    }

    /// Queues `buf` for sending and pumps.
    ///
    /// In plain mode the bytes go straight to the engine and the count it
    /// accepted is returned. Otherwise every byte is accepted and held until
    /// the encryption layer can take it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.auto_start_if_due()?;
        if self.handshake == HandshakeState::Failed || self.pending_close {
            return Err(Error::NotConnected);
        }
        if self.connection.is_none() {
            if self.engine.state() != SocketState::Connected {
                return Err(Error::NotConnected);
            }
            return match self.engine.write(buf)? {
                Transfer::Done(n) => {
                    self.events.push(SessionEvent::BytesWritten(n));
                    Ok(n)
                }
                Transfer::WouldBlock => Ok(0),
            };
        }

        self.write_buffer.extend_from_slice(buf);
        self.transmit()?;
        Ok(buf.len())
    }

    /// Returns up to `max_len` bytes of available plaintext without consuming
    /// them; the next `read` returns the same bytes.
    pub fn peek(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        if self.read_buffer.len() < max_len {
            if self.connection.is_some() {
                self.transmit()?;
            } else if self.engine.state() == SocketState::Connected {
                self.fill_plain(max_len)?;
            }
        }
        let n = max_len.min(self.read_buffer.len());
        Ok(self.read_buffer[..n].to_vec())
    }

    /// Runs the pump: moves queued plaintext into the encryption layer,
    /// ciphertext between it and the engine, and decrypted bytes into the
    /// read buffer, until nothing moves.
    ///
    /// A failure closes the engine and is returned once; later calls do nothing.
    #[instrument(level = "trace", skip(self))]
    pub fn transmit(&mut self) -> Result<(), Error> {
        self.pump().map(|_| ())
    }

    /// Dispatches one readiness event from the reactor.
    #[instrument(skip(self))]
    pub fn handle_event(&mut self, event: SocketEvent) -> Result<(), Error> {
        if self.engine.state() == SocketState::Connecting {
            return match self.engine.connection_notification() {
                None => {
                    self.track_spurious_wakeup(true);
                    Ok(())
                }
                Some(outcome) => self.on_connect_outcome(outcome),
            };
        }

        let progress = if self.connection.is_some() {
            self.pump()?
        } else if self.engine.state() == SocketState::Connected {
            match event {
                SocketEvent::Readable | SocketEvent::Closed => self.fill_plain(usize::MAX)?,
                SocketEvent::Writable => {
                    self.engine.set_notifications(true, false)?;
                    true
                }
            }
        } else {
            return Ok(());
        };
        self.track_spurious_wakeup(!progress);
        Ok(())
    }

    /// Suspends readiness notification; the pump stops until `resume`.
    pub fn pause(&mut self) {
        if !self.paused {
            debug!("Pausing session");
            self.paused = true;
            self.engine.pause_notifications();
        }
    }

    /// Resumes a paused session.
    ///
    /// When paused on verification errors the ignored set is checked again:
    /// if it now covers every error the handshake completes, otherwise the
    /// session fails with [`Error::Verification`].
    #[instrument(skip(self))]
    pub fn resume(&mut self) -> Result<(), Error> {
        if !self.paused {
            return Ok(());
        }
        self.paused = false;
        self.engine.resume_notifications()?;

        if self.verification_pending {
            self.verification_pending = false;
            if !self.ignored.covers(&self.verification_errors) {
                let errors = self.verification_errors.clone();
                return Err(self.abort_with(Error::Verification(errors)));
            }
            self.mark_encrypted();
        }
        self.transmit()
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl<E: SocketEngine> TlsSession<E> {
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    pub fn is_encrypted(&self) -> bool {
        self.handshake == HandshakeState::Encrypted
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn socket_state(&self) -> SocketState {
        self.engine.state()
    }

    /// Errors found by the last verification pass, including ignored ones.
    pub fn verification_errors(&self) -> &[VerificationError] {
        &self.verification_errors
    }

    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_chain
    }

    pub fn negotiated_alpn(&self) -> Option<&[u8]> {
        self.negotiated_alpn.as_deref()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    pub fn cipher_suite(&self) -> Option<SupportedCipherSuite> {
        self.cipher_suite
    }

    pub fn session_ticket(&self) -> Option<&[u8]> {
        self.config.session_ticket.as_deref()
    }

    pub fn configuration(&self) -> &TlsConfiguration {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Plaintext queued but not yet taken by the encryption layer.
    pub fn bytes_to_write(&self) -> usize {
        self.write_buffer.len()
    }

    /// Plaintext ready to `read` without touching the socket.
    pub fn bytes_available(&self) -> usize {
        self.read_buffer.len()
    }

    /// Replaces the set of verification errors to tolerate.
    pub fn set_ignored_errors(&mut self, ignored: IgnoredErrorSet) {
        self.ignored = ignored;
    }

    pub fn ignored_errors(&self) -> &IgnoredErrorSet {
        &self.ignored
    }

    /// Sets the host name used for SNI and certificate matching when no
    /// `peer_verify_name` is configured.
    pub fn set_peer_name(&mut self, host: impl Into<String>) {
        self.expected_host = host.into();
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.events)
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl<E: SocketEngine> TlsSession<E> {
    fn begin_connect(
        &mut self,
        host: &str,
        port: u16,
        resolver: &dyn HostResolver,
    ) -> Result<(), Error> {
        match self.engine.connect_to_host(host, port, resolver) {
            ConnectOutcome::InProgress => {
                self.engine.set_notifications(true, true)?;
                Ok(())
            }
            outcome => self.on_connect_outcome(outcome),
        }
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome) -> Result<(), Error> {
        match outcome {
            ConnectOutcome::Connected => {
                let peer_addr = endpoint(self.engine.peer_address());
                info!(%peer_addr, "Connected");
                self.events.push(SessionEvent::Connected);
                self.spurious_wakeups = 0;
                if self.auto_start {
                    self.auto_start = false;
                    self.start_client_encryption()
                } else {
                    self.engine.set_notifications(true, false)?;
                    Ok(())
                }
            }
            ConnectOutcome::InProgress => Ok(()),
            ConnectOutcome::Failed(kind) => {
                warn!(host = %self.expected_host, %kind, "Connection failed");
                self.auto_start = false;
                Err(Error::Socket(kind))
            }
        }
    }

    fn auto_start_if_due(&mut self) -> Result<(), Error> {
        if self.auto_start
            && self.handshake == HandshakeState::Unencrypted
            && self.engine.state() == SocketState::Connected
        {
            self.auto_start = false;
            self.start_client_encryption()?;
        }
        Ok(())
    }

    fn server_name(&self) -> String {
        if let Some(name) = self.config.peer_verify_name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        if !self.expected_host.is_empty() {
            return self.expected_host.clone();
        }
        self.engine
            .peer_address()
            .and_then(|(address, _)| address.ip())
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    }

    fn begin_handshake(
        &mut self,
        conn: TlsConnection,
        state: HandshakeState,
    ) -> Result<(), Error> {
        let peer_addr = endpoint(self.engine.peer_address());
        info!(%peer_addr, ?state, "Starting TLS handshake");
        self.connection = Some(conn);
        self.handshake = state;
        self.verification_errors.clear();
        self.verification_pending = false;
        self.close_notify_sent = false;
        self.transmit()
    }

    // Runs pump passes until nothing moves; returns whether anything did.
    fn pump(&mut self) -> Result<bool, Error> {
        if self.connection.is_none() {
            return Ok(false);
        }
        let mut progress = false;
        loop {
            if self.paused || self.connection.is_none() {
                break;
            }
            let pass = match self.pump_once() {
                Ok(pass) => pass,
                Err(failure) => return Err(self.on_pump_failure(failure)),
            };
            progress |= pass.progress;
            if pass.handshake_done {
                self.complete_handshake()?;
                progress = true;
                continue;
            }
            if pass.peer_closed {
                self.flush_events();
                self.on_peer_closed()?;
                return Ok(true);
            }
            if !pass.progress {
                break;
            }
        }

        self.flush_events();
        self.continue_close();
        if self.connection.is_some() {
            self.update_interest()?;
        }
        Ok(progress)
    }

    fn pump_once(&mut self) -> Result<Pump, PumpFailure> {
        let mut pass = Pump::default();
        let Some(conn) = self.connection.as_mut() else {
            return Ok(pass);
        };
        let mut io = EngineIo {
            engine: &mut self.engine,
        };

        // Queued plaintext into the encryption layer
        if self.handshake == HandshakeState::Encrypted && !self.write_buffer.is_empty() {
            match conn.writer().write(&self.write_buffer) {
                Ok(0) => {
                    // TLS buffer is full
                }
                Ok(n) => {
                    self.write_buffer.drain(..n);
                    self.plaintext_written += n;
                    pass.progress = true;
                    trace!(len = n, remaining = self.write_buffer.len(), "Wrote plaintext to TLS");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => return Err(PumpFailure::Plaintext(err)),
            }
        }

        // Ciphertext to the engine
        while conn.wants_write() {
            match conn.write_tls(&mut io) {
                Ok(0) => break,
                Ok(n) => {
                    trace!(len = n, "Wrote encrypted data to socket");
                    pass.progress = true;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(PumpFailure::Transport(socket_error_kind(&err))),
            }
        }

        // Ciphertext from the engine
        let mut eof = false;
        match conn.read_tls(&mut io) {
            Ok(0) => eof = true,
            Ok(n) => {
                trace!(len = n, "Read encrypted data from socket");
                pass.progress = true;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) if err.get_ref().is_some_and(|inner| inner.is::<SocketErrorKind>()) => {
                return Err(PumpFailure::Transport(socket_error_kind(&err)));
            }
            Err(err) => {
                // rustls refuses more input until buffered records are processed
                debug!(?err, "Deferred reading encrypted data");
            }
        }

        let io_state = conn.process_new_packets().map_err(PumpFailure::Tls)?;

        if matches!(
            self.handshake,
            HandshakeState::ClientHandshake | HandshakeState::ServerHandshake
        ) && !self.verification_pending
            && !conn.is_handshaking()
        {
            pass.handshake_done = true;
            return Ok(pass);
        }

        // Decrypted bytes to the read buffer, only once the peer is accepted
        if self.handshake == HandshakeState::Encrypted && io_state.plaintext_bytes_to_read() > 0 {
            let start = self.read_buffer.len();
            let result = conn.reader().read_to_end(&mut self.read_buffer);
            let n = self.read_buffer.len() - start;
            if n > 0 {
                self.plaintext_read += n;
                pass.progress = true;
                trace!(len = n, "Read plaintext from TLS");
            }
            match result {
                Ok(_) => {}
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::UnexpectedEof) => {}
                Err(err) => return Err(PumpFailure::Plaintext(err)),
            }
        }

        pass.peer_closed = eof || io_state.peer_has_closed();
        Ok(pass)
    }

    fn on_pump_failure(&mut self, failure: PumpFailure) -> Error {
        let err = match failure {
            PumpFailure::Transport(kind) => Error::Socket(kind),
            PumpFailure::Tls(err) => {
                // Let the peer see our alert before the handle goes away
                if let Some(conn) = self.connection.as_mut() {
                    let mut io = EngineIo {
                        engine: &mut self.engine,
                    };
                    if let Err(err) = conn.write_tls(&mut io) {
                        debug!(?err, "Failed to flush TLS alert");
                    }
                }
                Error::TlsHandshake(err.to_string())
            }
            PumpFailure::Plaintext(err) => Error::Io(err),
        };
        self.abort_with(err)
    }

    // Runs once per handshake, when rustls reports it finished.
    fn complete_handshake(&mut self) -> Result<(), Error> {
        let Some(conn) = self.connection.as_ref() else {
            return Ok(());
        };
        let client = self.handshake == HandshakeState::ClientHandshake;
        self.peer_chain = conn.peer_certificates();
        self.negotiated_alpn = conn.alpn_protocol();
        self.protocol_version = conn.protocol_version();
        self.cipher_suite = conn.negotiated_cipher_suite();

        let mode = self.config.peer_verify_mode;
        let do_verify_peer = mode == PeerVerifyMode::VerifyPeer
            || (mode == PeerVerifyMode::AutoVerifyPeer && client);

        let errors = if mode == PeerVerifyMode::None {
            Vec::new()
        } else if self.peer_chain.is_empty() {
            if do_verify_peer {
                vec![VerificationError::NoPeerCertificate]
            } else {
                Vec::new()
            }
        } else {
            let (purpose, expected) = if client {
                (Purpose::ServerAuth, self.server_name())
            } else {
                (Purpose::ClientAuth, String::new())
            };
            CertificateVerifier::new(&self.config, purpose).verify(&self.peer_chain, &expected)
        };

        self.verification_errors = errors.clone();
        if !errors.is_empty() {
            warn!(?errors, "Peer verification reported errors");
            self.events.push(SessionEvent::PeerVerifyErrors(errors.clone()));
        }

        if !do_verify_peer || self.ignored.covers(&errors) {
            if do_verify_peer && !errors.is_empty() {
                warn!(count = errors.len(), "Ignoring peer verification errors");
            }
            self.mark_encrypted();
            return Ok(());
        }

        if self.config.pause_on_verification_errors {
            info!(count = errors.len(), "Pausing on peer verification errors");
            self.verification_pending = true;
            self.pause();
            self.events.push(SessionEvent::Paused);
            return Ok(());
        }

        Err(self.abort_with(Error::Verification(errors)))
    }

    fn mark_encrypted(&mut self) {
        let peer_addr = endpoint(self.engine.peer_address());
        info!(%peer_addr, version = ?self.protocol_version, "TLS handshake completed");
        self.handshake = HandshakeState::Encrypted;
        self.events.push(SessionEvent::Encrypted);
    }

    fn on_peer_closed(&mut self) -> Result<(), Error> {
        match self.handshake {
            HandshakeState::ClientHandshake | HandshakeState::ServerHandshake => Err(self
                .abort_with(Error::TlsHandshake(
                    "Connection closed during handshake".to_string(),
                ))),
            _ => {
                self.finish_close("Connection closed by peer");
                Ok(())
            }
        }
    }

    // Sends close_notify once queued plaintext is gone, then closes. Plaintext
    // queued during the handshake holds the close until it is encrypted.
    fn continue_close(&mut self) {
        if !self.pending_close || !self.write_buffer.is_empty() {
            return;
        }
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if !self.close_notify_sent {
            conn.send_close_notify();
            self.close_notify_sent = true;
        }
        let mut io = EngineIo {
            engine: &mut self.engine,
        };
        let mut failed = false;
        while conn.wants_write() {
            match conn.write_tls(&mut io) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "Failed to flush before close");
                    failed = true;
                    break;
                }
            }
        }
        if failed || !conn.wants_write() {
            self.finish_close("Closed TLS session");
        }
    }

    fn finish_close(&mut self, reason: &str) {
        let local_addr = endpoint(self.engine.local_address());
        let peer_addr = endpoint(self.engine.peer_address());
        info!(%local_addr, %peer_addr, "{reason}");
        self.connection = None;
        self.engine.close();
        self.handshake = HandshakeState::Unencrypted;
        self.write_buffer.clear();
        self.pending_close = false;
        self.close_notify_sent = false;
        self.verification_pending = false;
        self.paused = false;
        self.events.push(SessionEvent::Disconnected);
    }

    // Closes the engine after a failure and returns the error to report.
    fn abort_with(&mut self, err: Error) -> Error {
        let local_addr = endpoint(self.engine.local_address());
        let peer_addr = endpoint(self.engine.peer_address());
        error!(%local_addr, %peer_addr, %err, "TLS session failed");

        let was_encrypted = self.handshake == HandshakeState::Encrypted;
        self.handshake = match self.handshake {
            HandshakeState::ClientHandshake | HandshakeState::ServerHandshake => {
                HandshakeState::Failed
            }
            HandshakeState::Failed => HandshakeState::Failed,
            _ => HandshakeState::Unencrypted,
        };
        self.connection = None;
        self.write_buffer.clear();
        self.pending_close = false;
        self.verification_pending = false;
        self.paused = false;
        self.engine.close();
        if was_encrypted {
            self.events.push(SessionEvent::Disconnected);
        }
        err
    }

    fn update_interest(&mut self) -> Result<(), Error> {
        let write = self.connection.as_ref().is_some_and(|conn| {
            conn.wants_write()
                || (self.handshake == HandshakeState::Encrypted && !self.write_buffer.is_empty())
        });
        self.engine.set_notifications(true, write)?;
        Ok(())
    }

    fn flush_events(&mut self) {
        if self.plaintext_written > 0 {
            let n = mem::take(&mut self.plaintext_written);
            self.events.push(SessionEvent::BytesWritten(n));
        }
        if self.plaintext_read > 0 {
            self.plaintext_read = 0;
            self.events.push(SessionEvent::ReadyRead);
        }
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.engine.read(buf)? {
            Transfer::Done(0) if !buf.is_empty() => {
                self.finish_close("Connection closed by peer");
                Ok(0)
            }
            Transfer::Done(n) => Ok(n),
            Transfer::WouldBlock => Ok(0),
        }
    }

    // Reads unencrypted bytes into the read buffer until `limit` is reached
    // or the engine would block.
    fn fill_plain(&mut self, limit: usize) -> Result<bool, Error> {
        let mut progress = false;
        let mut chunk = vec![0u8; PLAIN_READ_CHUNK];
        while self.read_buffer.len() < limit {
            match self.engine.read(&mut chunk)? {
                Transfer::Done(0) => {
                    self.finish_close("Connection closed by peer");
                    return Ok(true);
                }
                Transfer::Done(n) => {
                    self.read_buffer.extend_from_slice(&chunk[..n]);
                    progress = true;
                }
                Transfer::WouldBlock => break,
            }
        }
        if progress {
            self.events.push(SessionEvent::ReadyRead);
        }
        Ok(progress)
    }

    fn track_spurious_wakeup(&mut self, is_spurious: bool) {
        if is_spurious {
            warn!("Spurious wakeup");
            self.spurious_wakeups += 1;
            if self.spurious_wakeups > self.engine.settings().max_spurious_wakeups {
                error!(
                    count = self.spurious_wakeups,
                    "Too many spurious wakeups. Something is wrong."
                );
            }
        } else {
            self.spurious_wakeups = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_socket_error_survives_rustls_io() {
        let err = io::Error::other(SocketErrorKind::ConnectionRefused);
        assert_eq!(socket_error_kind(&err), SocketErrorKind::ConnectionRefused);
    }

    #[test]
    fn foreign_io_error_becomes_unknown() {
        let err = io::Error::new(ErrorKind::InvalidData, "garbage");
        assert!(matches!(socket_error_kind(&err), SocketErrorKind::Unknown(msg) if msg == "garbage"));
    }
}
