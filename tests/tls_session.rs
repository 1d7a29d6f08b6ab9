//! TLS Session Integration Tests
//!
//! Each test runs a listener, a client session and the accepted server
//! session on one reactor in the test thread.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test tls_session -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test tls_session -- --nocapture
//! ```

mod tls_test_helper;

use mio::Token;
use rustsock::prelude::*;
use std::sync::Once;
use std::time::{Duration, Instant};
use tls_test_helper::{generate_test_tls_config, TlsCertGuard};

static INIT: Once = Once::new();

const LISTENER: Token = Token(0);
const CLIENT: Token = Token(1);
const SERVER: Token = Token(2);

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("rustsock={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Client and server configurations sharing one self-signed certificate for
/// `localhost`. The client checks the peer against `peer_name`.
fn test_configs(peer_name: &str) -> (TlsConfiguration, TlsConfiguration, TlsCertGuard) {
    let (config, guard) = generate_test_tls_config(&["localhost"]);
    let mut client = TlsConfiguration::from_config(&config).unwrap();
    client.peer_verify_name = Some(peer_name.to_string());
    let server = TlsConfiguration::from_config(&config).unwrap();
    (client, server, guard)
}

struct Harness {
    reactor: Reactor,
    listener: NativeSocketEngine,
    client: TlsSession,
    server: Option<TlsSession>,
    server_config: TlsConfiguration,
    start_server_tls: bool,
    client_errors: Vec<Error>,
    server_errors: Vec<Error>,
}

impl Harness {
    fn new(client_config: &TlsConfiguration, server_config: TlsConfiguration) -> Self {
        Self::with_settings(client_config, server_config, EngineSettings::default())
    }

    fn with_settings(
        client_config: &TlsConfiguration,
        server_config: TlsConfiguration,
        client_settings: EngineSettings,
    ) -> Self {
        init_tracing();
        let reactor = Reactor::with_capacity(64).unwrap();

        let mut listener = NativeSocketEngine::create(
            NetworkProtocol::IPv4,
            SocketType::Stream,
            EngineSettings::default(),
        )
        .unwrap();
        listener
            .bind(&"127.0.0.1".parse().unwrap(), 0, BindMode::Default)
            .unwrap();
        listener.listen(None).unwrap();
        listener.attach_notifier(reactor.registry(), LISTENER).unwrap();

        let mut client = TlsSession::new(NativeSocketEngine::new(client_settings), client_config);
        client.attach(reactor.registry(), CLIENT).unwrap();

        Self {
            reactor,
            listener,
            client,
            server: None,
            server_config,
            start_server_tls: true,
            client_errors: Vec::new(),
            server_errors: Vec::new(),
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_address().unwrap().1
    }

    fn connect_encrypted(&mut self) {
        let port = self.port();
        if let Err(err) = self
            .client
            .connect_to_host_encrypted("127.0.0.1", port, &SystemResolver)
        {
            self.client_errors.push(err);
        }
    }

    fn server(&mut self) -> &mut TlsSession {
        self.server.as_mut().expect("no connection accepted yet")
    }

    fn step(&mut self) {
        let events = self.reactor.poll(Some(POLL_TIMEOUT)).unwrap();
        for (token, event) in events {
            match token {
                LISTENER => self.accept_all(),
                CLIENT => {
                    if let Err(err) = self.client.handle_event(event) {
                        self.client_errors.push(err);
                    }
                }
                SERVER => {
                    if let Some(server) = self.server.as_mut() {
                        if let Err(err) = server.handle_event(event) {
                            self.server_errors.push(err);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(engine) => {
                    let mut server = TlsSession::new(engine, &self.server_config);
                    server.attach(self.reactor.registry(), SERVER).unwrap();
                    if self.start_server_tls {
                        if let Err(err) = server.start_server_encryption() {
                            self.server_errors.push(err);
                        }
                    }
                    self.server = Some(server);
                }
                Err(SocketErrorKind::WouldBlock) => break,
                Err(kind) => panic!("accept failed: {kind}"),
            }
        }
    }

    /// Polls until `done` holds; false on timeout.
    fn drive_until(&mut self, done: impl Fn(&Harness) -> bool) -> bool {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    fn both_encrypted(&self) -> bool {
        self.client.is_encrypted() && self.server.as_ref().is_some_and(TlsSession::is_encrypted)
    }

    /// Reads from the server until `len` bytes have arrived.
    fn receive_on_server(&mut self, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = Instant::now() + TEST_TIMEOUT;
        while received.len() < len && Instant::now() < deadline {
            let n = self.server().read(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
            if n == 0 {
                self.step();
            }
        }
        received
    }

    /// Reads from the client until `len` bytes have arrived.
    fn receive_on_client(&mut self, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = Instant::now() + TEST_TIMEOUT;
        while received.len() < len && Instant::now() < deadline {
            let n = self.client.read(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
            if n == 0 {
                self.step();
            }
        }
        received
    }
}

fn is_mismatch(err: &Error) -> bool {
    matches!(err, Error::Verification(errors) if errors.iter().any(|e| matches!(e, VerificationError::HostNameMismatch { .. })))
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn handshake_completes_and_exchanges_data() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();

    assert!(h.drive_until(Harness::both_encrypted), "handshake did not complete");
    assert!(h.client_errors.is_empty(), "{:?}", h.client_errors);
    assert!(h.server_errors.is_empty(), "{:?}", h.server_errors);

    let events = h.client.take_events();
    assert!(events.contains(&SessionEvent::Connected));
    assert!(events.contains(&SessionEvent::Encrypted));
    assert!(h.client.verification_errors().is_empty());
    assert_eq!(h.client.peer_certificates().len(), 1);
    assert!(h.client.protocol_version().is_some());
    assert!(h.client.cipher_suite().is_some());

    assert_eq!(h.client.write(b"hello").unwrap(), 5);
    assert_eq!(h.receive_on_server(5), b"hello");

    assert_eq!(h.server().write(b"world").unwrap(), 5);
    assert_eq!(h.receive_on_client(5), b"world");
}

#[test]
fn hostname_mismatch_fails_handshake() {
    let (client_config, server_config, _guard) = test_configs("example.com");
    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();

    assert!(h.drive_until(|h| h.client.handshake_state() == HandshakeState::Failed));
    assert!(h.client_errors.iter().any(is_mismatch), "{:?}", h.client_errors);
    assert!(h
        .client
        .verification_errors()
        .contains(&VerificationError::HostNameMismatch {
            expected: "example.com".to_string()
        }));
    assert!(!h.client.engine().is_valid());
    assert!(!h.client.is_encrypted());

    // Closing a failed session is a no-op, twice
    h.client.close().unwrap();
    h.client.close().unwrap();
    assert_eq!(h.client.handshake_state(), HandshakeState::Failed);
    assert!(h.client.write(b"late").is_err());
}

#[test]
fn verify_peer_rejects_certificate_for_other_host() {
    let (config, _guard) = generate_test_tls_config(&["other.example"]);
    let mut client_config = TlsConfiguration::from_config(&config).unwrap();
    client_config.peer_verify_mode = PeerVerifyMode::VerifyPeer;
    client_config.peer_verify_name = Some("example.com".to_string());
    let server_config = TlsConfiguration::from_config(&config).unwrap();

    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();

    assert!(h.drive_until(|h| h.client.handshake_state() == HandshakeState::Failed));
    assert_eq!(
        h.client.verification_errors(),
        &[VerificationError::HostNameMismatch {
            expected: "example.com".to_string()
        }]
    );
    assert!(!h.client.engine().is_valid());
}

#[test]
fn ignored_mismatch_completes_handshake() {
    let (client_config, server_config, _guard) = test_configs("example.com");
    let mut h = Harness::new(&client_config, server_config);
    h.client.set_ignored_errors(IgnoredErrorSet::from_iter([
        VerificationError::HostNameMismatch {
            expected: "example.com".to_string(),
        },
    ]));
    h.connect_encrypted();

    assert!(h.drive_until(Harness::both_encrypted), "{:?}", h.client_errors);

    // Ignored errors are still reported
    let events = h.client.take_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::PeerVerifyErrors(errors) if !errors.is_empty())));
    assert_eq!(h.client.verification_errors().len(), 1);
}

#[test]
fn unverified_server_without_certificate_cannot_start() {
    let (client_config, _, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, TlsConfiguration::default());
    h.connect_encrypted();

    assert!(h.drive_until(|h| !h.server_errors.is_empty()));
    assert!(matches!(h.server_errors[0], Error::TlsServerConfigMissing));
}

#[test]
fn server_rejects_plaintext_with_alert() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    let port = h.port();
    h.client
        .connect_to_host("127.0.0.1", port, &SystemResolver)
        .unwrap();
    assert!(h.drive_until(|h| {
        h.client.socket_state() == SocketState::Connected && h.server.is_some()
    }));

    h.client.write(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    assert!(h.drive_until(|h| !h.server_errors.is_empty()));
    assert!(
        matches!(h.server_errors[0], Error::TlsHandshake(_)),
        "{:?}",
        h.server_errors
    );
    assert_eq!(h.server().handshake_state(), HandshakeState::Failed);

    // The plain client receives the fatal alert record before the close
    assert!(h.drive_until(|h| h.client.bytes_available() > 0 || !h.client.engine().is_valid()));
    let mut buf = [0u8; 64];
    let n = h.client.read(&mut buf).unwrap();
    assert!(n > 0, "no alert arrived");
    assert_eq!(buf[0], 0x15, "not an alert record");
}

#[test]
fn connection_refused_is_reported() {
    init_tracing();
    let port = {
        let mut probe = NativeSocketEngine::create(
            NetworkProtocol::IPv4,
            SocketType::Stream,
            EngineSettings::default(),
        )
        .unwrap();
        probe
            .bind(&"127.0.0.1".parse().unwrap(), 0, BindMode::Default)
            .unwrap();
        probe.local_address().unwrap().1
    };

    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    if let Err(err) = h
        .client
        .connect_to_host_encrypted("127.0.0.1", port, &SystemResolver)
    {
        h.client_errors.push(err);
    }

    assert!(h.drive_until(|h| !h.client_errors.is_empty()));
    assert!(matches!(
        h.client_errors[0],
        Error::Socket(SocketErrorKind::ConnectionRefused)
    ));
    assert!(!h.client.is_encrypted());
}

// ============================================================================
// Data Transfer
// ============================================================================

#[test]
fn large_transfer_through_small_writes() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let settings = EngineSettings {
        max_write_size: Some(4096),
        ..EngineSettings::default()
    };
    let mut h = Harness::with_settings(&client_config, server_config, settings);
    h.connect_encrypted();
    assert!(h.drive_until(Harness::both_encrypted));
    h.client.take_events();

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    assert_eq!(h.client.write(&payload).unwrap(), payload.len());

    let received = h.receive_on_server(payload.len());
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "payload corrupted in transit");
    assert_eq!(h.client.bytes_to_write(), 0);

    let written: usize = h
        .client
        .take_events()
        .iter()
        .map(|event| match event {
            SessionEvent::BytesWritten(n) => *n,
            _ => 0,
        })
        .sum();
    assert_eq!(written, payload.len());
}

#[test]
fn peek_does_not_consume() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();
    assert!(h.drive_until(Harness::both_encrypted));

    h.client.write(b"abcdef").unwrap();
    assert!(h.drive_until(|h| h.server.as_ref().is_some_and(|s| s.bytes_available() >= 6)));

    assert_eq!(h.server().peek(3).unwrap(), b"abc");
    assert_eq!(h.server().bytes_available(), 6);
    assert_eq!(h.receive_on_server(6), b"abcdef");
}

#[test]
fn plain_connection_upgrades_to_tls() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    h.start_server_tls = false;
    let port = h.port();
    h.client
        .connect_to_host("127.0.0.1", port, &SystemResolver)
        .unwrap();

    assert!(h.drive_until(|h| {
        h.client.socket_state() == SocketState::Connected && h.server.is_some()
    }));
    assert_eq!(h.client.handshake_state(), HandshakeState::Unencrypted);

    // Plain mode passes bytes straight through
    assert_eq!(h.client.write(b"STARTTLS").unwrap(), 8);
    assert_eq!(h.receive_on_server(8), b"STARTTLS");

    h.server().start_server_encryption().unwrap();
    h.client.start_client_encryption().unwrap();
    assert!(h.drive_until(Harness::both_encrypted), "{:?}", h.client_errors);

    h.client.write(b"secret").unwrap();
    assert_eq!(h.receive_on_server(6), b"secret");
}

// ============================================================================
// Pause and Resume
// ============================================================================

#[test]
fn pauses_on_verification_errors_and_resumes() {
    let (mut client_config, server_config, _guard) = test_configs("example.com");
    client_config.pause_on_verification_errors = true;
    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();

    assert!(h.drive_until(|h| h.client.is_paused()));
    assert_eq!(h.client.handshake_state(), HandshakeState::ClientHandshake);
    assert!(h.client.take_events().contains(&SessionEvent::Paused));

    h.client.set_ignored_errors(IgnoredErrorSet::all());
    h.client.resume().unwrap();
    assert!(h.client.is_encrypted());
    assert!(h.drive_until(Harness::both_encrypted));

    h.client.write(b"after resume").unwrap();
    assert_eq!(h.receive_on_server(12), b"after resume");
}

#[test]
fn resume_without_ignoring_errors_fails() {
    let (mut client_config, server_config, _guard) = test_configs("example.com");
    client_config.pause_on_verification_errors = true;
    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();

    assert!(h.drive_until(|h| h.client.is_paused()));
    let err = h.client.resume().unwrap_err();
    assert!(is_mismatch(&err), "{err:?}");
    assert_eq!(h.client.handshake_state(), HandshakeState::Failed);
    assert!(!h.client.engine().is_valid());
}

// ============================================================================
// Close
// ============================================================================

#[test]
fn close_flushes_queued_data_first() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();
    assert!(h.drive_until(Harness::both_encrypted));

    let payload = vec![0x5a; 256 * 1024];
    h.client.write(&payload).unwrap();
    h.client.close().unwrap();
    assert!(h.client.write(b"more").is_err());

    let received = h.receive_on_server(payload.len());
    assert_eq!(received.len(), payload.len());
    assert!(h.drive_until(|h| !h.client.engine().is_valid()));
    assert!(h.client.take_events().contains(&SessionEvent::Disconnected));

    assert!(h.drive_until(|h| h
        .server
        .as_ref()
        .is_some_and(|s| !s.engine().is_valid())));
    assert!(h.server().take_events().contains(&SessionEvent::Disconnected));
    assert_eq!(h.server().handshake_state(), HandshakeState::Unencrypted);
}

#[test]
fn close_during_handshake_delivers_queued_data() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    h.start_server_tls = false;
    let port = h.port();
    h.client
        .connect_to_host("127.0.0.1", port, &SystemResolver)
        .unwrap();
    assert!(h.drive_until(|h| {
        h.client.socket_state() == SocketState::Connected && h.server.is_some()
    }));

    // Queue and close before the server has even started its side
    h.client.start_client_encryption().unwrap();
    assert_eq!(h.client.write(b"early").unwrap(), 5);
    h.client.close().unwrap();
    assert_eq!(h.client.handshake_state(), HandshakeState::ClientHandshake);
    assert_eq!(h.client.bytes_to_write(), 5);
    assert!(h.client.engine().is_valid());
    assert!(h.client.write(b"more").is_err());

    h.server().start_server_encryption().unwrap();
    assert_eq!(h.receive_on_server(5), b"early");
    assert!(h.drive_until(|h| !h.client.engine().is_valid()));
    assert!(h.client_errors.is_empty(), "{:?}", h.client_errors);
    assert!(h.client.take_events().contains(&SessionEvent::Disconnected));
}

#[test]
fn close_during_handshake_without_data_is_immediate() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    h.start_server_tls = false;
    let port = h.port();
    h.client
        .connect_to_host("127.0.0.1", port, &SystemResolver)
        .unwrap();
    assert!(h.drive_until(|h| {
        h.client.socket_state() == SocketState::Connected && h.server.is_some()
    }));

    h.client.start_client_encryption().unwrap();
    h.client.close().unwrap();
    assert!(!h.client.engine().is_valid());
    assert!(h.client.take_events().contains(&SessionEvent::Disconnected));
}

#[test]
fn abort_discards_and_closes() {
    let (client_config, server_config, _guard) = test_configs("localhost");
    let mut h = Harness::new(&client_config, server_config);
    h.connect_encrypted();
    assert!(h.drive_until(Harness::both_encrypted));

    h.client.abort();
    assert!(!h.client.engine().is_valid());
    assert_eq!(h.client.bytes_to_write(), 0);
    assert_eq!(h.client.handshake_state(), HandshakeState::Unencrypted);

    // The server sees the connection go away
    assert!(h.drive_until(|h| h
        .server
        .as_ref()
        .is_some_and(|s| !s.engine().is_valid())));
}
