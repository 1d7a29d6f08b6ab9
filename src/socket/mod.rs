//! Nonblocking socket engine.
//!
//! This module provides the [`SocketEngine`] trait, one implementation per
//! platform selected at compile time ([`NativeSocketEngine`]), and the pure
//! translation layers it is built on: addresses ([`address`]), options
//! ([`option`]) and datagram ancillary data ([`datagram`]).

pub mod address;
pub mod datagram;
mod error;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
pub mod option;

pub use address::HostAddress;
pub use datagram::{HeaderOptions, IpPacketHeader};
pub use error::SocketErrorKind;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxSocketEngine;
pub use option::SocketOption;

pub(crate) use error::{from_io, Operation};

/// The engine for the platform this crate was built for.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type NativeSocketEngine = LinuxSocketEngine;

use crate::config::{get_namespaced_usize, optional};
use crate::error::Error;
use ::config::Config;
use mio::{Registry, Token};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    IPv4,
    IPv6,
    /// Dual-stack IPv6 socket that also carries IPv4 traffic.
    AnyIp,
}

impl NetworkProtocol {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => NetworkProtocol::IPv4,
            IpAddr::V6(_) => NetworkProtocol::IPv6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Unconnected,
    HostLookup,
    Connecting,
    Connected,
    Bound,
    Listening,
    Closing,
}

/// Result of a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The attempt is under way; wait for writability.
    InProgress,
    Failed(SocketErrorKind),
}

/// Result of a read or write that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes moved. A stream read of `Done(0)` is an orderly close.
    Done(usize),
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    #[default]
    Default,
    ShareAddress,
    DontShareAddress,
    ReuseAddressHint,
}

/// Readiness reported by the event loop for one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEvent {
    Readable,
    Writable,
    Closed,
}

// ============================================================================
// Settings
// ============================================================================

const DEFAULT_LISTEN_BACKLOG: usize = 50;
const DEFAULT_MAX_SPURIOUS_WAKEUPS: usize = 10;

/// Tunables shared by an engine and every engine it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound on bytes moved by a single `read` call.
    pub max_read_size: Option<usize>,
    /// Upper bound on bytes moved by a single `write` call.
    pub max_write_size: Option<usize>,
    pub listen_backlog: usize,
    pub max_spurious_wakeups: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_read_size: None,
            max_write_size: None,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            max_spurious_wakeups: DEFAULT_MAX_SPURIOUS_WAKEUPS,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads settings from `config`, preferring keys under `name.`.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let usize_key = |key: &str| optional(get_namespaced_usize(config, name, key));
        let defaults = Self::default();
        Ok(Self {
            max_read_size: usize_key("max_read_size")?.filter(|size| *size > 0),
            max_write_size: usize_key("max_write_size")?.filter(|size| *size > 0),
            listen_backlog: usize_key("listen_backlog")?.unwrap_or(defaults.listen_backlog),
            max_spurious_wakeups: usize_key("max_spurious_wakeups")?
                .unwrap_or(defaults.max_spurious_wakeups),
        })
    }
}

// ============================================================================
// Host Resolution
// ============================================================================

/// Turns a host name into candidate addresses for `connect_to_host`.
pub trait HostResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system's `getaddrinfo` via [`ToSocketAddrs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

// ============================================================================
// Engine Trait
// ============================================================================

/// A nonblocking socket owning exactly one platform handle.
///
/// Every operation returns immediately. Work that cannot complete reports
/// [`Transfer::WouldBlock`], [`ConnectOutcome::InProgress`] or
/// [`SocketErrorKind::WouldBlock`], and the caller retries once the readiness
/// notifier attached with [`attach_notifier`](SocketEngine::attach_notifier)
/// fires. The handle is released exactly once, by [`close`](SocketEngine::close)
/// or on drop.
pub trait SocketEngine: Sized {
    // ============================================================================
    // Lifecycle
    // ============================================================================

    /// An engine without a handle, in state `Unconnected`.
    fn new(settings: EngineSettings) -> Self;

    /// Allocates the handle in nonblocking mode.
    fn initialize(
        &mut self,
        protocol: NetworkProtocol,
        socket_type: SocketType,
    ) -> Result<(), SocketErrorKind>;

    fn create(
        protocol: NetworkProtocol,
        socket_type: SocketType,
        settings: EngineSettings,
    ) -> Result<Self, SocketErrorKind> {
        let mut engine = Self::new(settings);
        engine.initialize(protocol, socket_type)?;
        Ok(engine)
    }

    fn is_valid(&self) -> bool;
    fn state(&self) -> SocketState;
    fn socket_type(&self) -> SocketType;
    fn protocol(&self) -> NetworkProtocol;
    fn settings(&self) -> &EngineSettings;
    fn local_address(&self) -> Option<(HostAddress, u16)>;
    fn peer_address(&self) -> Option<(HostAddress, u16)>;

    /// Releases the handle. Calling it again does nothing.
    fn close(&mut self);

    // ============================================================================
    // Connection Management
    // ============================================================================

    fn connect(&mut self, address: &HostAddress, port: u16) -> ConnectOutcome;

    /// Resolves `host` and connects to the first usable address.
    fn connect_to_host(
        &mut self,
        host: &str,
        port: u16,
        resolver: &dyn HostResolver,
    ) -> ConnectOutcome;

    /// Re-checks a pending connect after the handle became writable.
    ///
    /// Returns `None` while the attempt is still undecided.
    fn connection_notification(&mut self) -> Option<ConnectOutcome>;

    fn bind(
        &mut self,
        address: &HostAddress,
        port: u16,
        mode: BindMode,
    ) -> Result<(), SocketErrorKind>;
    fn listen(&mut self, backlog: Option<usize>) -> Result<(), SocketErrorKind>;
    fn accept(&mut self) -> Result<Self, SocketErrorKind>;

    // ============================================================================
    // Data Operations
    // ============================================================================

    fn bytes_available(&self) -> Result<usize, SocketErrorKind>;
    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer, SocketErrorKind>;
    fn write(&mut self, buf: &[u8]) -> Result<Transfer, SocketErrorKind>;

    fn has_pending_datagrams(&self) -> bool;
    fn pending_datagram_size(&self) -> Option<usize>;
    fn receive_datagram(
        &mut self,
        max_len: usize,
        options: HeaderOptions,
    ) -> Result<(Vec<u8>, IpPacketHeader), SocketErrorKind>;
    fn send_datagram(
        &mut self,
        data: &[u8],
        header: &IpPacketHeader,
    ) -> Result<usize, SocketErrorKind>;

    fn join_multicast_group(
        &mut self,
        group: &HostAddress,
        interface_index: u32,
    ) -> Result<(), SocketErrorKind>;
    fn leave_multicast_group(
        &mut self,
        group: &HostAddress,
        interface_index: u32,
    ) -> Result<(), SocketErrorKind>;

    fn set_option(&mut self, option: SocketOption, value: i32) -> Result<(), SocketErrorKind>;
    fn option(&self, option: SocketOption) -> Result<i32, SocketErrorKind>;

    // ============================================================================
    // Readiness Notification
    // ============================================================================

    /// Registers the handle with an event loop under `token`.
    fn attach_notifier(&mut self, registry: &Registry, token: Token)
        -> Result<(), SocketErrorKind>;
    fn detach_notifier(&mut self);
    /// Selects which readiness kinds the attached notifier reports.
    fn set_notifications(&mut self, read: bool, write: bool) -> Result<(), SocketErrorKind>;
    fn notifications(&self) -> (bool, bool);
    fn pause_notifications(&mut self);
    fn resume_notifications(&mut self) -> Result<(), SocketErrorKind>;

    /// Blocks up to `timeout` until the handle is readable and/or writable.
    ///
    /// The asynchronous notifier is suspended for the duration of the wait.
    /// A timeout yields `(false, false)`.
    fn wait_for_readiness(
        &mut self,
        timeout: Option<Duration>,
        for_read: bool,
        for_write: bool,
    ) -> Result<(bool, bool), SocketErrorKind>;
}
