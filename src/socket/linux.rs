//! Socket engine for Linux and Android.
//!
//! Owns one nonblocking `socket2::Socket`, registers it with a mio
//! [`Registry`] through [`SourceFd`], and speaks `recvmsg`/`sendmsg` directly
//! for datagrams so ancillary data can be attached.

use super::address::{endpoint, from_sock_addr, from_socket_addr, to_socket_addr};
use super::datagram::{decode_receive_control, encode_send_control, ControlBuffer};
use super::error::last_error;
use super::option::{companion, translate, OptionMapping};
use super::*;

use libc::{c_int, c_void};
use mio::unix::SourceFd;
use mio::Interest;
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockAddr, Socket, Type};
use std::io::{ErrorKind, Read};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

const INITIAL_PEEK_SIZE: usize = 8192;

// Internal data type for readiness registration
struct Notifier {
    registry: Registry,
    token: Token,
    read: bool,
    write: bool,
    // Suspended by the owner through pause_notifications()
    paused: bool,
    // Suspended for the duration of wait_for_readiness()
    waiting: bool,
    registered: Option<Interest>,
}

impl Notifier {
    fn wanted(&self) -> Option<Interest> {
        if self.paused || self.waiting {
            return None;
        }
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// [`SocketEngine`] over BSD sockets on Linux.
pub struct LinuxSocketEngine {
    socket: Option<Socket>,
    state: SocketState,
    protocol: NetworkProtocol,
    socket_type: SocketType,
    local: Option<(HostAddress, u16)>,
    peer: Option<(HostAddress, u16)>,
    settings: EngineSettings,
    notifier: Option<Notifier>,
}

// ============================================================================
// Internal Helpers
// ============================================================================

fn retry_once<T>(
    mut op: impl FnMut() -> Result<T, SocketErrorKind>,
) -> Result<T, SocketErrorKind> {
    match op() {
        Err(SocketErrorKind::ResourceExhausted) => {
            warn!("Out of resources, retrying once");
            op()
        }
        result => result,
    }
}

fn setsockopt_int(fd: RawFd, level: c_int, name: c_int, value: c_int) -> Result<(), SocketErrorKind> {
    // SAFETY: value outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const c_int).cast::<c_void>(),
            mem::size_of::<c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(last_error(Operation::Option))
    }
}

fn getsockopt_int(fd: RawFd, level: c_int, name: c_int) -> Result<c_int, SocketErrorKind> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as libc::socklen_t;
    // SAFETY: value and len are valid for writes of the advertised size.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            (&mut value as *mut c_int).cast::<c_void>(),
            &mut len,
        )
    };
    if rc == 0 {
        Ok(value)
    } else {
        Err(last_error(Operation::Option))
    }
}

fn open_socket(
    protocol: NetworkProtocol,
    socket_type: SocketType,
) -> Result<(Socket, NetworkProtocol), SocketErrorKind> {
    let (ty, proto) = match socket_type {
        SocketType::Stream => (Type::STREAM, Protocol::TCP),
        SocketType::Datagram => (Type::DGRAM, Protocol::UDP),
    };
    let domain = match protocol {
        NetworkProtocol::IPv4 => Domain::IPV4,
        NetworkProtocol::IPv6 | NetworkProtocol::AnyIp => Domain::IPV6,
    };
    match Socket::new(domain, ty, Some(proto)) {
        Ok(socket) => Ok((socket, protocol)),
        Err(err)
            if protocol == NetworkProtocol::AnyIp
                && err.raw_os_error() == Some(libc::EAFNOSUPPORT) =>
        {
            debug!("IPv6 unavailable, falling back to IPv4");
            let socket = Socket::new(Domain::IPV4, ty, Some(proto))
                .map_err(|e| from_io(&e, Operation::Create))?;
            Ok((socket, NetworkProtocol::IPv4))
        }
        Err(err) => Err(from_io(&err, Operation::Create)),
    }
}

// Pending ICMP errors stay queued and keep the handle flagged as erroneous
// until read with MSG_ERRQUEUE.
fn drain_error_queue(fd: RawFd) {
    let mut scratch = [0u8; 512];
    let mut control = [0u64; 64];
    loop {
        let mut iov = libc::iovec {
            iov_base: scratch.as_mut_ptr().cast(),
            iov_len: scratch.len(),
        };
        // SAFETY: msghdr is plain data; every pointer set below is valid for
        // the duration of the call.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;
        let rc = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
        if rc < 0 {
            break;
        }
        trace!("Drained queued socket error");
    }
}

fn poll_fd(
    fd: RawFd,
    timeout: Option<Duration>,
    for_read: bool,
    for_write: bool,
) -> Result<(bool, bool), SocketErrorKind> {
    let mut events = 0;
    if for_read {
        events |= libc::POLLIN;
    }
    if for_write {
        events |= libc::POLLOUT;
    }
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        let timeout_ms = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                remaining.as_millis().min(c_int::MAX as u128) as c_int
            }
            None => -1,
        };
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: a single valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            if std::io::Error::last_os_error().kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(last_error(Operation::Wait));
        }
        if rc == 0 {
            return Ok((false, false));
        }
        // Errors are reported as readiness so the next read or write surfaces them
        let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0;
        return Ok((
            for_read && (pfd.revents & libc::POLLIN != 0 || failed),
            for_write && (pfd.revents & libc::POLLOUT != 0 || failed),
        ));
    }
}

impl LinuxSocketEngine {
    fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn socket(&self) -> Result<&Socket, SocketErrorKind> {
        self.socket
            .as_ref()
            .ok_or(SocketErrorKind::UnsupportedOperation)
    }

    fn fetch_addresses(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        self.local = socket
            .local_addr()
            .ok()
            .and_then(|addr| from_sock_addr(&addr, self.protocol));
        self.peer = socket
            .peer_addr()
            .ok()
            .and_then(|addr| from_sock_addr(&addr, self.protocol));
    }

    fn finish_connect(&mut self) {
        self.state = SocketState::Connected;
        self.fetch_addresses();
        let local_addr = endpoint(self.local);
        let peer_addr = endpoint(self.peer);
        info!(%local_addr, %peer_addr, "Connection established");
    }

    fn fail_connect(&mut self, kind: SocketErrorKind) -> ConnectOutcome {
        let peer_addr = endpoint(self.peer);
        match kind {
            SocketErrorKind::ConnectionRefused | SocketErrorKind::TimedOut => {
                info!(%peer_addr, %kind, "Connection failed");
            }
            _ => error!(%peer_addr, %kind, "Connection failed"),
        }
        self.state = SocketState::Unconnected;
        ConnectOutcome::Failed(kind)
    }

    // Reads the pending error of an in-flight connect. None means undecided.
    fn poll_connect(&mut self) -> Option<ConnectOutcome> {
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return Some(self.fail_connect(SocketErrorKind::ConnectionReset)),
        };
        match socket.take_error() {
            Ok(Some(err)) | Err(err) => {
                let kind = from_io(&err, Operation::Connect);
                Some(self.fail_connect(kind))
            }
            Ok(None) => match socket.peer_addr() {
                Ok(_) => {
                    self.finish_connect();
                    Some(ConnectOutcome::Connected)
                }
                Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => None,
                Err(err) => {
                    let kind = from_io(&err, Operation::Connect);
                    Some(self.fail_connect(kind))
                }
            },
        }
    }

    fn accepts_address(&self, addr: &SocketAddr) -> bool {
        match (self.protocol, addr) {
            (NetworkProtocol::IPv4, SocketAddr::V4(_)) => true,
            (NetworkProtocol::IPv4, SocketAddr::V6(v6)) => v6.ip().to_ipv4_mapped().is_some(),
            (NetworkProtocol::IPv6, SocketAddr::V6(_)) => true,
            (NetworkProtocol::IPv6, SocketAddr::V4(_)) => false,
            (NetworkProtocol::AnyIp, _) => true,
        }
    }

    fn sync_notifier(&mut self) -> Result<(), SocketErrorKind> {
        let (Some(fd), Some(notifier)) = (self.raw_fd(), self.notifier.as_mut()) else {
            return Ok(());
        };
        let wanted = notifier.wanted();
        if wanted == notifier.registered {
            return Ok(());
        }
        let mut source = SourceFd(&fd);
        let result = match (wanted, notifier.registered) {
            (Some(interest), None) => {
                notifier
                    .registry
                    .register(&mut source, notifier.token, interest)
            }
            (Some(interest), Some(_)) => {
                notifier
                    .registry
                    .reregister(&mut source, notifier.token, interest)
            }
            (None, Some(_)) => notifier.registry.deregister(&mut source),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => {
                trace!(token = notifier.token.0, interest = ?wanted, "Updated readiness registration");
                notifier.registered = wanted;
                Ok(())
            }
            Err(err) => {
                error!(token = notifier.token.0, ?err, "Failed to update readiness registration");
                Err(from_io(&err, Operation::Wait))
            }
        }
    }

    fn set_waiting(&mut self, waiting: bool) -> Result<(), SocketErrorKind> {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier.waiting = waiting;
        }
        self.sync_notifier()
    }

    fn apply_best_effort(&mut self, option: SocketOption) {
        if let Err(kind) = self.set_option(option, 1) {
            warn!(?option, %kind, "Failed to enable socket option");
        }
    }

    fn enable_error_reporting(&self) {
        let Some(fd) = self.raw_fd() else {
            return;
        };
        let mut options = Vec::new();
        if self.protocol != NetworkProtocol::IPv6 {
            options.push((libc::IPPROTO_IP, libc::IP_RECVERR));
        }
        if self.protocol != NetworkProtocol::IPv4 {
            options.push((libc::IPPROTO_IPV6, libc::IPV6_RECVERR));
        }
        for (level, name) in options {
            if let Err(kind) = setsockopt_int(fd, level, name, 1) {
                warn!(level, name, %kind, "Failed to enable ICMP error reporting");
            }
        }
    }
}

// ============================================================================
// SocketEngine Implementation
// ============================================================================

impl SocketEngine for LinuxSocketEngine {
    fn new(settings: EngineSettings) -> Self {
        Self {
            socket: None,
            state: SocketState::Unconnected,
            protocol: NetworkProtocol::IPv4,
            socket_type: SocketType::Stream,
            local: None,
            peer: None,
            settings,
            notifier: None,
        }
    }

    #[instrument(skip(self))]
    fn initialize(
        &mut self,
        protocol: NetworkProtocol,
        socket_type: SocketType,
    ) -> Result<(), SocketErrorKind> {
        if self.socket.is_some() {
            self.close();
        }

        let (socket, protocol) = retry_once(|| open_socket(protocol, socket_type))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| from_io(&e, Operation::Create))?;
        if protocol == NetworkProtocol::AnyIp {
            if let Err(err) = socket.set_only_v6(false) {
                warn!(?err, "Failed to enable dual-stack mode");
            }
        }

        self.socket = Some(socket);
        self.protocol = protocol;
        self.socket_type = socket_type;
        self.state = SocketState::Unconnected;

        match socket_type {
            SocketType::Datagram => {
                if let Err(kind) = self.set_option(SocketOption::Broadcast, 1) {
                    error!(%kind, "Failed to enable broadcast");
                    self.close();
                    return Err(kind);
                }
                self.apply_best_effort(SocketOption::ReceivePacketInfo);
                self.apply_best_effort(SocketOption::ReceiveHopLimit);
                self.enable_error_reporting();
            }
            SocketType::Stream => self.apply_best_effort(SocketOption::ReceiveOutOfBand),
        }

        debug!(?protocol, ?socket_type, "Created socket");
        // A notifier attached before the handle existed registers now
        self.sync_notifier()
    }

    fn is_valid(&self) -> bool {
        self.socket.is_some()
    }

    fn state(&self) -> SocketState {
        self.state
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn protocol(&self) -> NetworkProtocol {
        self.protocol
    }

    fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn local_address(&self) -> Option<(HostAddress, u16)> {
        self.local
    }

    fn peer_address(&self) -> Option<(HostAddress, u16)> {
        self.peer
    }

    #[instrument(skip(self))]
    fn close(&mut self) {
        self.detach_notifier();
        if let Some(socket) = self.socket.take() {
            let local_addr = endpoint(self.local);
            let peer_addr = endpoint(self.peer);
            self.state = SocketState::Closing;
            drop(socket);
            info!(%local_addr, %peer_addr, "Closed socket");
        }
        self.state = SocketState::Unconnected;
        self.local = None;
        self.peer = None;
    }

    // ============================================================================
    // Connection Management
    // ============================================================================

    #[instrument(skip(self))]
    fn connect(&mut self, address: &HostAddress, port: u16) -> ConnectOutcome {
        match self.state {
            SocketState::Connecting => {
                return self
                    .poll_connect()
                    .unwrap_or(ConnectOutcome::Failed(SocketErrorKind::WouldBlock));
            }
            SocketState::Connected => return ConnectOutcome::Connected,
            SocketState::Listening => {
                return ConnectOutcome::Failed(SocketErrorKind::UnsupportedOperation)
            }
            _ => {}
        }

        let addr = match to_socket_addr(address, port, self.protocol) {
            Ok(addr) => addr,
            Err(kind) => return ConnectOutcome::Failed(kind),
        };
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return ConnectOutcome::Failed(SocketErrorKind::UnsupportedOperation),
        };

        self.peer = Some((*address, port));
        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {
                self.finish_connect();
                ConnectOutcome::Connected
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => {
                    self.state = SocketState::Connecting;
                    let peer_addr = endpoint(self.peer);
                    info!(%peer_addr, "Connection in progress");
                    ConnectOutcome::InProgress
                }
                Some(libc::EISCONN) => {
                    self.finish_connect();
                    ConnectOutcome::Connected
                }
                _ => {
                    let kind = from_io(&err, Operation::Connect);
                    self.fail_connect(kind)
                }
            },
        }
    }

    #[instrument(skip(self, resolver))]
    fn connect_to_host(
        &mut self,
        host: &str,
        port: u16,
        resolver: &dyn HostResolver,
    ) -> ConnectOutcome {
        self.state = SocketState::HostLookup;
        let addrs = match resolver.resolve(host, port) {
            Ok(addrs) if !addrs.is_empty() => addrs,
            Ok(_) => {
                warn!(host, "Host lookup returned no addresses");
                self.state = SocketState::Unconnected;
                return ConnectOutcome::Failed(SocketErrorKind::HostNotFound);
            }
            Err(err) => {
                warn!(host, ?err, "Host lookup failed");
                self.state = SocketState::Unconnected;
                return ConnectOutcome::Failed(SocketErrorKind::HostNotFound);
            }
        };
        debug!(host, count = addrs.len(), "Host lookup finished");

        if self.socket.is_none() {
            let protocol = NetworkProtocol::of(&addrs[0].ip());
            if let Err(kind) = self.initialize(protocol, SocketType::Stream) {
                self.state = SocketState::Unconnected;
                return ConnectOutcome::Failed(kind);
            }
        }
        self.state = SocketState::Unconnected;

        match addrs.iter().find(|addr| self.accepts_address(addr)) {
            Some(addr) => {
                let (address, port) = from_socket_addr(addr, self.protocol);
                self.connect(&address, port)
            }
            None => ConnectOutcome::Failed(SocketErrorKind::ProtocolUnsupported),
        }
    }

    fn connection_notification(&mut self) -> Option<ConnectOutcome> {
        if self.state != SocketState::Connecting {
            return None;
        }
        self.poll_connect()
    }

    #[instrument(skip(self))]
    fn bind(
        &mut self,
        address: &HostAddress,
        port: u16,
        mode: BindMode,
    ) -> Result<(), SocketErrorKind> {
        if self.state != SocketState::Unconnected || self.socket.is_none() {
            return Err(SocketErrorKind::UnsupportedOperation);
        }

        // A group address cannot be bound; the wildcard receives its traffic
        let address = if address.is_multicast() {
            debug!(%address, "Binding wildcard in place of multicast group");
            address.wildcard()
        } else {
            *address
        };

        match mode {
            BindMode::ShareAddress | BindMode::ReuseAddressHint => {
                self.apply_best_effort(SocketOption::AddressReusable)
            }
            BindMode::DontShareAddress => {
                if let Err(kind) = self.set_option(SocketOption::BindExclusively, 1) {
                    debug!(%kind, "Exclusive binding not available");
                }
            }
            BindMode::Default => {}
        }

        let socket = self.socket()?;
        if self.protocol != NetworkProtocol::IPv4 {
            let v6_only = match address {
                HostAddress::AnyIpv6 => true,
                HostAddress::Ipv6 { addr, .. } => addr.to_ipv4_mapped().is_none(),
                _ => false,
            };
            if let Err(err) = socket.set_only_v6(v6_only) {
                warn!(?err, v6_only, "Failed to set IPV6_V6ONLY");
            }
        }

        let addr = to_socket_addr(&address, port, self.protocol)?;
        if let Err(err) = socket.bind(&SockAddr::from(addr)) {
            let kind = from_io(&err, Operation::Bind);
            warn!(%address, port, %kind, "Bind failed");
            return Err(kind);
        }

        self.state = SocketState::Bound;
        self.fetch_addresses();
        let local_addr = endpoint(self.local);
        info!(%local_addr, "Bound socket");
        Ok(())
    }

    #[instrument(skip(self))]
    fn listen(&mut self, backlog: Option<usize>) -> Result<(), SocketErrorKind> {
        if self.state != SocketState::Bound || self.socket_type != SocketType::Stream {
            return Err(SocketErrorKind::UnsupportedOperation);
        }
        let backlog = backlog.unwrap_or(self.settings.listen_backlog);
        self.socket()?
            .listen(backlog.min(c_int::MAX as usize) as c_int)
            .map_err(|e| from_io(&e, Operation::Listen))?;
        self.state = SocketState::Listening;
        let local_addr = endpoint(self.local);
        info!(%local_addr, backlog, "Listening for connections");
        Ok(())
    }

    #[instrument(skip(self))]
    fn accept(&mut self) -> Result<Self, SocketErrorKind> {
        if self.state != SocketState::Listening {
            return Err(SocketErrorKind::UnsupportedOperation);
        }
        let socket = self.socket()?;
        let (accepted, _) = retry_once(|| {
            socket.accept().map_err(|e| from_io(&e, Operation::Accept))
        })?;
        accepted
            .set_nonblocking(true)
            .map_err(|e| from_io(&e, Operation::Accept))?;

        let mut engine = Self::new(self.settings.clone());
        engine.socket = Some(accepted);
        engine.protocol = self.protocol;
        engine.socket_type = SocketType::Stream;
        engine.state = SocketState::Connected;
        engine.fetch_addresses();

        let local_addr = endpoint(engine.local);
        let peer_addr = endpoint(engine.peer);
        info!(%local_addr, %peer_addr, "Accepted connection");
        Ok(engine)
    }

    // ============================================================================
    // Data Operations
    // ============================================================================

    fn bytes_available(&self) -> Result<usize, SocketErrorKind> {
        let fd = self.raw_fd().ok_or(SocketErrorKind::UnsupportedOperation)?;
        let mut available: c_int = 0;
        // SAFETY: FIONREAD writes one int.
        let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
        if rc < 0 {
            return Err(last_error(Operation::Read));
        }
        Ok(available.max(0) as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer, SocketErrorKind> {
        let mut socket = self
            .socket
            .as_ref()
            .ok_or(SocketErrorKind::ConnectionReset)?;
        let len = self
            .settings
            .max_read_size
            .map_or(buf.len(), |max| buf.len().min(max));
        loop {
            match socket.read(&mut buf[..len]) {
                Ok(n) => {
                    trace!(len = n, "Read from socket");
                    return Ok(Transfer::Done(n));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let kind = from_io(&err, Operation::Read);
                    if kind == SocketErrorKind::ConnectionReset
                        && self.socket_type == SocketType::Stream
                    {
                        let peer_addr = endpoint(self.peer);
                        info!(%peer_addr, "Connection reset by peer");
                        return Ok(Transfer::Done(0));
                    }
                    if self.socket_type == SocketType::Datagram {
                        drain_error_queue(socket.as_raw_fd());
                    }
                    return Err(kind);
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Transfer, SocketErrorKind> {
        let socket = self
            .socket
            .as_ref()
            .ok_or(SocketErrorKind::ConnectionReset)?;
        let len = self
            .settings
            .max_write_size
            .map_or(buf.len(), |max| buf.len().min(max));
        loop {
            match socket.send_with_flags(&buf[..len], libc::MSG_NOSIGNAL) {
                Ok(n) => {
                    trace!(len = n, "Wrote to socket");
                    return Ok(Transfer::Done(n));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let kind = from_io(&err, Operation::Write);
                    if kind == SocketErrorKind::ConnectionReset {
                        let peer_addr = endpoint(self.peer);
                        warn!(%peer_addr, "Remote host closed the connection");
                        self.close();
                    }
                    return Err(kind);
                }
            }
        }
    }

    fn has_pending_datagrams(&self) -> bool {
        let Some(fd) = self.raw_fd() else {
            return false;
        };
        let mut byte = 0u8;
        // SAFETY: one writable byte.
        let rc = unsafe { libc::recv(fd, (&mut byte as *mut u8).cast(), 1, libc::MSG_PEEK) };
        // A queued error counts as pending so the next read reports it
        rc >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EAGAIN)
    }

    fn pending_datagram_size(&self) -> Option<usize> {
        let fd = self.raw_fd()?;
        let mut probe = INITIAL_PEEK_SIZE;
        loop {
            let mut buf = vec![0u8; probe];
            // SAFETY: buf is valid for `probe` bytes.
            let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), probe, libc::MSG_PEEK) };
            if rc < 0 {
                if std::io::Error::last_os_error().kind() == ErrorKind::Interrupted {
                    continue;
                }
                return None;
            }
            let size = rc as usize;
            // A full probe may be a truncated view of a larger datagram
            if size < probe {
                trace!(size, "Pending datagram size");
                return Some(size);
            }
            probe *= 2;
        }
    }

    fn receive_datagram(
        &mut self,
        max_len: usize,
        options: HeaderOptions,
    ) -> Result<(Vec<u8>, IpPacketHeader), SocketErrorKind> {
        let fd = self.raw_fd().ok_or(SocketErrorKind::UnsupportedOperation)?;

        // Always receive at least one byte so the datagram is consumed
        let mut payload = vec![0u8; max_len.max(1)];
        let mut control = if options.wants_control() {
            ControlBuffer::with_capacity(ControlBuffer::RECEIVE_CAPACITY)
        } else {
            ControlBuffer::new()
        };
        // SAFETY: sockaddr_storage is plain data.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        // SAFETY: msghdr is plain data; the pointers set below stay valid
        // until recvmsg() returns.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if options.sender {
            msg.msg_name = (&mut storage as *mut libc::sockaddr_storage).cast();
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        }
        if options.wants_control() {
            msg.msg_control = control.as_mut_ptr();
            msg.msg_controllen = control.capacity() as _;
        }

        let received = loop {
            let rc = unsafe { libc::recvmsg(fd, &mut msg, 0) };
            if rc >= 0 {
                break rc as usize;
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => return Err(SocketErrorKind::WouldBlock),
                _ => {
                    let kind = from_io(&err, Operation::ReceiveDatagram);
                    drain_error_queue(fd);
                    debug!(%kind, "Receive failed");
                    return Err(kind);
                }
            }
        };
        payload.truncate(received.min(max_len));

        let mut header = IpPacketHeader::default();
        if options.sender && msg.msg_namelen > 0 {
            // SAFETY: the kernel filled `storage` up to msg_namelen bytes.
            let sender = unsafe { SockAddr::new(storage, msg.msg_namelen) };
            if let Some((address, port)) = from_sock_addr(&sender, self.protocol) {
                header.sender_address = address;
                header.sender_port = port;
            }
        }
        if options.wants_control() {
            control.set_len(msg.msg_controllen as usize);
            let decoded = decode_receive_control(&control, options);
            header.hop_limit = decoded.hop_limit;
            header.interface_index = decoded.interface_index;
            if let Some(destination) = decoded.destination {
                header.destination_address = destination;
            }
        }
        if options.destination {
            header.destination_port = self.local.map_or(0, |(_, port)| port);
        }

        trace!(len = payload.len(), sender = %header.sender_address, "Received datagram");
        Ok((payload, header))
    }

    fn send_datagram(
        &mut self,
        data: &[u8],
        header: &IpPacketHeader,
    ) -> Result<usize, SocketErrorKind> {
        let fd = self.raw_fd().ok_or(SocketErrorKind::UnsupportedOperation)?;

        let destination = if header.destination_address.is_null() {
            // Connected datagram sockets may omit the destination
            if self.state != SocketState::Connected {
                return Err(SocketErrorKind::AddressUnavailable);
            }
            None
        } else {
            Some(to_socket_addr(
                &header.destination_address,
                header.destination_port,
                self.protocol,
            )?)
        };
        let v6 = match destination {
            Some(SocketAddr::V6(v6)) => v6.ip().to_ipv4_mapped().is_none(),
            Some(SocketAddr::V4(_)) => false,
            None => self.protocol != NetworkProtocol::IPv4,
        };
        let destination = destination.map(SockAddr::from);
        let mut control = encode_send_control(header, v6);

        let mut iov = libc::iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: data.len(),
        };
        // SAFETY: msghdr is plain data; the pointers set below stay valid
        // until sendmsg() returns, and sendmsg() does not write through them.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(destination) = destination.as_ref() {
            msg.msg_name = destination.as_ptr() as *mut c_void;
            msg.msg_namelen = destination.len();
        }
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !control.is_empty() {
            msg.msg_controllen = control.len() as _;
            msg.msg_control = control.as_mut_ptr();
        }

        loop {
            let rc = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
            if rc >= 0 {
                trace!(len = rc, destination = %header.destination_address, "Sent datagram");
                return Ok(rc as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => return Err(SocketErrorKind::WouldBlock),
                _ => {
                    let kind = from_io(&err, Operation::SendDatagram);
                    debug!(%kind, "Send failed");
                    return Err(kind);
                }
            }
        }
    }

    #[instrument(skip(self))]
    fn join_multicast_group(
        &mut self,
        group: &HostAddress,
        interface_index: u32,
    ) -> Result<(), SocketErrorKind> {
        let socket = self.socket()?;
        let result = match (group, self.protocol) {
            (HostAddress::Ipv4(addr), NetworkProtocol::IPv4 | NetworkProtocol::AnyIp)
                if addr.is_multicast() =>
            {
                if interface_index == 0 {
                    socket.join_multicast_v4(addr, &Ipv4Addr::UNSPECIFIED)
                } else {
                    socket.join_multicast_v4_n(
                        addr,
                        &InterfaceIndexOrAddress::Index(interface_index),
                    )
                }
            }
            (HostAddress::Ipv6 { addr, .. }, NetworkProtocol::IPv6 | NetworkProtocol::AnyIp)
                if addr.is_multicast() =>
            {
                socket.join_multicast_v6(addr, interface_index)
            }
            _ => return Err(SocketErrorKind::UnsupportedOperation),
        };
        result.map_err(|e| from_io(&e, Operation::Option))?;
        info!(%group, interface_index, "Joined multicast group");
        Ok(())
    }

    #[instrument(skip(self))]
    fn leave_multicast_group(
        &mut self,
        group: &HostAddress,
        interface_index: u32,
    ) -> Result<(), SocketErrorKind> {
        let socket = self.socket()?;
        let result = match (group, self.protocol) {
            (HostAddress::Ipv4(addr), NetworkProtocol::IPv4 | NetworkProtocol::AnyIp)
                if addr.is_multicast() =>
            {
                if interface_index == 0 {
                    socket.leave_multicast_v4(addr, &Ipv4Addr::UNSPECIFIED)
                } else {
                    socket.leave_multicast_v4_n(
                        addr,
                        &InterfaceIndexOrAddress::Index(interface_index),
                    )
                }
            }
            (HostAddress::Ipv6 { addr, .. }, NetworkProtocol::IPv6 | NetworkProtocol::AnyIp)
                if addr.is_multicast() =>
            {
                socket.leave_multicast_v6(addr, interface_index)
            }
            _ => return Err(SocketErrorKind::UnsupportedOperation),
        };
        result.map_err(|e| from_io(&e, Operation::Option))?;
        info!(%group, interface_index, "Left multicast group");
        Ok(())
    }

    fn set_option(&mut self, option: SocketOption, value: i32) -> Result<(), SocketErrorKind> {
        let socket = self.socket()?;
        match translate(option, self.protocol)? {
            OptionMapping::FileStatusNonBlocking => socket
                .set_nonblocking(value != 0)
                .map_err(|e| from_io(&e, Operation::Option)),
            OptionMapping::SockOpt { level, name } => {
                let fd = socket.as_raw_fd();
                setsockopt_int(fd, level, name, value)?;
                if let Some(OptionMapping::SockOpt { level, name }) =
                    companion(option, self.protocol)
                {
                    if let Err(kind) = setsockopt_int(fd, level, name, value) {
                        debug!(?option, %kind, "IPv4 counterpart not applied");
                    }
                }
                Ok(())
            }
        }
    }

    fn option(&self, option: SocketOption) -> Result<i32, SocketErrorKind> {
        let fd = self.raw_fd().ok_or(SocketErrorKind::UnsupportedOperation)?;
        match translate(option, self.protocol)? {
            OptionMapping::FileStatusNonBlocking => {
                // SAFETY: F_GETFL takes no pointer arguments.
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                if flags < 0 {
                    return Err(last_error(Operation::Option));
                }
                Ok(i32::from(flags & libc::O_NONBLOCK != 0))
            }
            OptionMapping::SockOpt { level, name } => getsockopt_int(fd, level, name),
        }
    }

    // ============================================================================
    // Readiness Notification
    // ============================================================================

    fn attach_notifier(
        &mut self,
        registry: &Registry,
        token: Token,
    ) -> Result<(), SocketErrorKind> {
        self.detach_notifier();
        let registry = registry
            .try_clone()
            .map_err(|e| from_io(&e, Operation::Wait))?;
        self.notifier = Some(Notifier {
            registry,
            token,
            read: true,
            write: self.state == SocketState::Connecting,
            paused: false,
            waiting: false,
            registered: None,
        });
        self.sync_notifier()
    }

    fn detach_notifier(&mut self) {
        let fd = self.raw_fd();
        if let Some(notifier) = self.notifier.take() {
            if let (Some(fd), Some(_)) = (fd, notifier.registered) {
                if let Err(err) = notifier.registry.deregister(&mut SourceFd(&fd)) {
                    warn!(token = notifier.token.0, ?err, "Failed to deregister socket");
                }
            }
        }
    }

    fn set_notifications(&mut self, read: bool, write: bool) -> Result<(), SocketErrorKind> {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier.read = read;
            notifier.write = write;
        }
        self.sync_notifier()
    }

    fn notifications(&self) -> (bool, bool) {
        self.notifier
            .as_ref()
            .map_or((false, false), |notifier| (notifier.read, notifier.write))
    }

    fn pause_notifications(&mut self) {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier.paused = true;
        }
        if let Err(kind) = self.sync_notifier() {
            warn!(%kind, "Failed to pause readiness notification");
        }
    }

    fn resume_notifications(&mut self) -> Result<(), SocketErrorKind> {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier.paused = false;
        }
        self.sync_notifier()
    }

    #[instrument(skip(self))]
    fn wait_for_readiness(
        &mut self,
        timeout: Option<Duration>,
        for_read: bool,
        for_write: bool,
    ) -> Result<(bool, bool), SocketErrorKind> {
        let fd = self.raw_fd().ok_or(SocketErrorKind::UnsupportedOperation)?;

        self.set_waiting(true)?;
        let result = poll_fd(fd, timeout, for_read, for_write);
        let restored = self.set_waiting(false);
        let (can_read, can_write) = result?;
        restored?;

        if self.state == SocketState::Connecting && (can_read || can_write) {
            if let Some(ConnectOutcome::Failed(kind)) = self.poll_connect() {
                return Err(kind);
            }
        }
        trace!(can_read, can_write, "Wait finished");
        Ok((can_read, can_write))
    }
}

impl Drop for LinuxSocketEngine {
    fn drop(&mut self) {
        self.close();
    }
}
