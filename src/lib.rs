//! rustsock - Nonblocking sockets with a layered TLS session
//!
//! rustsock wraps the operating system's socket API in a [`SocketEngine`]: a
//! nonblocking stream or datagram handle with a normalized error model, socket
//! option and address translation, per-datagram IP header metadata, and
//! readiness notification through a `mio` event loop driven by a [`Reactor`].
//!
//! With the `tls` feature (enabled by default) a [`TlsSession`](tls::TlsSession)
//! layers TLS over an engine. The session starts in plain mode, upgrades on
//! request, verifies the peer certificate with its own hostname and denylist
//! rules, and lets callers tolerate selected verification errors.

// NativeSocketEngine and the default TlsSession engine name the Linux backend
#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("rustsock has a native socket engine for Linux and Android only");

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;

pub mod reactor;
pub mod socket;
#[cfg(feature = "tls")]
pub mod tls;

// These are the intended public API
pub use error::Error;
pub use reactor::Reactor;
pub use socket::{
    BindMode, ConnectOutcome, EngineSettings, HostAddress, HostResolver, NativeSocketEngine,
    NetworkProtocol, SocketEngine, SocketErrorKind, SocketEvent, SocketOption, SocketState,
    SocketType, SystemResolver, Transfer,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::reactor::Reactor;
    pub use crate::socket::{
        BindMode, ConnectOutcome, EngineSettings, HeaderOptions, HostAddress, IpPacketHeader,
        NativeSocketEngine, NetworkProtocol, SocketEngine, SocketErrorKind, SocketEvent,
        SocketOption, SocketState, SocketType, SystemResolver, Transfer,
    };

    #[cfg(feature = "tls")]
    pub use crate::tls::{
        HandshakeState, IgnoredErrorSet, PeerVerifyMode, SessionEvent, TlsConfiguration,
        TlsSession, VerificationError,
    };
}
