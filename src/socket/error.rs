//! Normalization of platform error codes into [`SocketErrorKind`].

use std::io;
use thiserror::Error;

/// Closed taxonomy of transport-level failures.
///
/// Every platform error code maps to exactly one kind. Codes without a
/// dedicated kind become [`SocketErrorKind::Unknown`] carrying the platform's
/// own description, so nothing is silently swallowed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketErrorKind {
    #[error("Out of resources")]
    ResourceExhausted,

    #[error("The address is already in use")]
    AddressInUse,

    #[error("The address is not available")]
    AddressUnavailable,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("Host unreachable")]
    HostUnreachable,

    #[error("Permission denied")]
    AccessDenied,

    #[error("Connection timed out")]
    TimedOut,

    #[error("Protocol type not supported")]
    ProtocolUnsupported,

    /// The operation could not complete without blocking. Not fatal.
    #[error("Operation would block")]
    WouldBlock,

    /// The remote host closed or reset the connection.
    #[error("The remote host closed the connection")]
    ConnectionReset,

    #[error("Datagram was too large to send")]
    DatagramTooLarge,

    #[error("Host not found")]
    HostNotFound,

    /// The option or operation is not available on this platform or in the
    /// socket's current state.
    #[error("Unsupported socket operation")]
    UnsupportedOperation,

    #[error("Unknown socket error: {0}")]
    Unknown(String),
}

impl SocketErrorKind {
    /// Whether a single immediate retry of the failed operation is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted | Self::Unknown(_))
    }
}

// The same errno means different things depending on the call that produced
// it (EINVAL from connect() is a refused connection, from bind() an
// unsupported address), so mapping is keyed by operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Create,
    Connect,
    Bind,
    Listen,
    Accept,
    Read,
    Write,
    ReceiveDatagram,
    SendDatagram,
    Option,
    Wait,
}

pub(crate) fn from_errno(errno: i32, op: Operation) -> SocketErrorKind {
    match errno {
        libc::EAGAIN | libc::EINPROGRESS | libc::EALREADY => SocketErrorKind::WouldBlock,
        libc::ENFILE | libc::EMFILE | libc::ENOBUFS | libc::ENOMEM => {
            SocketErrorKind::ResourceExhausted
        }
        libc::EACCES | libc::EPERM => SocketErrorKind::AccessDenied,
        libc::EADDRINUSE => SocketErrorKind::AddressInUse,
        libc::EADDRNOTAVAIL => SocketErrorKind::AddressUnavailable,
        libc::ECONNREFUSED => SocketErrorKind::ConnectionRefused,
        libc::ENETUNREACH | libc::ENETDOWN => SocketErrorKind::NetworkUnreachable,
        libc::EHOSTUNREACH | libc::EHOSTDOWN => SocketErrorKind::HostUnreachable,
        libc::ETIMEDOUT => SocketErrorKind::TimedOut,
        libc::EPROTONOSUPPORT | libc::EAFNOSUPPORT | libc::EPROTOTYPE | libc::ESOCKTNOSUPPORT => {
            SocketErrorKind::ProtocolUnsupported
        }
        libc::ECONNRESET | libc::EPIPE | libc::ECONNABORTED | libc::ENOTCONN => {
            SocketErrorKind::ConnectionReset
        }
        libc::EMSGSIZE => SocketErrorKind::DatagramTooLarge,
        libc::EOPNOTSUPP | libc::ENOPROTOOPT => SocketErrorKind::UnsupportedOperation,
        libc::EINVAL => match op {
            Operation::Connect => SocketErrorKind::ConnectionRefused,
            Operation::Create => SocketErrorKind::ProtocolUnsupported,
            _ => SocketErrorKind::UnsupportedOperation,
        },
        other => SocketErrorKind::Unknown(io::Error::from_raw_os_error(other).to_string()),
    }
}

pub(crate) fn from_io(err: &io::Error, op: Operation) -> SocketErrorKind {
    match err.raw_os_error() {
        Some(errno) => from_errno(errno, op),
        None if err.kind() == io::ErrorKind::WouldBlock => SocketErrorKind::WouldBlock,
        None => SocketErrorKind::Unknown(err.to_string()),
    }
}

pub(crate) fn last_error(op: Operation) -> SocketErrorKind {
    from_io(&io::Error::last_os_error(), op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn einval_depends_on_operation() {
        assert_eq!(
            from_errno(libc::EINVAL, Operation::Connect),
            SocketErrorKind::ConnectionRefused
        );
        assert_eq!(
            from_errno(libc::EINVAL, Operation::Bind),
            SocketErrorKind::UnsupportedOperation
        );
        assert_eq!(
            from_errno(libc::EINVAL, Operation::Create),
            SocketErrorKind::ProtocolUnsupported
        );
    }

    #[test]
    fn resource_errors_are_transient() {
        for errno in [libc::ENFILE, libc::EMFILE, libc::ENOBUFS, libc::ENOMEM] {
            let kind = from_errno(errno, Operation::Create);
            assert_eq!(kind, SocketErrorKind::ResourceExhausted);
            assert!(kind.is_transient());
        }
        assert!(!SocketErrorKind::AddressInUse.is_transient());
        assert!(!SocketErrorKind::ConnectionRefused.is_transient());
    }

    #[test]
    fn unmapped_errno_keeps_diagnostic() {
        let kind = from_errno(libc::EXDEV, Operation::Write);
        match kind {
            SocketErrorKind::Unknown(text) => assert!(!text.is_empty()),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn io_error_without_errno() {
        let err = io::Error::new(io::ErrorKind::WouldBlock, "later");
        assert_eq!(from_io(&err, Operation::Read), SocketErrorKind::WouldBlock);
        let err = io::Error::other("boom");
        assert!(matches!(
            from_io(&err, Operation::Read),
            SocketErrorKind::Unknown(_)
        ));
    }
}
