//! Mapping of abstract socket options onto platform `(level, name)` pairs.

use super::{NetworkProtocol, SocketErrorKind};
use libc::c_int;

/// Socket options understood by [`SocketEngine`](super::SocketEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    ReceiveBufferSize,
    SendBufferSize,
    Broadcast,
    AddressReusable,
    BindExclusively,
    ReceiveOutOfBand,
    LowDelay,
    KeepAlive,
    MulticastTtl,
    MulticastLoopback,
    ReceivePacketInfo,
    ReceiveHopLimit,
    NonBlocking,
}

/// How an option is applied to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionMapping {
    /// A plain `setsockopt`/`getsockopt` integer option.
    SockOpt { level: c_int, name: c_int },
    /// Emulated through the handle's `O_NONBLOCK` file-status flag.
    FileStatusNonBlocking,
}

const fn sockopt(level: c_int, name: c_int) -> OptionMapping {
    OptionMapping::SockOpt { level, name }
}

/// Looks up `option` for a socket of family `protocol`.
///
/// Options that the platform cannot express return
/// [`SocketErrorKind::UnsupportedOperation`].
pub fn translate(
    option: SocketOption,
    protocol: NetworkProtocol,
) -> Result<OptionMapping, SocketErrorKind> {
    let v6 = protocol != NetworkProtocol::IPv4;
    let mapping = match option {
        SocketOption::NonBlocking => OptionMapping::FileStatusNonBlocking,
        SocketOption::ReceiveBufferSize => sockopt(libc::SOL_SOCKET, libc::SO_RCVBUF),
        SocketOption::SendBufferSize => sockopt(libc::SOL_SOCKET, libc::SO_SNDBUF),
        SocketOption::Broadcast => sockopt(libc::SOL_SOCKET, libc::SO_BROADCAST),
        SocketOption::AddressReusable => sockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR),
        SocketOption::ReceiveOutOfBand => sockopt(libc::SOL_SOCKET, libc::SO_OOBINLINE),
        SocketOption::KeepAlive => sockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE),
        SocketOption::LowDelay => sockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY),
        SocketOption::MulticastTtl if v6 => {
            sockopt(libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS)
        }
        SocketOption::MulticastTtl => sockopt(libc::IPPROTO_IP, libc::IP_MULTICAST_TTL),
        SocketOption::MulticastLoopback if v6 => {
            sockopt(libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP)
        }
        SocketOption::MulticastLoopback => sockopt(libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP),
        SocketOption::ReceivePacketInfo if v6 => {
            sockopt(libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
        }
        SocketOption::ReceivePacketInfo => sockopt(libc::IPPROTO_IP, libc::IP_PKTINFO),
        SocketOption::ReceiveHopLimit if v6 => {
            sockopt(libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT)
        }
        SocketOption::ReceiveHopLimit => sockopt(libc::IPPROTO_IP, libc::IP_RECVTTL),
        SocketOption::BindExclusively => return Err(SocketErrorKind::UnsupportedOperation),
    };
    Ok(mapping)
}

/// The IPv4-level counterpart that must also be set on a dual-stack socket so
/// that traffic arriving over the IPv4 stack carries the same metadata.
pub fn companion(option: SocketOption, protocol: NetworkProtocol) -> Option<OptionMapping> {
    if protocol != NetworkProtocol::AnyIp {
        return None;
    }
    match option {
        SocketOption::ReceivePacketInfo
        | SocketOption::ReceiveHopLimit
        | SocketOption::MulticastTtl
        | SocketOption::MulticastLoopback => translate(option, NetworkProtocol::IPv4).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonblocking_is_emulated() {
        for protocol in [
            NetworkProtocol::IPv4,
            NetworkProtocol::IPv6,
            NetworkProtocol::AnyIp,
        ] {
            assert_eq!(
                translate(SocketOption::NonBlocking, protocol),
                Ok(OptionMapping::FileStatusNonBlocking)
            );
        }
    }

    #[test]
    fn family_dependent_options() {
        assert_eq!(
            translate(SocketOption::MulticastTtl, NetworkProtocol::IPv4),
            Ok(sockopt(libc::IPPROTO_IP, libc::IP_MULTICAST_TTL))
        );
        assert_eq!(
            translate(SocketOption::MulticastTtl, NetworkProtocol::AnyIp),
            Ok(sockopt(libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS))
        );
        assert_eq!(
            translate(SocketOption::ReceiveHopLimit, NetworkProtocol::IPv4),
            Ok(sockopt(libc::IPPROTO_IP, libc::IP_RECVTTL))
        );
        assert_eq!(
            translate(SocketOption::ReceivePacketInfo, NetworkProtocol::IPv6),
            Ok(sockopt(libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO))
        );
    }

    #[test]
    fn exclusive_bind_unsupported() {
        assert_eq!(
            translate(SocketOption::BindExclusively, NetworkProtocol::IPv4),
            Err(SocketErrorKind::UnsupportedOperation)
        );
    }

    #[test]
    fn companions_only_for_dual_stack() {
        assert_eq!(
            companion(SocketOption::ReceiveHopLimit, NetworkProtocol::AnyIp),
            Some(sockopt(libc::IPPROTO_IP, libc::IP_RECVTTL))
        );
        assert_eq!(
            companion(SocketOption::ReceiveHopLimit, NetworkProtocol::IPv6),
            None
        );
        assert_eq!(companion(SocketOption::KeepAlive, NetworkProtocol::AnyIp), None);
    }
}
