//! Conversion between protocol-agnostic host addresses and wire socket addresses.

use super::{NetworkProtocol, SocketErrorKind};
use socket2::SockAddr;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// A host address that is independent of the socket family it will be used
/// with.
///
/// The three wildcard forms differ in which stacks they cover: `Any` binds
/// both IPv4 and IPv6 on a dual-stack socket, while `AnyIpv4` and `AnyIpv6`
/// are restricted to their own family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostAddress {
    #[default]
    Null,
    Any,
    AnyIpv4,
    AnyIpv6,
    Ipv4(Ipv4Addr),
    Ipv6 { addr: Ipv6Addr, scope_id: u32 },
}

impl HostAddress {
    /// The family this address requires, or `None` for `Null` and `Any`.
    pub fn protocol(&self) -> Option<NetworkProtocol> {
        match self {
            HostAddress::Null | HostAddress::Any => None,
            HostAddress::AnyIpv4 | HostAddress::Ipv4(_) => Some(NetworkProtocol::IPv4),
            HostAddress::AnyIpv6 | HostAddress::Ipv6 { .. } => Some(NetworkProtocol::IPv6),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostAddress::Null)
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(
            self,
            HostAddress::Any | HostAddress::AnyIpv4 | HostAddress::AnyIpv6
        )
    }

    pub fn is_multicast(&self) -> bool {
        match self {
            HostAddress::Ipv4(addr) => addr.is_multicast(),
            HostAddress::Ipv6 { addr, .. } => addr.is_multicast(),
            _ => false,
        }
    }

    pub fn is_loopback(&self) -> bool {
        match self {
            HostAddress::Ipv4(addr) => addr.is_loopback(),
            HostAddress::Ipv6 { addr, .. } => addr.is_loopback(),
            _ => false,
        }
    }

    /// The wildcard address of the same family.
    pub fn wildcard(&self) -> HostAddress {
        match self.protocol() {
            Some(NetworkProtocol::IPv4) => HostAddress::AnyIpv4,
            Some(NetworkProtocol::IPv6) => HostAddress::AnyIpv6,
            _ => HostAddress::Any,
        }
    }

    /// The concrete IP address, if this is neither `Null` nor `Any`.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            HostAddress::Null | HostAddress::Any => None,
            HostAddress::AnyIpv4 => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            HostAddress::AnyIpv6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            HostAddress::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            HostAddress::Ipv6 { addr, .. } => Some(IpAddr::V6(*addr)),
        }
    }

    pub fn scope_id(&self) -> u32 {
        match self {
            HostAddress::Ipv6 { scope_id, .. } => *scope_id,
            _ => 0,
        }
    }
}

impl From<IpAddr> for HostAddress {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(addr) => HostAddress::from(addr),
            IpAddr::V6(addr) => HostAddress::from(addr),
        }
    }
}

impl From<Ipv4Addr> for HostAddress {
    fn from(addr: Ipv4Addr) -> Self {
        HostAddress::Ipv4(addr)
    }
}

impl From<Ipv6Addr> for HostAddress {
    fn from(addr: Ipv6Addr) -> Self {
        HostAddress::Ipv6 { addr, scope_id: 0 }
    }
}

impl FromStr for HostAddress {
    type Err = SocketErrorKind;

    /// Parses a literal address. IPv6 addresses may carry a numeric `%scope`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, scope) = match s.split_once('%') {
            Some((host, scope)) => (host, Some(scope)),
            None => (s, None),
        };
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| SocketErrorKind::AddressUnavailable)?;
        match (ip, scope) {
            (IpAddr::V6(addr), Some(scope)) => {
                let scope_id = scope
                    .parse::<u32>()
                    .map_err(|_| SocketErrorKind::AddressUnavailable)?;
                Ok(HostAddress::Ipv6 { addr, scope_id })
            }
            (IpAddr::V4(_), Some(_)) => Err(SocketErrorKind::AddressUnavailable),
            (ip, None) => Ok(HostAddress::from(ip)),
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddress::Null => write!(f, "<null>"),
            HostAddress::Any => write!(f, "*"),
            HostAddress::AnyIpv4 => write!(f, "0.0.0.0"),
            HostAddress::AnyIpv6 => write!(f, "::"),
            HostAddress::Ipv4(addr) => write!(f, "{addr}"),
            HostAddress::Ipv6 { addr, scope_id: 0 } => write!(f, "{addr}"),
            HostAddress::Ipv6 { addr, scope_id } => write!(f, "{addr}%{scope_id}"),
        }
    }
}

/// Formats an address/port pair for log fields, `-` when absent.
pub fn endpoint(addr: Option<(HostAddress, u16)>) -> String {
    match addr {
        Some((host @ HostAddress::Ipv6 { .. }, port)) => format!("[{host}]:{port}"),
        Some((host, port)) => format!("{host}:{port}"),
        None => "-".to_string(),
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Builds the wire address for `address`/`port` on a socket of family
/// `socket_protocol`.
///
/// IPv4 addresses used on an IPv6 socket are mapped into `::ffff:0:0/96`;
/// mapped addresses used on an IPv4 socket are unmapped.
pub fn to_socket_addr(
    address: &HostAddress,
    port: u16,
    socket_protocol: NetworkProtocol,
) -> Result<SocketAddr, SocketErrorKind> {
    let v6_socket = socket_protocol != NetworkProtocol::IPv4;
    let addr = match (address, v6_socket) {
        (HostAddress::Null, _) => return Err(SocketErrorKind::AddressUnavailable),
        (HostAddress::Any | HostAddress::AnyIpv4, false) => {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        }
        (HostAddress::Ipv4(addr), false) => SocketAddr::V4(SocketAddrV4::new(*addr, port)),
        (HostAddress::Ipv6 { addr, .. }, false) => match addr.to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, port)),
            None => return Err(SocketErrorKind::ProtocolUnsupported),
        },
        (HostAddress::AnyIpv6, false) => return Err(SocketErrorKind::ProtocolUnsupported),
        (HostAddress::Any | HostAddress::AnyIpv6, true) => {
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
        }
        (HostAddress::AnyIpv4, true) => SocketAddr::V6(SocketAddrV6::new(
            Ipv4Addr::UNSPECIFIED.to_ipv6_mapped(),
            port,
            0,
            0,
        )),
        (HostAddress::Ipv4(addr), true) => {
            SocketAddr::V6(SocketAddrV6::new(addr.to_ipv6_mapped(), port, 0, 0))
        }
        (HostAddress::Ipv6 { addr, scope_id }, true) => {
            SocketAddr::V6(SocketAddrV6::new(*addr, port, 0, *scope_id))
        }
    };
    Ok(addr)
}

pub fn to_sock_addr(
    address: &HostAddress,
    port: u16,
    socket_protocol: NetworkProtocol,
) -> Result<SockAddr, SocketErrorKind> {
    to_socket_addr(address, port, socket_protocol).map(SockAddr::from)
}

/// Normalizes a wire address reported by the platform.
///
/// The v4-mapped wildcard `::ffff:0.0.0.0` becomes `Any`, other mapped
/// addresses become plain IPv4, and `::` on a dual-stack socket becomes `Any`.
pub fn from_socket_addr(addr: &SocketAddr, socket_protocol: NetworkProtocol) -> (HostAddress, u16) {
    let host = match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => HostAddress::AnyIpv4,
        SocketAddr::V4(v4) => HostAddress::Ipv4(*v4.ip()),
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) if v4.is_unspecified() => HostAddress::Any,
            Some(v4) => HostAddress::Ipv4(v4),
            None if v6.ip().is_unspecified() => {
                if socket_protocol == NetworkProtocol::AnyIp {
                    HostAddress::Any
                } else {
                    HostAddress::AnyIpv6
                }
            }
            None => HostAddress::Ipv6 {
                addr: *v6.ip(),
                scope_id: v6.scope_id(),
            },
        },
    };
    (host, addr.port())
}

pub fn from_sock_addr(
    addr: &SockAddr,
    socket_protocol: NetworkProtocol,
) -> Option<(HostAddress, u16)> {
    addr.as_socket()
        .map(|addr| from_socket_addr(&addr, socket_protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_wildcard_normalizes_to_any() {
        let wire = to_socket_addr(&HostAddress::AnyIpv4, 80, NetworkProtocol::AnyIp).unwrap();
        assert_eq!(wire.to_string(), "[::ffff:0.0.0.0]:80");
        assert_eq!(
            from_socket_addr(&wire, NetworkProtocol::AnyIp),
            (HostAddress::Any, 80)
        );
    }

    #[test]
    fn any_round_trips_on_both_socket_kinds() {
        for protocol in [NetworkProtocol::IPv4, NetworkProtocol::AnyIp] {
            let wire = to_socket_addr(&HostAddress::Any, 0, protocol).unwrap();
            let (host, _) = from_socket_addr(&wire, protocol);
            let expected = match protocol {
                NetworkProtocol::IPv4 => HostAddress::AnyIpv4,
                _ => HostAddress::Any,
            };
            assert_eq!(host, expected);
        }
        let wire = to_socket_addr(&HostAddress::AnyIpv6, 0, NetworkProtocol::IPv6).unwrap();
        assert_eq!(
            from_socket_addr(&wire, NetworkProtocol::IPv6).0,
            HostAddress::AnyIpv6
        );
    }

    #[test]
    fn ipv4_on_dual_stack_socket_is_mapped_and_unmapped() {
        let host = HostAddress::Ipv4(Ipv4Addr::new(192, 0, 2, 7));
        let wire = to_socket_addr(&host, 9, NetworkProtocol::AnyIp).unwrap();
        assert!(wire.is_ipv6());
        assert_eq!(from_socket_addr(&wire, NetworkProtocol::AnyIp), (host, 9));
    }

    #[test]
    fn ipv6_rejected_on_ipv4_socket() {
        let host: HostAddress = "2001:db8::1".parse().unwrap();
        assert_eq!(
            to_socket_addr(&host, 1, NetworkProtocol::IPv4),
            Err(SocketErrorKind::ProtocolUnsupported)
        );
        assert_eq!(
            to_socket_addr(&HostAddress::Null, 1, NetworkProtocol::IPv4),
            Err(SocketErrorKind::AddressUnavailable)
        );
    }

    #[test]
    fn scope_id_is_preserved() {
        let host: HostAddress = "fe80::1%3".parse().unwrap();
        assert_eq!(host.scope_id(), 3);
        let wire = to_sock_addr(&host, 5353, NetworkProtocol::IPv6).unwrap();
        let (back, port) = from_sock_addr(&wire, NetworkProtocol::IPv6).unwrap();
        assert_eq!(back, host);
        assert_eq!(port, 5353);
        assert_eq!(back.to_string(), "fe80::1%3");
    }

    #[test]
    fn multicast_wildcard_family() {
        let group: HostAddress = "239.255.0.1".parse().unwrap();
        assert!(group.is_multicast());
        assert_eq!(group.wildcard(), HostAddress::AnyIpv4);
        let group: HostAddress = "ff02::1".parse().unwrap();
        assert_eq!(group.wildcard(), HostAddress::AnyIpv6);
        assert!("10.0.0.1%2".parse::<HostAddress>().is_err());
    }
}
