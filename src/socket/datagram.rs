//! Ancillary data attached to datagram send and receive calls.
//!
//! The payload travels separately through the `iovec`s of `sendmsg`/`recvmsg`;
//! this module only deals with the control records (packet info and hop limit)
//! and with the [`IpPacketHeader`] they are decoded into.

use super::HostAddress;
use libc::{c_int, c_void};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Per-datagram metadata.
///
/// On receive only the fields selected by [`HeaderOptions`] are filled. On
/// send, `destination_*` selects the target and the remaining fields are
/// optional: a `hop_limit` of `None` keeps the socket default, an
/// `interface_index` of 0 and a `Null` sender let the kernel pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpPacketHeader {
    pub sender_address: HostAddress,
    pub sender_port: u16,
    pub destination_address: HostAddress,
    pub destination_port: u16,
    pub hop_limit: Option<i32>,
    pub interface_index: u32,
}

impl IpPacketHeader {
    /// A header that only names the destination.
    pub fn to(address: HostAddress, port: u16) -> Self {
        Self {
            destination_address: address,
            destination_port: port,
            ..Default::default()
        }
    }

    pub fn with_hop_limit(mut self, hop_limit: i32) -> Self {
        self.hop_limit = Some(hop_limit);
        self
    }
}

/// Which header fields `receive_datagram` should populate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderOptions {
    pub sender: bool,
    pub destination: bool,
    pub hop_limit: bool,
}

impl HeaderOptions {
    pub const NONE: HeaderOptions = HeaderOptions {
        sender: false,
        destination: false,
        hop_limit: false,
    };
    pub const ALL: HeaderOptions = HeaderOptions {
        sender: true,
        destination: true,
        hop_limit: true,
    };

    pub fn sender() -> Self {
        Self {
            sender: true,
            ..Self::NONE
        }
    }

    pub(crate) fn wants_control(&self) -> bool {
        self.destination || self.hop_limit
    }
}

// ============================================================================
// Control Buffer
// ============================================================================

/// A `cmsghdr`-aligned buffer of control records.
#[derive(Debug, Clone, Default)]
pub struct ControlBuffer {
    // u64 storage keeps every record header aligned
    words: Vec<u64>,
    len: usize,
}

/// One decoded control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord<'a> {
    pub level: c_int,
    pub kind: c_int,
    pub data: &'a [u8],
}

impl ControlBuffer {
    /// Room for the receive-side records this crate understands.
    pub const RECEIVE_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer with room for `bytes` of incoming records.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            words: vec![0; bytes.div_ceil(mem::size_of::<u64>())],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * mem::size_of::<u64>()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr().cast()
    }

    // Called after recvmsg() reports how much of the buffer it used.
    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Appends a record carrying `value`.
    pub fn push<T: Copy>(&mut self, level: c_int, kind: c_int, value: T) {
        let payload = mem::size_of::<T>() as u32;
        // SAFETY: CMSG_SPACE/CMSG_LEN are pure arithmetic.
        let (space, record_len) =
            unsafe { (libc::CMSG_SPACE(payload) as usize, libc::CMSG_LEN(payload) as usize) };
        let needed = self.len + space;
        if needed > self.capacity() {
            self.words
                .resize(needed.div_ceil(mem::size_of::<u64>()), 0);
        }
        // SAFETY: the buffer holds at least `needed` bytes, `self.len` is a
        // multiple of the record alignment and the storage is u64-aligned.
        unsafe {
            let base = self.words.as_mut_ptr().cast::<u8>().add(self.len);
            let header = base.cast::<libc::cmsghdr>();
            (*header).cmsg_len = record_len as _;
            (*header).cmsg_level = level;
            (*header).cmsg_type = kind;
            std::ptr::write_unaligned(libc::CMSG_DATA(header).cast::<T>(), value);
        }
        self.len = needed;
    }

    /// Walks the records in the buffer, stopping at the first malformed one.
    pub fn records(&self) -> Vec<ControlRecord<'_>> {
        let mut records = Vec::new();
        if self.len == 0 {
            return records;
        }
        // SAFETY: msghdr is plain data; only the control fields are used.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = self.words.as_ptr() as *mut c_void;
        msg.msg_controllen = self.len as _;

        let base = self.words.as_ptr() as usize;
        // SAFETY: CMSG_FIRSTHDR/CMSG_NXTHDR stay within msg_controllen, and each
        // record's claimed length is checked against the buffer before slicing.
        unsafe {
            let header_len = libc::CMSG_LEN(0) as usize;
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let total = (*cmsg).cmsg_len as usize;
                let offset = cmsg as usize - base;
                if total < header_len || offset + total > self.len {
                    break;
                }
                let data = std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), total - header_len);
                records.push(ControlRecord {
                    level: (*cmsg).cmsg_level,
                    kind: (*cmsg).cmsg_type,
                    data,
                });
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        records
    }
}

// ============================================================================
// Encoding and Decoding
// ============================================================================

/// Fields recovered from the control records of one received datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceivedControl {
    pub destination: Option<HostAddress>,
    pub interface_index: u32,
    pub hop_limit: Option<i32>,
}

fn read_record<T: Copy>(data: &[u8]) -> Option<T> {
    if data.len() < mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked; T is a plain C struct or integer.
    Some(unsafe { std::ptr::read_unaligned(data.as_ptr().cast::<T>()) })
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

fn read_hop_limit(data: &[u8]) -> Option<i32> {
    match data.len() {
        1 => Some(i32::from(data[0])),
        _ => read_record::<c_int>(data),
    }
}

/// Extracts the requested fields. Records of unknown level or type are
/// skipped.
pub fn decode_receive_control(buffer: &ControlBuffer, options: HeaderOptions) -> ReceivedControl {
    let mut control = ReceivedControl::default();
    for record in buffer.records() {
        match (record.level, record.kind) {
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) if options.destination => {
                if let Some(info) = read_record::<libc::in6_pktinfo>(record.data) {
                    let addr = Ipv6Addr::from(info.ipi6_addr.s6_addr);
                    let ifindex = info.ipi6_ifindex as u32;
                    control.destination = Some(match addr.to_ipv4_mapped() {
                        Some(v4) => HostAddress::Ipv4(v4),
                        None if is_link_local(&addr) || addr.is_multicast() => {
                            HostAddress::Ipv6 {
                                addr,
                                scope_id: ifindex,
                            }
                        }
                        None => HostAddress::from(addr),
                    });
                    control.interface_index = ifindex;
                }
            }
            (libc::IPPROTO_IP, libc::IP_PKTINFO) if options.destination => {
                if let Some(info) = read_record::<libc::in_pktinfo>(record.data) {
                    let addr = Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr));
                    control.destination = Some(HostAddress::Ipv4(addr));
                    control.interface_index = info.ipi_ifindex as u32;
                }
            }
            (libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT) | (libc::IPPROTO_IP, libc::IP_TTL)
                if options.hop_limit =>
            {
                control.hop_limit = read_hop_limit(record.data);
            }
            _ => {}
        }
    }
    control
}

/// Builds the control records for sending `header` on a socket whose
/// destination is IPv6 (`v6`) or IPv4.
pub fn encode_send_control(header: &IpPacketHeader, v6: bool) -> ControlBuffer {
    let mut buffer = ControlBuffer::new();
    if let Some(hop_limit) = header.hop_limit {
        if v6 {
            buffer.push(libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT, hop_limit as c_int);
        } else {
            buffer.push(libc::IPPROTO_IP, libc::IP_TTL, hop_limit as c_int);
        }
    }

    let sender = match header.sender_address {
        address if address.is_null() || address.is_wildcard() => None,
        address => address.ip(),
    };
    if header.interface_index != 0 || sender.is_some() {
        if v6 {
            let addr = match sender {
                Some(std::net::IpAddr::V6(addr)) => addr,
                Some(std::net::IpAddr::V4(addr)) => addr.to_ipv6_mapped(),
                None => Ipv6Addr::UNSPECIFIED,
            };
            let info = libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: addr.octets(),
                },
                ipi6_ifindex: header.interface_index as _,
            };
            buffer.push(libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, info);
        } else {
            let addr = match sender {
                Some(std::net::IpAddr::V4(addr)) => addr,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            let info = libc::in_pktinfo {
                ipi_ifindex: header.interface_index as _,
                ipi_spec_dst: libc::in_addr {
                    s_addr: u32::from(addr).to_be(),
                },
                ipi_addr: libc::in_addr { s_addr: 0 },
            };
            buffer.push(libc::IPPROTO_IP, libc::IP_PKTINFO, info);
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_records_are_skipped() {
        let mut buffer = ControlBuffer::new();
        buffer.push(libc::SOL_SOCKET, 0x7fff, 42u32);
        buffer.push(libc::IPPROTO_IP, libc::IP_TTL, 5 as c_int);

        assert_eq!(buffer.records().len(), 2);
        let control = decode_receive_control(&buffer, HeaderOptions::ALL);
        assert_eq!(control.hop_limit, Some(5));
        assert_eq!(control.destination, None);
    }

    #[test]
    fn only_requested_fields_are_extracted() {
        let header = IpPacketHeader {
            sender_address: HostAddress::Ipv4(Ipv4Addr::new(10, 1, 2, 3)),
            interface_index: 2,
            hop_limit: Some(1),
            ..Default::default()
        };
        let buffer = encode_send_control(&header, false);

        let none = decode_receive_control(&buffer, HeaderOptions::NONE);
        assert_eq!(none, ReceivedControl::default());

        let hop_only = decode_receive_control(
            &buffer,
            HeaderOptions {
                hop_limit: true,
                ..HeaderOptions::NONE
            },
        );
        assert_eq!(hop_only.hop_limit, Some(1));
        assert_eq!(hop_only.interface_index, 0);
    }

    #[test]
    fn ipv6_packet_info_carries_interface() {
        let header = IpPacketHeader {
            sender_address: "fe80::2".parse().unwrap(),
            interface_index: 4,
            hop_limit: Some(64),
            ..Default::default()
        };
        let buffer = encode_send_control(&header, true);
        let control = decode_receive_control(&buffer, HeaderOptions::ALL);
        assert_eq!(control.hop_limit, Some(64));
        assert_eq!(control.interface_index, 4);
        assert_eq!(
            control.destination,
            Some(HostAddress::Ipv6 {
                addr: "fe80::2".parse().unwrap(),
                scope_id: 4,
            })
        );
    }

    #[test]
    fn no_records_without_metadata() {
        let header = IpPacketHeader::to(HostAddress::Ipv4(Ipv4Addr::LOCALHOST), 9);
        assert!(encode_send_control(&header, false).is_empty());
    }

    #[test]
    fn truncated_buffer_stops_walk() {
        let mut buffer = ControlBuffer::new();
        buffer.push(libc::IPPROTO_IP, libc::IP_TTL, 7 as c_int);
        // SAFETY: pure arithmetic
        let record_len = unsafe { libc::CMSG_LEN(mem::size_of::<c_int>() as u32) } as usize;
        buffer.set_len(record_len - 1);
        assert!(buffer.records().is_empty());
    }
}
