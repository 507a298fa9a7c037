//! Captured frame parsing and construction.
//!
//! Provides typed views over raw captured frames (link, network and
//! transport layers) and builders for the frames the client injects back
//! onto the LAN. The views borrow the underlying bytes and never mutate
//! them; reserialization produces new buffers.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

pub mod dns;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// EtherType for IPv6.
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Ethernet header size in bytes.
pub const ETHERNET_HEADER_SIZE: usize = 14;
/// Loopback (DLT_NULL) header size in bytes.
pub const LOOPBACK_HEADER_SIZE: usize = 4;

/// Loopback protocol family for IPv4 (AF_INET).
pub const LOOPBACK_FAMILY_IPV4: u32 = 2;
/// Loopback protocol family for IPv6 (BSD convention).
pub const LOOPBACK_FAMILY_IPV6: u32 = 30;

/// A 48-bit link-layer hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddr(pub [u8; 6]);

impl HardwareAddr {
    /// The broadcast address ff:ff:ff:ff:ff:ff.
    pub const BROADCAST: HardwareAddr = HardwareAddr([0xff; 6]);

    /// The all-zero address used on interfaces without a MAC.
    pub const ZERO: HardwareAddr = HardwareAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for HardwareAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| Error::Parse(format!("invalid hardware address {s}")))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Parse(format!("invalid hardware address {s}")))?;
        }
        if parts.next().is_some() {
            return Err(Error::Parse(format!("invalid hardware address {s}")));
        }
        Ok(HardwareAddr(octets))
    }
}

/// Link-layer framing of a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Loopback,
}

/// Parsed link layer of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet {
        src: HardwareAddr,
        dst: HardwareAddr,
        ethertype: u16,
    },
    Loopback {
        family: u32,
    },
    /// Bare inner datagrams carry no link layer.
    None,
}

/// Transport layer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl TransportProtocol {
    /// Get the IP protocol number.
    pub fn protocol_number(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::Icmp => 1,
            TransportProtocol::Icmpv6 => 58,
            TransportProtocol::Other(n) => *n,
        }
    }

    /// Create from IP protocol number.
    pub fn from_protocol_number(n: u8) -> Self {
        match n {
            6 => TransportProtocol::Tcp,
            17 => TransportProtocol::Udp,
            1 => TransportProtocol::Icmp,
            58 => TransportProtocol::Icmpv6,
            _ => TransportProtocol::Other(n),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "TCP"),
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Icmp => write!(f, "ICMP"),
            TransportProtocol::Icmpv6 => write!(f, "ICMPv6"),
            TransportProtocol::Other(n) => write!(f, "protocol {n}"),
        }
    }
}

/// Parsed ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpView {
    pub operation: u16,
    pub sender_hardware: HardwareAddr,
    pub sender_protocol: Ipv4Addr,
    pub target_hardware: HardwareAddr,
    pub target_protocol: Ipv4Addr,
}

impl ArpView {
    /// ARP request operation.
    pub const OP_REQUEST: u16 = 1;
    /// ARP reply operation.
    pub const OP_REPLY: u16 = 2;

    pub fn is_request(&self) -> bool {
        self.operation == Self::OP_REQUEST
    }
}

/// Parsed network layer.
#[derive(Debug, Clone, Copy)]
enum NetworkKind {
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        total_len: usize,
        fragment: bool,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        payload_len: usize,
    },
    Arp(ArpView),
}

/// Transport layer summary.
#[derive(Debug, Clone, Copy)]
pub struct TransportInfo {
    pub protocol: TransportProtocol,
    pub src_port: u16,
    pub dst_port: u16,
    /// Transport header length in bytes (0 when unknown).
    pub header_len: usize,
}

/// Typed view over a captured frame or a bare inner IP datagram.
#[derive(Debug, Clone)]
pub struct PacketIndicator<'a> {
    data: &'a [u8],
    link: LinkLayer,
    network_offset: usize,
    network: NetworkKind,
    ip_header_len: usize,
    transport: Option<TransportInfo>,
}

impl<'a> PacketIndicator<'a> {
    /// Parse a captured frame with the given link-layer framing.
    pub fn parse_frame(data: &'a [u8], link_type: LinkType) -> Result<Self> {
        match link_type {
            LinkType::Ethernet => {
                if data.len() < ETHERNET_HEADER_SIZE {
                    return Err(Error::Parse("ethernet frame too short".into()));
                }
                let mut dst = [0u8; 6];
                let mut src = [0u8; 6];
                dst.copy_from_slice(&data[0..6]);
                src.copy_from_slice(&data[6..12]);
                let ethertype = u16::from_be_bytes([data[12], data[13]]);

                let link = LinkLayer::Ethernet {
                    src: HardwareAddr(src),
                    dst: HardwareAddr(dst),
                    ethertype,
                };

                match ethertype {
                    ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
                        Self::parse_ip(data, link, ETHERNET_HEADER_SIZE)
                    }
                    ETHERTYPE_ARP => Self::parse_arp(data, link, ETHERNET_HEADER_SIZE),
                    other => Err(Error::UnsupportedLayer(format!("ethertype {other:#06x}"))),
                }
            }
            LinkType::Loopback => {
                if data.len() < LOOPBACK_HEADER_SIZE {
                    return Err(Error::Parse("loopback frame too short".into()));
                }
                // DLT_NULL stores the family in the capturing host's byte
                // order; a value above u16::MAX means the other order.
                let mut family = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
                if family > u32::from(u16::MAX) {
                    family = family.swap_bytes();
                }
                let link = LinkLayer::Loopback { family };
                Self::parse_ip(data, link, LOOPBACK_HEADER_SIZE)
            }
        }
    }

    /// Parse a bare inner IP datagram delivered by the tunnel.
    pub fn parse_datagram(data: &'a [u8]) -> Result<Self> {
        Self::parse_ip(data, LinkLayer::None, 0)
    }

    fn parse_ip(data: &'a [u8], link: LinkLayer, offset: usize) -> Result<Self> {
        let ip = &data[offset..];
        if ip.is_empty() {
            return Err(Error::Parse("empty network layer".into()));
        }

        match ip[0] >> 4 {
            4 => Self::parse_ipv4(data, link, offset),
            6 => Self::parse_ipv6(data, link, offset),
            v => Err(Error::UnsupportedLayer(format!("IP version {v}"))),
        }
    }

    fn parse_ipv4(data: &'a [u8], link: LinkLayer, offset: usize) -> Result<Self> {
        let ip = &data[offset..];
        if ip.len() < 20 {
            return Err(Error::Parse("IPv4 header too short".into()));
        }

        let header_len = usize::from(ip[0] & 0x0f) * 4;
        if header_len < 20 || ip.len() < header_len {
            return Err(Error::Parse("IPv4 header truncated".into()));
        }

        let total_len = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
        if total_len < header_len {
            return Err(Error::Parse("IPv4 total length below header length".into()));
        }
        // Short Ethernet frames are padded; clamp to what was captured.
        let total_len = total_len.min(ip.len());

        let fragment_field = u16::from_be_bytes([ip[6], ip[7]]);
        let fragment = fragment_field & 0x1fff != 0 || fragment_field & 0x2000 != 0;

        let protocol = TransportProtocol::from_protocol_number(ip[9]);
        let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
        let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

        // Ports belong to the first fragment only.
        let offset_in_fragment = fragment_field & 0x1fff != 0;
        let transport = if offset_in_fragment {
            None
        } else {
            Self::parse_transport(&ip[..total_len], header_len, protocol)
        };

        Ok(Self {
            data,
            link,
            network_offset: offset,
            network: NetworkKind::Ipv4 {
                src,
                dst,
                total_len,
                fragment,
            },
            ip_header_len: header_len,
            transport,
        })
    }

    fn parse_ipv6(data: &'a [u8], link: LinkLayer, offset: usize) -> Result<Self> {
        let ip = &data[offset..];
        if ip.len() < 40 {
            return Err(Error::Parse("IPv6 header too short".into()));
        }

        let payload_len = usize::from(u16::from_be_bytes([ip[4], ip[5]]));
        let protocol = TransportProtocol::from_protocol_number(ip[6]);

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&ip[8..24]);
        dst.copy_from_slice(&ip[24..40]);

        let wire = (40 + payload_len).min(ip.len());
        let transport = Self::parse_transport(&ip[..wire], 40, protocol);

        Ok(Self {
            data,
            link,
            network_offset: offset,
            network: NetworkKind::Ipv6 {
                src: Ipv6Addr::from(src),
                dst: Ipv6Addr::from(dst),
                payload_len,
            },
            ip_header_len: 40,
            transport,
        })
    }

    fn parse_transport(
        ip: &[u8],
        header_len: usize,
        protocol: TransportProtocol,
    ) -> Option<TransportInfo> {
        match protocol {
            TransportProtocol::Tcp | TransportProtocol::Udp => {
                if ip.len() < header_len + 4 {
                    return None;
                }
                let src_port = u16::from_be_bytes([ip[header_len], ip[header_len + 1]]);
                let dst_port = u16::from_be_bytes([ip[header_len + 2], ip[header_len + 3]]);

                let transport_header = match protocol {
                    TransportProtocol::Tcp => {
                        if ip.len() >= header_len + 13 {
                            usize::from(ip[header_len + 12] >> 4) * 4
                        } else {
                            20
                        }
                    }
                    _ => 8,
                };

                Some(TransportInfo {
                    protocol,
                    src_port,
                    dst_port,
                    header_len: transport_header,
                })
            }
            TransportProtocol::Icmp | TransportProtocol::Icmpv6 => Some(TransportInfo {
                protocol,
                src_port: 0,
                dst_port: 0,
                header_len: 8,
            }),
            TransportProtocol::Other(_) => Some(TransportInfo {
                protocol,
                src_port: 0,
                dst_port: 0,
                header_len: 0,
            }),
        }
    }

    fn parse_arp(data: &'a [u8], link: LinkLayer, offset: usize) -> Result<Self> {
        let arp = &data[offset..];
        if arp.len() < 28 {
            return Err(Error::Parse("ARP packet too short".into()));
        }

        let hardware_type = u16::from_be_bytes([arp[0], arp[1]]);
        let protocol_type = u16::from_be_bytes([arp[2], arp[3]]);
        if hardware_type != 1 || protocol_type != ETHERTYPE_IPV4 || arp[4] != 6 || arp[5] != 4 {
            return Err(Error::UnsupportedLayer(format!(
                "ARP hardware {hardware_type}/protocol {protocol_type:#06x}"
            )));
        }

        let mut sender_hw = [0u8; 6];
        let mut target_hw = [0u8; 6];
        sender_hw.copy_from_slice(&arp[8..14]);
        target_hw.copy_from_slice(&arp[18..24]);

        let view = ArpView {
            operation: u16::from_be_bytes([arp[6], arp[7]]),
            sender_hardware: HardwareAddr(sender_hw),
            sender_protocol: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
            target_hardware: HardwareAddr(target_hw),
            target_protocol: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
        };

        Ok(Self {
            data,
            link,
            network_offset: offset,
            network: NetworkKind::Arp(view),
            ip_header_len: 0,
            transport: None,
        })
    }

    /// The link layer of the frame.
    pub fn link(&self) -> LinkLayer {
        self.link
    }

    /// Source hardware address of the frame, if it has an Ethernet layer.
    pub fn src_hardware_addr(&self) -> Option<HardwareAddr> {
        match self.link {
            LinkLayer::Ethernet { src, .. } => Some(src),
            _ => None,
        }
    }

    /// Source address at the network layer.
    pub fn src_ip(&self) -> IpAddr {
        match self.network {
            NetworkKind::Ipv4 { src, .. } => IpAddr::V4(src),
            NetworkKind::Ipv6 { src, .. } => IpAddr::V6(src),
            NetworkKind::Arp(arp) => IpAddr::V4(arp.sender_protocol),
        }
    }

    /// Destination address at the network layer.
    pub fn dst_ip(&self) -> IpAddr {
        match self.network {
            NetworkKind::Ipv4 { dst, .. } => IpAddr::V4(dst),
            NetworkKind::Ipv6 { dst, .. } => IpAddr::V6(dst),
            NetworkKind::Arp(arp) => IpAddr::V4(arp.target_protocol),
        }
    }

    /// Whether the network layer is ARP.
    pub fn is_arp(&self) -> bool {
        matches!(self.network, NetworkKind::Arp(_))
    }

    /// The ARP view, when the network layer is ARP.
    pub fn arp(&self) -> Option<ArpView> {
        match self.network {
            NetworkKind::Arp(view) => Some(view),
            _ => None,
        }
    }

    /// Whether the datagram is an IPv4 fragment (or has more coming).
    pub fn is_fragment(&self) -> bool {
        matches!(self.network, NetworkKind::Ipv4 { fragment: true, .. })
    }

    /// The transport layer summary, when one was decoded.
    pub fn transport(&self) -> Option<TransportInfo> {
        self.transport
    }

    /// Transport protocol, when the network layer is IP.
    pub fn transport_protocol(&self) -> Option<TransportProtocol> {
        self.transport.map(|t| t.protocol)
    }

    /// Wire size of the IP datagram (header included), the original's "MTU".
    pub fn wire_size(&self) -> usize {
        match self.network {
            NetworkKind::Ipv4 { total_len, .. } => total_len,
            NetworkKind::Ipv6 { payload_len, .. } => {
                (40 + payload_len).min(self.data.len() - self.network_offset)
            }
            NetworkKind::Arp(_) => 28,
        }
    }

    /// The IP datagram bytes (header plus payload, link layer stripped).
    pub fn network_bytes(&self) -> &'a [u8] {
        let end = self.network_offset + self.wire_size();
        &self.data[self.network_offset..end]
    }

    /// The transport payload bytes, when a transport header was decoded.
    pub fn transport_payload(&self) -> Option<&'a [u8]> {
        let t = self.transport?;
        if t.header_len == 0 {
            return None;
        }
        let start = self.network_offset + self.ip_header_len + t.header_len;
        let end = self.network_offset + self.wire_size();
        if start > end {
            return None;
        }
        Some(&self.data[start..end])
    }

    /// The DNS payload, when the packet is UDP or TCP on port 53.
    ///
    /// DNS over TCP prefixes the message with its 16-bit length.
    pub fn dns_payload(&self) -> Option<&'a [u8]> {
        let t = self.transport?;
        if t.src_port != 53 && t.dst_port != 53 {
            return None;
        }
        let payload = self.transport_payload()?;
        match t.protocol {
            TransportProtocol::Udp => Some(payload),
            TransportProtocol::Tcp => {
                if payload.len() < 2 {
                    return None;
                }
                let len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
                if payload.len() < 2 + len {
                    return None;
                }
                Some(&payload[2..2 + len])
            }
            _ => None,
        }
    }

    /// Source endpoint rendered for logging.
    pub fn src(&self) -> String {
        match self.transport {
            Some(t) if t.protocol == TransportProtocol::Tcp || t.protocol == TransportProtocol::Udp => {
                format!("{}:{}", self.src_ip(), t.src_port)
            }
            _ => self.src_ip().to_string(),
        }
    }

    /// Destination endpoint rendered for logging.
    pub fn dst(&self) -> String {
        match self.transport {
            Some(t) if t.protocol == TransportProtocol::Tcp || t.protocol == TransportProtocol::Udp => {
                format!("{}:{}", self.dst_ip(), t.dst_port)
            }
            _ => self.dst_ip().to_string(),
        }
    }
}

/// Build an Ethernet frame around a payload.
pub fn build_ethernet_frame(
    src: HardwareAddr,
    dst: HardwareAddr,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build a loopback (DLT_NULL) frame around an IP datagram.
pub fn build_loopback_frame(is_ipv6: bool, payload: &[u8]) -> Vec<u8> {
    let family = if is_ipv6 {
        LOOPBACK_FAMILY_IPV6
    } else {
        LOOPBACK_FAMILY_IPV4
    };
    let mut frame = Vec::with_capacity(LOOPBACK_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&family.to_ne_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build an Ethernet ARP reply answering the given request, claiming the
/// queried target address on behalf of `source_hardware`.
pub fn build_arp_reply(request: &ArpView, source_hardware: HardwareAddr) -> Vec<u8> {
    let mut arp = Vec::with_capacity(28);
    arp.extend_from_slice(&1u16.to_be_bytes()); // hardware type: Ethernet
    arp.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    arp.push(6); // hardware size
    arp.push(4); // protocol size
    arp.extend_from_slice(&ArpView::OP_REPLY.to_be_bytes());
    arp.extend_from_slice(&source_hardware.octets());
    arp.extend_from_slice(&request.target_protocol.octets());
    arp.extend_from_slice(&request.sender_hardware.octets());
    arp.extend_from_slice(&request.sender_protocol.octets());

    build_ethernet_frame(source_hardware, request.sender_hardware, ETHERTYPE_ARP, &arp)
}

/// Internet checksum (RFC 1071) over a byte slice.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += u32::from(u16::from_be_bytes([last, 0]));
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// TCP/UDP checksum over the IPv4 pseudo-header and the transport segment.
pub fn pseudo_header_checksum(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(protocol);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    checksum(&pseudo)
}

/// Rebuild an IPv4 datagram with a replaced transport payload.
///
/// Lengths, the IP header checksum, and the TCP/UDP checksum over the
/// pseudo-header are all recomputed. DNS over TCP keeps its 16-bit message
/// length prefix consistent with the new payload.
pub fn rewrite_transport_payload(datagram: &[u8], new_payload: &[u8]) -> Result<Vec<u8>> {
    let indicator = PacketIndicator::parse_datagram(datagram)?;
    let transport = indicator
        .transport()
        .ok_or_else(|| Error::Parse("datagram has no transport layer".into()))?;

    let (src, dst) = match (indicator.src_ip(), indicator.dst_ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
        _ => return Err(Error::UnsupportedLayer("IPv6 payload rewrite".into())),
    };

    let ip_header_len = usize::from(datagram[0] & 0x0f) * 4;
    if datagram.len() < ip_header_len + transport.header_len {
        return Err(Error::Parse("transport header truncated".into()));
    }
    let transport_header = &datagram[ip_header_len..ip_header_len + transport.header_len];

    // Assemble the new transport segment.
    let mut segment = Vec::with_capacity(transport.header_len + 2 + new_payload.len());
    segment.extend_from_slice(transport_header);
    if transport.protocol == TransportProtocol::Tcp {
        segment.extend_from_slice(&(new_payload.len() as u16).to_be_bytes());
    }
    segment.extend_from_slice(new_payload);

    match transport.protocol {
        TransportProtocol::Udp => {
            let len = segment.len() as u16;
            segment[4..6].copy_from_slice(&len.to_be_bytes());
            segment[6..8].copy_from_slice(&[0, 0]);
            let sum = pseudo_header_checksum(src, dst, 17, &segment);
            // An all-zero UDP checksum means "absent"; transmit as 0xffff.
            let sum = if sum == 0 { 0xffff } else { sum };
            segment[6..8].copy_from_slice(&sum.to_be_bytes());
        }
        TransportProtocol::Tcp => {
            segment[16..18].copy_from_slice(&[0, 0]);
            let sum = pseudo_header_checksum(src, dst, 6, &segment);
            segment[16..18].copy_from_slice(&sum.to_be_bytes());
        }
        other => {
            return Err(Error::UnsupportedLayer(format!("{other} payload rewrite")));
        }
    }

    // Assemble the new datagram around the segment.
    let mut out = Vec::with_capacity(ip_header_len + segment.len());
    out.extend_from_slice(&datagram[..ip_header_len]);
    out.extend_from_slice(&segment);

    let total_len = out.len() as u16;
    out[2..4].copy_from_slice(&total_len.to_be_bytes());
    out[10..12].copy_from_slice(&[0, 0]);
    let ip_sum = checksum(&out[..ip_header_len]);
    out[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    Ok(out)
}

/// Hand-built datagram fixtures shared by tests across the crate.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    // Minimal IPv4+TCP datagram builder for fixtures.
    pub(crate) fn build_ipv4_tcp(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = (40 + payload.len()) as u16;
        let mut ip = vec![
            0x45, 0x00, 0x00, 0x00, // version/ihl, tos, total length
            0x00, 0x01, 0x40, 0x00, // id, flags (DF), fragment offset
            0x40, 0x06, 0x00, 0x00, // ttl, protocol, checksum
        ];
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());

        let mut tcp = Vec::new();
        tcp.extend_from_slice(&src_port.to_be_bytes());
        tcp.extend_from_slice(&dst_port.to_be_bytes());
        tcp.extend_from_slice(&1u32.to_be_bytes()); // seq
        tcp.extend_from_slice(&0u32.to_be_bytes()); // ack
        tcp.extend_from_slice(&[0x50, 0x18]); // data offset 5, PSH|ACK
        tcp.extend_from_slice(&0xffffu16.to_be_bytes()); // window
        tcp.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent
        tcp.extend_from_slice(payload);

        let sum = pseudo_header_checksum(src, dst, 6, &tcp);
        tcp[16..18].copy_from_slice(&sum.to_be_bytes());

        let mut out = ip;
        out.extend_from_slice(&tcp);
        let ip_sum = checksum(&out[..20]);
        out[10..12].copy_from_slice(&ip_sum.to_be_bytes());
        out
    }

    // Minimal IPv4+UDP datagram builder for fixtures.
    pub(crate) fn build_ipv4_udp(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = (28 + payload.len()) as u16;
        let mut ip = vec![
            0x45, 0x00, 0x00, 0x00, 0x00, 0x02, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00,
        ];
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());

        let mut udp = Vec::new();
        udp.extend_from_slice(&src_port.to_be_bytes());
        udp.extend_from_slice(&dst_port.to_be_bytes());
        udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(payload);

        let sum = pseudo_header_checksum(src, dst, 17, &udp);
        udp[6..8].copy_from_slice(&sum.to_be_bytes());

        let mut out = ip;
        out.extend_from_slice(&udp);
        let ip_sum = checksum(&out[..20]);
        out[10..12].copy_from_slice(&ip_sum.to_be_bytes());
        out
    }
}
