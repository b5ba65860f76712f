//! Frame decoding: raw capture bytes to [`Packet`] records.
//!
//! Only the IP and transport headers are interpreted. Anything without an
//! IPv4/IPv6 layer is dropped here, so downstream code never sees a packet
//! lacking addresses.

use crate::monitor::types::{Packet, Protocol};
use chrono::{DateTime, Utc};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;

/// Link-layer framings the capture layer knows how to strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// BSD loopback (`lo0`): 4-byte address family header.
    Loopback,
    /// No link header at all.
    RawIp,
    /// Linux "any" pseudo-device, 16-byte cooked header.
    LinuxCooked,
    /// Linux cooked v2, 20-byte header.
    LinuxCooked2,
}

impl LinkLayer {
    /// Maps a libpcap `LINKTYPE_*`/`DLT_*` value to a supported framing.
    pub fn from_linktype(linktype: i32) -> Option<Self> {
        match linktype {
            1                => Some(LinkLayer::Ethernet),
            0 | 108          => Some(LinkLayer::Loopback),
            12 | 14 | 101
            | 228 | 229      => Some(LinkLayer::RawIp),
            113              => Some(LinkLayer::LinuxCooked),
            276              => Some(LinkLayer::LinuxCooked2),
            _                => None,
        }
    }

    fn header_len(self) -> usize {
        match self {
            LinkLayer::Ethernet     => 0,
            LinkLayer::Loopback     => 4,
            LinkLayer::RawIp        => 0,
            LinkLayer::LinuxCooked  => 16,
            LinkLayer::LinuxCooked2 => 20,
        }
    }
}

/// Decodes one captured frame. Returns `None` for truncated or malformed
/// frames and for frames without an IP layer.
pub fn decode_frame(link: LinkLayer, data: &[u8], timestamp: DateTime<Utc>) -> Option<Packet> {
    let sliced = match link {
        LinkLayer::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        other => SlicedPacket::from_ip(data.get(other.header_len()..)?).ok()?,
    };

    let (src, dst, ip_proto) = match sliced.ip.as_ref()? {
        InternetSlice::Ipv4(h, _) => (
            IpAddr::V4(h.source_addr()),
            IpAddr::V4(h.destination_addr()),
            h.protocol(),
        ),
        InternetSlice::Ipv6(h, _) => (
            IpAddr::V6(h.source_addr()),
            IpAddr::V6(h.destination_addr()),
            h.next_header(),
        ),
    };

    let packet = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Packet::tcp(
            src,
            tcp.source_port(),
            dst,
            tcp.destination_port(),
            sliced.payload.to_vec(),
            timestamp,
        ),
        Some(TransportSlice::Icmpv4(_)) => Packet::icmp(src, dst, timestamp),
        Some(TransportSlice::Icmpv6(icmp)) if is_icmpv6_echo(icmp.type_u8()) => {
            Packet::icmp(src, dst, timestamp)
        }
        // Neighbour discovery, router and MLD messages are link housekeeping.
        Some(TransportSlice::Icmpv6(_)) => bare(Protocol::Other(ICMPV6), src, dst, timestamp),
        Some(TransportSlice::Udp(_)) => bare(Protocol::Udp, src, dst, timestamp),
        _ => bare(protocol_from_number(ip_proto), src, dst, timestamp),
    };

    Some(packet)
}

/// Converts a pcap record timestamp into UTC.
pub fn timestamp_from_timeval(secs: i64, micros: i64) -> DateTime<Utc> {
    let nanos = (micros.clamp(0, 999_999) as u32) * 1_000;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

const ICMPV6: u8 = 58;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

fn is_icmpv6_echo(icmp_type: u8) -> bool {
    icmp_type == ICMPV6_ECHO_REQUEST || icmp_type == ICMPV6_ECHO_REPLY
}

/// Fallback when the transport header could not be sliced. An unsliced
/// ICMPv6 header cannot be told apart from neighbour discovery, so only
/// ICMPv4 maps to [`Protocol::Icmp`].
fn protocol_from_number(n: u8) -> Protocol {
    match n {
        1     => Protocol::Icmp,
        6     => Protocol::Tcp,
        17    => Protocol::Udp,
        other => Protocol::Other(other),
    }
}

fn bare(protocol: Protocol, src: IpAddr, dst: IpAddr, timestamp: DateTime<Utc>) -> Packet {
    Packet {
        protocol,
        src,
        dst,
        src_port: None,
        dst_port: None,
        payload: Vec::new(),
        timestamp,
    }
}
