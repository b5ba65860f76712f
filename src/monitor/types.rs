use chrono::{DateTime, Utc};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

/// Cancellation token shared by the supervisor and both workers.
///
/// Raised once (by the Ctrl+C handler or by the supervisor itself) and never
/// lowered again. Every blocking loop in the engine polls it at least every
/// few hundred milliseconds.
pub type ShutdownFlag = Arc<AtomicBool>;

/// Transport protocol tag carried by every decoded [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    /// Any other IP protocol number, or a fragment whose transport header
    /// could not be sliced.
    Other(u8),
}

/// A single captured packet, reduced to the header fields the detectors use.
///
/// Produced by the capture layer and never mutated afterwards. Packets
/// without an IP layer are discarded during decoding and never become a
/// `Packet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Transport protocol as read from the IP header / transport slice.
    pub protocol: Protocol,

    /// IP source address.
    pub src: IpAddr,

    /// IP destination address.
    pub dst: IpAddr,

    /// TCP source port; `None` for every non-TCP packet.
    pub src_port: Option<u16>,

    /// TCP destination port; `None` for every non-TCP packet.
    pub dst_port: Option<u16>,

    /// TCP payload bytes. Always empty for non-TCP packets and for bare
    /// control segments (SYN, ACK, FIN without data).
    pub payload: Vec<u8>,

    /// Capture timestamp taken from the pcap record header.
    pub timestamp: DateTime<Utc>,
}

impl Packet {
    /// Builds an ICMP packet record.
    pub fn icmp(src: IpAddr, dst: IpAddr, timestamp: DateTime<Utc>) -> Self {
        Self {
            protocol: Protocol::Icmp,
            src,
            dst,
            src_port: None,
            dst_port: None,
            payload: Vec::new(),
            timestamp,
        }
    }

    /// Builds a TCP packet record carrying `payload`.
    pub fn tcp(
        src:       IpAddr,
        src_port:  u16,
        dst:       IpAddr,
        dst_port:  u16,
        payload:   Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            protocol: Protocol::Tcp,
            src,
            dst,
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            payload,
            timestamp,
        }
    }

    /// The 4-tuple identifying this packet's TCP flow, or `None` for
    /// non-TCP packets.
    pub fn flow_key(&self) -> Option<FlowKey> {
        if self.protocol != Protocol::Tcp {
            return None;
        }
        Some(FlowKey {
            src:      self.src,
            src_port: self.src_port?,
            dst:      self.dst,
            dst_port: self.dst_port?,
        })
    }

    /// Whether either endpoint of this packet is `addr`.
    pub fn touches(&self, addr: IpAddr) -> bool {
        self.src == addr || self.dst == addr
    }
}

/// Identifies one direction of a TCP conversation.
///
/// Unlike a connection key, the tuple is taken verbatim from the packet:
/// `A:p → B:q` and `B:q → A:p` are two different flows, each with its own
/// stream buffer.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub struct FlowKey {
    pub src:      IpAddr,
    pub src_port: u16,
    pub dst:      IpAddr,
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}:{}", self.src, self.src_port, self.dst, self.dst_port)
    }
}

/// A source address that exceeded the ICMP threshold in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreatRecord {
    pub source:    IpAddr,
    pub count:     u64,
    pub threshold: u32,
}

/// A signature hit inside one flow's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalwareAlert<K = FlowKey> {
    /// The flow the signature was found in.
    pub flow: K,

    /// Identifier of the matched signature.
    pub signature: String,

    /// Offset of the first signature byte, counted from the first payload
    /// byte ever observed on this flow.
    pub offset: u64,
}

/// Running counters reported in the session summary.
///
/// Shared between both workers through [`SharedStats`]; every field is an
/// independent atomic so no lock is needed.
#[derive(Default)]
pub struct SessionStats {
    /// Decoded packets handed to either detector.
    pub packets_total: AtomicU64,

    /// ICMP measurement cycles completed (including empty ones).
    pub icmp_cycles: AtomicU64,

    /// ThreatRecords produced across all cycles.
    pub threats_flagged: AtomicU64,

    /// Distinct TCP flows created by the tracker (running total, not the
    /// current table size).
    pub total_flows_tracked: AtomicU64,

    /// MalwareAlerts emitted.
    pub malware_alerts: AtomicU64,
}

pub type SharedStats = Arc<SessionStats>;

impl SessionStats {
    pub fn new() -> SharedStats {
        Arc::new(Self::default())
    }
}
