//! Packet sources.
//!
//! [`PacketSource`] is the seam between the detectors and libpcap. A capture
//! call yields a lazy stream of decoded [`Packet`]s that ends when the
//! requested duration elapses, the shutdown flag is raised, or (for replay)
//! the file is exhausted. Every stream is single-use.

use crate::logger::{Event, SharedLogger};
use crate::monitor::config::{CAPTURE_READ_TIMEOUT_MS, CAPTURE_SNAPLEN};
use crate::monitor::error::MonitorError;
use crate::monitor::parsers::{decode_frame, timestamp_from_timeval, LinkLayer};
use crate::monitor::types::{Packet, Protocol, ShutdownFlag};

use pcap::{Activated, Capture};
use std::iter;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Lazy, single-use sequence of packets returned by a capture call.
pub type PacketStream<'a> = Box<dyn Iterator<Item = Packet> + 'a>;

/// A packet stream that also yields `None` each time a read timeout passes
/// with no matching traffic.
pub type TickStream<'a> = Box<dyn Iterator<Item = Option<Packet>> + 'a>;

/// Which traffic a capture should deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFilter {
    Icmp,
    Tcp,
}

impl CaptureFilter {
    /// BPF expression installed on the pcap handle. ICMPv6 is narrowed to
    /// echo messages during decoding, not here.
    pub fn bpf(self) -> &'static str {
        match self {
            CaptureFilter::Icmp => "icmp or icmp6",
            CaptureFilter::Tcp  => "tcp",
        }
    }

    /// Post-decode check. Guarantees the contract even for sources that
    /// cannot apply BPF themselves.
    pub fn matches(self, packet: &Packet) -> bool {
        match self {
            CaptureFilter::Icmp => packet.protocol == Protocol::Icmp,
            CaptureFilter::Tcp  => packet.protocol == Protocol::Tcp,
        }
    }
}

/// Anything that can produce packets for the detectors.
pub trait PacketSource: Send + Sync {
    /// Starts a capture on `interface`.
    ///
    /// With `duration == None` the stream is unbounded and only ends once
    /// `shutdown` is raised. Packets not matching `filter` are never yielded.
    ///
    /// # Errors
    /// [`MonitorError::Capture`] when the interface is missing, access is
    /// denied or the filter cannot be installed.
    fn capture<'a>(
        &'a self,
        interface: &str,
        filter:    CaptureFilter,
        duration:  Option<Duration>,
        shutdown:  &ShutdownFlag,
    ) -> Result<PacketStream<'a>, MonitorError>;

    /// Same capture as [`capture`](Self::capture), with idle ticks: a `None`
    /// item whenever the source waited a full read timeout on a quiet
    /// interface. Sources without a read timeout never tick.
    ///
    /// # Errors
    /// As for [`capture`](Self::capture).
    fn capture_ticks<'a>(
        &'a self,
        interface: &str,
        filter:    CaptureFilter,
        duration:  Option<Duration>,
        shutdown:  &ShutdownFlag,
    ) -> Result<TickStream<'a>, MonitorError> {
        Ok(Box::new(self.capture(interface, filter, duration, shutdown)?.map(Some)))
    }

    /// `false` for finite sources (replay files, fixtures). The ICMP worker
    /// runs a single cycle over a non-live source instead of looping.
    fn is_live(&self) -> bool {
        true
    }
}

/// Runs a capture and absorbs a [`MonitorError::Capture`] into an empty
/// stream after logging it. This is how both workers call their source.
pub fn capture_or_empty<'a>(
    source:    &'a dyn PacketSource,
    interface: &str,
    filter:    CaptureFilter,
    duration:  Option<Duration>,
    shutdown:  &ShutdownFlag,
    logger:    &SharedLogger,
) -> PacketStream<'a> {
    match source.capture(interface, filter, duration, shutdown) {
        Ok(stream) => stream,
        Err(e) => {
            report_capture_failure(interface, &e, logger);
            Box::new(iter::empty())
        }
    }
}

/// [`capture_or_empty`] for [`PacketSource::capture_ticks`].
pub fn ticks_or_empty<'a>(
    source:    &'a dyn PacketSource,
    interface: &str,
    filter:    CaptureFilter,
    duration:  Option<Duration>,
    shutdown:  &ShutdownFlag,
    logger:    &SharedLogger,
) -> TickStream<'a> {
    match source.capture_ticks(interface, filter, duration, shutdown) {
        Ok(stream) => stream,
        Err(e) => {
            report_capture_failure(interface, &e, logger);
            Box::new(iter::empty())
        }
    }
}

fn report_capture_failure(interface: &str, err: &MonitorError, logger: &SharedLogger) {
    let reason = err.to_string();
    logger.log(&Event::CaptureFailed { interface, reason: &reason });
}

// ── libpcap ──────────────────────────────────────────────────────────────────

/// What a [`PcapSource`] reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcapMode {
    /// Promiscuous capture on the interface named in each `capture` call.
    Live,
    /// Replays a saved `.pcap` file; the interface argument is only used in
    /// error messages.
    Replay { path: String },
}

/// libpcap-backed source: a live device or an offline capture file.
///
/// Read failures in the middle of a stream (device gone, driver error) end
/// the stream and are logged as [`Event::CaptureFailed`] on `logger`.
#[derive(Clone)]
pub struct PcapSource {
    mode:   PcapMode,
    logger: SharedLogger,
}

impl PcapSource {
    pub fn live(logger: SharedLogger) -> Self {
        Self { mode: PcapMode::Live, logger }
    }

    pub fn replay(path: impl Into<String>, logger: SharedLogger) -> Self {
        Self { mode: PcapMode::Replay { path: path.into() }, logger }
    }

    pub fn mode(&self) -> &PcapMode {
        &self.mode
    }

    fn open(
        &self,
        interface: &str,
        filter:    CaptureFilter,
        duration:  Option<Duration>,
        shutdown:  &ShutdownFlag,
    ) -> Result<TickStream<'static>, MonitorError> {
        match &self.mode {
            PcapMode::Live => {
                let cap = Capture::from_device(interface)
                    .map_err(|e| MonitorError::capture(interface, e))?
                    .promisc(true)
                    .snaplen(CAPTURE_SNAPLEN)
                    // wake every 200ms so shutdown and the deadline are checked promptly
                    .timeout(CAPTURE_READ_TIMEOUT_MS)
                    .open()
                    .map_err(|e| MonitorError::capture(interface, e))?;
                let stream = PcapStream::new(cap, interface, filter, duration, shutdown, &self.logger)?;
                Ok(Box::new(stream))
            }
            PcapMode::Replay { path } => {
                let cap = Capture::from_file(path)
                    .map_err(|e| MonitorError::capture(interface, format!("{}: {}", path, e)))?;
                // Replay ignores the duration: the whole file is one window.
                let stream = PcapStream::new(cap, interface, filter, None, shutdown, &self.logger)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl PacketSource for PcapSource {
    fn capture<'a>(
        &'a self,
        interface: &str,
        filter:    CaptureFilter,
        duration:  Option<Duration>,
        shutdown:  &ShutdownFlag,
    ) -> Result<PacketStream<'a>, MonitorError> {
        Ok(Box::new(self.open(interface, filter, duration, shutdown)?.flatten()))
    }

    fn capture_ticks<'a>(
        &'a self,
        interface: &str,
        filter:    CaptureFilter,
        duration:  Option<Duration>,
        shutdown:  &ShutdownFlag,
    ) -> Result<TickStream<'a>, MonitorError> {
        self.open(interface, filter, duration, shutdown)
    }

    fn is_live(&self) -> bool {
        self.mode == PcapMode::Live
    }
}

/// Classifies the read error that ends a pcap stream. An exhausted replay
/// file ends silently; anything else is logged as a capture failure.
fn report_read_error(interface: &str, err: &pcap::Error, logger: &SharedLogger) {
    if matches!(err, pcap::Error::NoMorePackets) {
        return;
    }
    let reason = err.to_string();
    logger.log(&Event::CaptureFailed { interface, reason: &reason });
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// A finite, pre-decoded packet list. Every capture call replays the whole
/// list through the filter, so the ICMP and TCP workers each see their half.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    packets: Vec<Packet>,
}

impl MemorySource {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl PacketSource for MemorySource {
    fn capture<'a>(
        &'a self,
        _interface: &str,
        filter:     CaptureFilter,
        _duration:  Option<Duration>,
        shutdown:   &ShutdownFlag,
    ) -> Result<PacketStream<'a>, MonitorError> {
        let shutdown = Arc::clone(shutdown);
        Ok(Box::new(
            self.packets
                .iter()
                .take_while(move |_| !shutdown.load(Ordering::Relaxed))
                .filter(move |p| filter.matches(p))
                .cloned(),
        ))
    }

    fn is_live(&self) -> bool {
        false
    }
}

// ── pcap stream ──────────────────────────────────────────────────────────────

/// Iterator over an activated pcap handle. Yields `Some(packet)` per
/// matching frame and `None` per expired read timeout.
struct PcapStream<T: Activated + ?Sized> {
    cap:       Capture<T>,
    interface: String,
    link:      LinkLayer,
    filter:    CaptureFilter,
    deadline:  Option<Instant>,
    shutdown:  ShutdownFlag,
    logger:    SharedLogger,
}

impl<T: Activated + ?Sized> PcapStream<T> {
    fn new(
        mut cap:   Capture<T>,
        interface: &str,
        filter:    CaptureFilter,
        duration:  Option<Duration>,
        shutdown:  &ShutdownFlag,
        logger:    &SharedLogger,
    ) -> Result<Self, MonitorError> {
        let linktype = cap.get_datalink();
        let link = LinkLayer::from_linktype(linktype.0).ok_or_else(|| {
            MonitorError::capture(interface, format!("unsupported link type {}", linktype.0))
        })?;

        cap.filter(filter.bpf(), true)
            .map_err(|e| MonitorError::capture(interface, e))?;

        Ok(Self {
            cap,
            interface: interface.to_string(),
            link,
            filter,
            deadline:  duration.map(|d| Instant::now() + d),
            shutdown:  Arc::clone(shutdown),
            logger:    Arc::clone(logger),
        })
    }

    fn expired(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl<T: Activated + ?Sized> Iterator for PcapStream<T> {
    type Item = Option<Packet>;

    fn next(&mut self) -> Option<Option<Packet>> {
        while !self.expired() {
            match self.cap.next_packet() {
                Ok(raw) => {
                    let ts = timestamp_from_timeval(
                        raw.header.ts.tv_sec as i64,
                        raw.header.ts.tv_usec as i64,
                    );
                    match decode_frame(self.link, raw.data, ts) {
                        Some(pkt) if self.filter.matches(&pkt) => return Some(Some(pkt)),
                        _ => continue,
                    }
                }
                Err(pcap::Error::TimeoutExpired) => return Some(None),
                Err(e) => {
                    report_read_error(&self.interface, &e, &self.logger);
                    return None;
                }
            }
        }
        None
    }
}
