//! Per-flow TCP stream buffering and signature scanning.
//!
//! Each flow keeps a bounded tail of its payload stream. When a segment
//! arrives, only the region that could contain a *new* match is scanned:
//! the fresh bytes plus `longest - 1` bytes of retained context. A signature
//! split across any number of segments is therefore found exactly once,
//! while memory per flow stays bounded by the window.
//!
//! The tracker is owned by the TCP worker alone; nothing here is shared.

use crate::logger::{Event, SharedLogger};
use crate::monitor::signatures::SignatureMatcher;
use crate::monitor::types::{FlowKey, MalwareAlert, Packet};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Stream state of one flow.
#[derive(Debug)]
pub struct FlowState {
    /// Trailing payload bytes, at most the tracker's window after each packet.
    buffer: Vec<u8>,

    /// Stream offset of `buffer[0]`: bytes observed on this flow and already
    /// trimmed away.
    base: u64,

    /// Signature ids already alerted on this flow.
    matched: HashSet<String>,

    /// Arrival time of the most recent segment, used for idle eviction.
    pub last_seen: Instant,
}

impl FlowState {
    fn new(now: Instant) -> Self {
        Self {
            buffer:    Vec::new(),
            base:      0,
            matched:   HashSet::new(),
            last_seen: now,
        }
    }

    /// Total payload bytes observed on the flow.
    pub fn stream_len(&self) -> u64 {
        self.base + self.buffer.len() as u64
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether `signature` has already been reported on this flow.
    pub fn has_matched(&self, signature: &str) -> bool {
        self.matched.contains(signature)
    }

    /// Drops the buffered context. Stream offsets stay monotonic and the
    /// matched set is kept, so a reset never causes a repeat alert.
    fn reset(&mut self) {
        self.base += self.buffer.len() as u64;
        self.buffer.clear();
    }

    fn trim(&mut self, keep: usize) {
        if self.buffer.len() > keep {
            let excess = self.buffer.len() - keep;
            self.buffer.drain(..excess);
            self.base += excess as u64;
        }
    }
}

/// Flow table plus the matcher that scans it.
///
/// Generic over the key so the same logic serves the live path (keyed by
/// [`FlowKey`]) and the string-keyed [`MalwareDetector`](super::signatures::MalwareDetector).
pub struct FlowTracker<K = FlowKey> {
    flows:     HashMap<K, FlowState>,
    matcher:   Box<dyn SignatureMatcher>,
    /// Bytes retained per flow between packets.
    window:    usize,
    /// `longest - 1`: context needed to catch a signature split at a boundary.
    overlap:   usize,
    self_addr: Option<IpAddr>,
    created:   u64,
    logger:    SharedLogger,
}

impl<K> FlowTracker<K>
where
    K: Hash + Eq + Clone + Display,
{
    /// Builds a tracker. `window` is raised to the matcher's overlap if it
    /// is smaller, so no split signature can be trimmed away.
    pub fn new(matcher: Box<dyn SignatureMatcher>, window: usize, logger: SharedLogger) -> Self {
        let overlap = matcher.longest().saturating_sub(1);
        Self {
            flows: HashMap::new(),
            window: window.max(overlap),
            overlap,
            matcher,
            self_addr: None,
            created: 0,
            logger,
        }
    }

    /// Traffic to or from `addr` will be ignored by [`FlowTracker::on_packet`].
    pub fn with_self_address(mut self, addr: Option<IpAddr>) -> Self {
        self.self_addr = addr;
        self
    }

    pub fn matcher(&self) -> &dyn SignatureMatcher {
        self.matcher.as_ref()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Appends `payload` to `key`'s stream and returns the alerts it
    /// completed. Alerts are also logged.
    pub fn ingest(&mut self, key: K, payload: &[u8], now: Instant) -> Vec<MalwareAlert<K>> {
        let mut alerts = Vec::new();
        if payload.is_empty() {
            return alerts;
        }

        if !self.flows.contains_key(&key) {
            self.created += 1;
        }
        let state = self
            .flows
            .entry(key.clone())
            .or_insert_with(|| FlowState::new(now));
        state.last_seen = now;

        let old_len = state.buffer.len();
        state.buffer.extend_from_slice(payload);

        // Anything wholly inside the old bytes was already scanned.
        let scan_from = old_len.saturating_sub(self.overlap);

        match self.matcher.find_all(&state.buffer[scan_from..]) {
            Ok(hits) => {
                for hit in hits {
                    let start = scan_from + hit.offset;
                    if start + hit.len <= old_len {
                        continue;
                    }
                    if !state.matched.insert(hit.id.clone()) {
                        continue;
                    }

                    let alert = MalwareAlert {
                        flow:      key.clone(),
                        signature: hit.id,
                        offset:    state.base + start as u64,
                    };
                    let flow = alert.flow.to_string();
                    self.logger.log(&Event::MalwareDetected {
                        flow:      &flow,
                        signature: &alert.signature,
                        offset:    alert.offset,
                    });
                    alerts.push(alert);
                }
            }
            Err(e) => {
                let flow = key.to_string();
                let reason = e.to_string();
                self.logger.log(&Event::FlowAnalysisFailed { flow: &flow, reason: &reason });
                state.reset();
                return alerts;
            }
        }

        state.trim(self.window);
        alerts
    }

    /// Removes flows idle for at least `timeout`. Returns how many were removed.
    pub fn evict_idle(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.flows.len();
        self.flows
            .retain(|_, flow| now.saturating_duration_since(flow.last_seen) < timeout);
        before - self.flows.len()
    }

    /// Releases every flow (shutdown).
    pub fn clear(&mut self) {
        self.flows.clear();
    }

    pub fn get(&self, key: &K) -> Option<&FlowState> {
        self.flows.get(key)
    }

    /// Flows currently held.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Running total of flows ever created, including evicted ones.
    pub fn flows_created(&self) -> u64 {
        self.created
    }
}

impl FlowTracker<FlowKey> {
    /// Routes one captured packet into its flow.
    ///
    /// Packets without payload, non-TCP packets and packets from or to the
    /// monitoring host are dropped without touching the table.
    pub fn on_packet(&mut self, packet: &Packet, now: Instant) -> Vec<MalwareAlert> {
        if packet.payload.is_empty() {
            return Vec::new();
        }
        if self.self_addr.is_some_and(|me| packet.touches(me)) {
            return Vec::new();
        }
        match packet.flow_key() {
            Some(key) => self.ingest(key, &packet.payload, now),
            None => Vec::new(),
        }
    }
}
