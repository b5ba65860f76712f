//! ICMP flood detection.
//!
//! Each cycle is evaluated in isolation: a fresh [`IpCounter`] is built from
//! one capture window, compared against the threshold, and dropped. Nothing
//! carries over between cycles.

use crate::logger::{Event, SharedLogger};
use crate::monitor::capture::{capture_or_empty, CaptureFilter, PacketSource};
use crate::monitor::types::{Packet, ShutdownFlag, ThreatRecord};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

/// Per-source ICMP packet counts for one cycle.
#[derive(Debug, Default, Clone)]
pub struct IpCounter {
    counts: HashMap<IpAddr, u64>,
}

impl IpCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one packet for `src`.
    pub fn record(&mut self, src: IpAddr) {
        *self.counts.entry(src).or_insert(0) += 1;
    }

    pub fn get(&self, src: &IpAddr) -> u64 {
        self.counts.get(src).copied().unwrap_or(0)
    }

    /// Number of distinct sources seen.
    pub fn sources(&self) -> usize {
        self.counts.len()
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &u64)> {
        self.counts.iter()
    }
}

/// Outcome of one ICMP cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub counter: IpCounter,
    /// Sources strictly above the threshold. No particular order.
    pub threats: Vec<ThreatRecord>,
}

/// Threshold detector for ICMP echo floods.
pub struct IcmpThreatDetector {
    threshold: NonZeroU32,
    self_addr: Option<IpAddr>,
    logger:    SharedLogger,
}

impl IcmpThreatDetector {
    pub fn new(threshold: NonZeroU32, self_addr: Option<IpAddr>, logger: SharedLogger) -> Self {
        logger.info(&format!(
            "ICMP detector initialised with a threshold of {} packets",
            threshold
        ));
        Self { threshold, self_addr, logger }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.get()
    }

    /// Tallies packets per source address, skipping packets sent by the
    /// monitoring host itself.
    pub fn count<I>(&self, packets: I) -> IpCounter
    where
        I: IntoIterator<Item = Packet>,
    {
        let mut counter = IpCounter::new();
        for packet in packets {
            if self.self_addr == Some(packet.src) {
                continue;
            }
            counter.record(packet.src);
        }
        counter
    }

    /// Every source with `count > threshold`.
    pub fn evaluate(&self, counter: &IpCounter) -> Vec<ThreatRecord> {
        let threshold = self.threshold.get();
        counter
            .iter()
            .filter(|&(_, &count)| count > u64::from(threshold))
            .map(|(&source, &count)| ThreatRecord { source, count, threshold })
            .collect()
    }

    /// Runs one Capturing → Counting → Reporting pass.
    ///
    /// A capture failure is logged by the capture layer and yields an empty
    /// report; it never aborts the caller's loop.
    pub fn run_cycle(
        &self,
        source:         &dyn PacketSource,
        interface:      &str,
        cycle_duration: Duration,
        shutdown:       &ShutdownFlag,
    ) -> CycleReport {
        self.logger.log(&Event::IcmpCycle {
            interface,
            duration_secs: cycle_duration.as_secs(),
        });

        let packets = capture_or_empty(
            source,
            interface,
            CaptureFilter::Icmp,
            Some(cycle_duration),
            shutdown,
            &self.logger,
        );
        let counter = self.count(packets);
        let threats = self.evaluate(&counter);

        if threats.is_empty() {
            self.logger.log(&Event::IcmpClean {
                sources: counter.sources(),
                packets: counter.total(),
            });
        }
        for threat in &threats {
            let src = threat.source.to_string();
            self.logger.log(&Event::IcmpThreat {
                src:       &src,
                count:     threat.count,
                threshold: threat.threshold,
            });
        }

        CycleReport { counter, threats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn pings(src: IpAddr, n: usize) -> Vec<Packet> {
        (0..n).map(|_| Packet::icmp(src, ip(1), Utc::now())).collect()
    }

    fn detector(threshold: u32, self_addr: Option<IpAddr>) -> IcmpThreatDetector {
        IcmpThreatDetector::new(
            NonZeroU32::new(threshold).unwrap(),
            self_addr,
            Logger::silent(),
        )
    }

    #[test]
    fn only_sources_above_threshold_are_flagged() {
        for threshold in [1u32, 3, 10, 50] {
            let t = threshold as usize;
            let det = detector(threshold, None);

            let mut packets = pings(ip(5), t + 1);
            packets.extend(pings(ip(6), t));
            packets.extend(pings(ip(7), t / 2));

            let counter = det.count(packets);
            let flagged: HashSet<IpAddr> =
                det.evaluate(&counter).into_iter().map(|r| r.source).collect();

            assert_eq!(flagged, HashSet::from([ip(5)]), "threshold {}", threshold);
        }
    }

    #[test]
    fn exactly_threshold_is_not_a_threat() {
        let det = detector(5, None);
        let counter = det.count(pings(ip(5), 5));
        assert_eq!(counter.get(&ip(5)), 5);
        assert!(det.evaluate(&counter).is_empty());
    }

    #[test]
    fn record_carries_count_and_threshold() {
        let det = detector(2, None);
        let threats = det.evaluate(&det.count(pings(ip(9), 7)));
        assert_eq!(
            threats,
            vec![ThreatRecord { source: ip(9), count: 7, threshold: 2 }]
        );
    }

    #[test]
    fn self_originated_pings_are_not_counted() {
        let me = ip(200);
        let det = detector(1, Some(me));

        let mut packets = pings(me, 100);
        packets.extend(pings(ip(5), 2));

        let counter = det.count(packets);
        assert_eq!(counter.get(&me), 0);
        assert_eq!(counter.get(&ip(5)), 2);

        let flagged: Vec<IpAddr> = det.evaluate(&counter).into_iter().map(|r| r.source).collect();
        assert_eq!(flagged, vec![ip(5)]);
    }

    #[test]
    fn empty_cycle_is_an_empty_report() {
        let det = detector(3, None);
        let counter = det.count(Vec::new());
        assert_eq!(counter.sources(), 0);
        assert_eq!(counter.total(), 0);
        assert!(det.evaluate(&counter).is_empty());
    }
}
