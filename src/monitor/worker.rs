//! The two long-running detection tasks.
//!
//! Each worker owns its detector state outright (the ICMP counter lives
//! inside one cycle call, the flow table inside the TCP loop) and shares
//! only the logger, the statistics atomics and the shutdown flag.

use crate::monitor::capture::{ticks_or_empty, CaptureFilter, PacketSource};
use crate::monitor::config::PAUSE_SLICE;
use crate::monitor::detection::IcmpThreatDetector;
use crate::monitor::error::MonitorError;
use crate::monitor::eviction::{sweep, EvictionSchedule};
use crate::monitor::flow::FlowTracker;
use crate::monitor::signatures::SignatureMatcher;
use crate::monitor::types::Packet;
use crate::monitor::MonitorConfig;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sleeps for `duration` in short slices. Returns `false` as soon as the
/// shutdown flag is observed, `true` if the full pause elapsed.
pub fn sleep_unless_shutdown(duration: Duration, cfg: &MonitorConfig) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cfg.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(PAUSE_SLICE.min(deadline - now));
    }
}

/// Repeats ICMP cycles until shutdown. A non-live source gets one cycle.
pub fn run_icmp_worker(cfg: &MonitorConfig, source: &dyn PacketSource) {
    let detector = IcmpThreatDetector::new(cfg.icmp_threshold, cfg.self_addr, Arc::clone(&cfg.logger));
    cfg.logger.info(&format!(
        "ICMP detection started on {} ({}s cycles)",
        cfg.interface,
        cfg.cycle_duration.as_secs()
    ));

    while !cfg.shutdown.load(Ordering::Relaxed) {
        let report = detector.run_cycle(source, &cfg.interface, cfg.cycle_duration, &cfg.shutdown);

        cfg.stats.icmp_cycles.fetch_add(1, Ordering::Relaxed);
        cfg.stats.packets_total.fetch_add(report.counter.total(), Ordering::Relaxed);
        cfg.stats
            .threats_flagged
            .fetch_add(report.threats.len() as u64, Ordering::Relaxed);

        if !source.is_live() {
            cfg.logger.info("ICMP source exhausted");
            break;
        }
        if !sleep_unless_shutdown(cfg.cycle_pause, cfg) {
            break;
        }
    }

    cfg.logger.info("ICMP detection worker stopped");
}

/// Feeds one long TCP capture through the flow tracker until the capture
/// ends (duration elapsed, shutdown, or source exhausted).
pub fn run_tcp_worker(cfg: &MonitorConfig, source: &dyn PacketSource, tracker: &mut FlowTracker) {
    cfg.logger.info(&format!("TCP malware scanning started on {}", cfg.interface));

    let ticks = ticks_or_empty(
        source,
        &cfg.interface,
        CaptureFilter::Tcp,
        cfg.tcp_duration,
        &cfg.shutdown,
        &cfg.logger,
    );
    let mut schedule = EvictionSchedule::new(cfg.evict_interval, Instant::now());

    for tick in ticks {
        tcp_tick(cfg, tracker, &mut schedule, tick.as_ref(), Instant::now());
    }

    let released = tracker.len();
    tracker.clear();
    cfg.logger.info(&format!(
        "TCP malware scanning worker stopped ({} flows released)",
        released
    ));
}

/// One step of the TCP loop: a captured packet, or `None` when a read
/// timeout passed on a quiet interface. The idle sweep is checked either way.
fn tcp_tick(
    cfg:      &MonitorConfig,
    tracker:  &mut FlowTracker,
    schedule: &mut EvictionSchedule,
    packet:   Option<&Packet>,
    now:      Instant,
) {
    if let Some(packet) = packet {
        cfg.stats.packets_total.fetch_add(1, Ordering::Relaxed);

        let alerts = tracker.on_packet(packet, now);
        if !alerts.is_empty() {
            cfg.stats
                .malware_alerts
                .fetch_add(alerts.len() as u64, Ordering::Relaxed);
        }
        cfg.stats
            .total_flows_tracked
            .store(tracker.flows_created(), Ordering::Relaxed);
    }

    if schedule.due(now) {
        sweep(tracker, now, &cfg.logger);
    }
}

/// Starts the ICMP worker on a named thread.
///
/// # Errors
/// [`MonitorError::Io`] if the OS refuses to create the thread.
pub fn spawn_icmp_worker(
    cfg:    Arc<MonitorConfig>,
    source: Arc<dyn PacketSource>,
) -> Result<JoinHandle<()>, MonitorError> {
    let handle = thread::Builder::new()
        .name("icmp-worker".into())
        .spawn(move || run_icmp_worker(&cfg, source.as_ref()))?;
    Ok(handle)
}

/// Starts the TCP worker on a named thread. The worker takes ownership of
/// `matcher` and builds its private flow table from it.
///
/// # Errors
/// [`MonitorError::Io`] if the OS refuses to create the thread.
pub fn spawn_tcp_worker(
    cfg:     Arc<MonitorConfig>,
    source:  Arc<dyn PacketSource>,
    matcher: Box<dyn SignatureMatcher>,
) -> Result<JoinHandle<()>, MonitorError> {
    let handle = thread::Builder::new()
        .name("tcp-worker".into())
        .spawn(move || {
            let mut tracker = FlowTracker::new(matcher, cfg.flow_window, Arc::clone(&cfg.logger))
                .with_self_address(cfg.self_addr);
            run_tcp_worker(&cfg, source.as_ref(), &mut tracker);
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::monitor::capture::MemorySource;
    use crate::monitor::config::FLOW_IDLE_TIMEOUT;
    use crate::monitor::signatures::{Signature, SubstringMatcher};
    use crate::monitor::types::SessionStats;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use std::num::NonZeroU32;
    use std::sync::atomic::AtomicBool;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn config(threshold: u32, self_addr: Option<IpAddr>) -> MonitorConfig {
        MonitorConfig {
            interface:      "lo0".into(),
            icmp_threshold: NonZeroU32::new(threshold).unwrap(),
            cycle_duration: Duration::from_secs(2),
            cycle_pause:    Duration::from_millis(50),
            tcp_duration:   None,
            flow_window:    64,
            evict_interval: Duration::from_secs(10),
            self_addr,
            logger:         Logger::silent(),
            stats:          SessionStats::new(),
            shutdown:       Arc::new(AtomicBool::new(false)),
        }
    }

    fn tracker(cfg: &MonitorConfig) -> FlowTracker {
        let sigs = vec![Signature::new("malware-sig", "malware-sig")];
        FlowTracker::new(Box::new(SubstringMatcher::new(sigs)), cfg.flow_window, Logger::silent())
            .with_self_address(cfg.self_addr)
    }

    #[test]
    fn pause_is_cut_short_by_shutdown() {
        let cfg = config(1, None);
        cfg.shutdown.store(true, Ordering::SeqCst);
        let started = Instant::now();
        assert!(!sleep_unless_shutdown(Duration::from_secs(5), &cfg));
        assert!(started.elapsed() < Duration::from_secs(1));

        let cfg = config(1, None);
        assert!(sleep_unless_shutdown(Duration::from_millis(20), &cfg));
    }

    #[test]
    fn icmp_worker_runs_one_cycle_over_finite_source() {
        let cfg = config(3, None);
        let mut packets: Vec<Packet> = (0..4).map(|_| Packet::icmp(addr(5), addr(1), Utc::now())).collect();
        packets.extend((0..2).map(|_| Packet::icmp(addr(6), addr(1), Utc::now())));
        let source = MemorySource::new(packets);

        run_icmp_worker(&cfg, &source);

        assert_eq!(cfg.stats.icmp_cycles.load(Ordering::Relaxed), 1);
        assert_eq!(cfg.stats.threats_flagged.load(Ordering::Relaxed), 1);
        assert_eq!(cfg.stats.packets_total.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn icmp_worker_does_not_start_after_shutdown() {
        let cfg = config(1, None);
        cfg.shutdown.store(true, Ordering::SeqCst);
        run_icmp_worker(&cfg, &MemorySource::default());
        assert_eq!(cfg.stats.icmp_cycles.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tcp_worker_alerts_across_segments_and_releases_flows() {
        let cfg = config(1, None);
        let source = MemorySource::new(vec![
            Packet::tcp(addr(9), 5000, addr(1), 80, b"mal".to_vec(), Utc::now()),
            Packet::tcp(addr(9), 5000, addr(1), 80, b"ware-sig".to_vec(), Utc::now()),
            Packet::icmp(addr(9), addr(1), Utc::now()),
        ]);
        let mut tracker = tracker(&cfg);

        run_tcp_worker(&cfg, &source, &mut tracker);

        assert_eq!(cfg.stats.malware_alerts.load(Ordering::Relaxed), 1);
        assert_eq!(cfg.stats.packets_total.load(Ordering::Relaxed), 2);
        assert_eq!(cfg.stats.total_flows_tracked.load(Ordering::Relaxed), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn tcp_worker_skips_own_traffic() {
        let me = addr(1);
        let cfg = config(1, Some(me));
        let source = MemorySource::new(vec![
            Packet::tcp(me, 443, addr(9), 5000, b"malware-sig".to_vec(), Utc::now()),
        ]);
        let mut tracker = tracker(&cfg);

        run_tcp_worker(&cfg, &source, &mut tracker);

        assert_eq!(cfg.stats.malware_alerts.load(Ordering::Relaxed), 0);
        assert_eq!(cfg.stats.total_flows_tracked.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn quiet_interface_still_sweeps_idle_flows() {
        let cfg = config(1, None);
        let mut tracker = tracker(&cfg);
        let start = Instant::now();
        let mut schedule = EvictionSchedule::new(cfg.evict_interval, start);
        let segment = Packet::tcp(addr(9), 5000, addr(1), 80, b"hello".to_vec(), Utc::now());

        tcp_tick(&cfg, &mut tracker, &mut schedule, Some(&segment), start);
        assert_eq!(tracker.len(), 1);

        // Only read timeouts from here on.
        tcp_tick(&cfg, &mut tracker, &mut schedule, None, start + cfg.evict_interval);
        assert_eq!(tracker.len(), 1);
        tcp_tick(
            &cfg,
            &mut tracker,
            &mut schedule,
            None,
            start + FLOW_IDLE_TIMEOUT + cfg.evict_interval,
        );
        assert!(tracker.is_empty());
        assert_eq!(cfg.stats.packets_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn spawned_workers_finish_over_finite_source() {
        let cfg = Arc::new(config(2, None));
        let source: Arc<dyn PacketSource> = Arc::new(MemorySource::new(vec![
            Packet::icmp(addr(5), addr(1), Utc::now()),
        ]));
        let matcher = Box::new(SubstringMatcher::new(vec![Signature::new("x", "xyz")]));

        let icmp = spawn_icmp_worker(Arc::clone(&cfg), Arc::clone(&source)).unwrap();
        let tcp = spawn_tcp_worker(Arc::clone(&cfg), source, matcher).unwrap();
        assert_eq!(icmp.thread().name(), Some("icmp-worker"));
        icmp.join().unwrap();
        tcp.join().unwrap();

        assert_eq!(cfg.stats.icmp_cycles.load(Ordering::Relaxed), 1);
    }
}
