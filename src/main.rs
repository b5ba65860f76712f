mod cli;

use bobbi_watchdog::logger::{Event, Logger, SharedLogger};
use bobbi_watchdog::monitor::capture::{PacketSource, PcapSource};
use bobbi_watchdog::monitor::config::{FALLBACK_INTERFACE, PROBE_TARGET};
use bobbi_watchdog::monitor::host::{
    default_interface, resolve_self_address, FallbackResolver, FixedAddress, InterfaceResolver,
    SelfAddressResolver, UdpProbeResolver,
};
use bobbi_watchdog::monitor::signatures::{MalwareDetector, Signature, SignatureSet};
use bobbi_watchdog::monitor::supervisor::SupervisorOutcome;
use bobbi_watchdog::monitor::types::{SessionStats, SharedStats, ShutdownFlag};
use bobbi_watchdog::monitor::{start_monitor, MonitorConfig};
use clap::Parser;
use cli::Cli;
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let shutdown: ShutdownFlag = Arc::new(AtomicBool::new(false));
    let session_start = Instant::now();

    let log_path = Some(cli.log_file.as_str()).filter(|p| !p.is_empty());
    let logger: SharedLogger = match Logger::new(cli.json, log_path, cli.log_level) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            eprintln!("Cannot open log file '{}': {}", cli.log_file, e);
            return ExitCode::FAILURE;
        }
    };

    // ── Signatures ────────────────────────────────────────────────────────────
    let signatures = match load_signatures(cli.signatures.as_deref(), &logger) {
        Some(s) => s,
        None => return ExitCode::FAILURE,
    };

    // ── Offline file scan ─────────────────────────────────────────────────────
    if let Some(ref path) = cli.scan_file {
        return scan_file(path, signatures, cli.flow_window, &logger);
    }

    let matcher = match SignatureSet::matcher(signatures) {
        Ok(m) => m,
        Err(e) => {
            logger.log(&Event::Error { message: &format!("Signature matcher: {}", e) });
            return ExitCode::FAILURE;
        }
    };

    // ── Interface and self-address ────────────────────────────────────────────
    let interface = cli
        .interface
        .clone()
        .or_else(default_interface)
        .unwrap_or_else(|| FALLBACK_INTERFACE.to_string());

    let resolver: Box<dyn SelfAddressResolver> = match (cli.self_ip, &cli.pcap_file) {
        (Some(ip), _) => Box::new(FixedAddress(Some(ip))),
        // A replayed trace was captured elsewhere; this host's address means nothing there.
        (None, Some(_)) => Box::new(FixedAddress(None)),
        (None, None) => live_resolver(&interface),
    };
    let self_addr = resolve_self_address(resolver.as_ref(), &logger);

    // ── Packet source ─────────────────────────────────────────────────────────
    let source: Arc<dyn PacketSource> = match cli.pcap_file {
        Some(ref path) => {
            logger.info(&format!("Replay mode active, reading {}", path));
            Arc::new(PcapSource::replay(path.clone(), Arc::clone(&logger)))
        }
        None => Arc::new(PcapSource::live(Arc::clone(&logger))),
    };

    register_shutdown_handler(Arc::clone(&shutdown), &logger);

    let stats = SessionStats::new();
    let cfg = MonitorConfig {
        interface,
        icmp_threshold: cli.threshold,
        cycle_duration: Duration::from_secs(cli.cycle_duration),
        cycle_pause:    Duration::from_secs(cli.cycle_pause),
        tcp_duration:   cli.tcp_duration.map(Duration::from_secs),
        flow_window:    cli.flow_window,
        evict_interval: Duration::from_secs(cli.evict_interval),
        self_addr,
        logger:         Arc::clone(&logger),
        stats:          Arc::clone(&stats),
        shutdown:       Arc::clone(&shutdown),
    };

    let code = match start_monitor(cfg, source, matcher) {
        Ok(SupervisorOutcome::Cancelled) => {
            logger.info("Shutting down...");
            ExitCode::SUCCESS
        }
        Ok(SupervisorOutcome::WorkersStopped) => ExitCode::SUCCESS,
        Err(e) => {
            logger.log(&Event::Error { message: &format!("Monitor error: {}", e) });
            ExitCode::FAILURE
        }
    };

    print_summary(&logger, &stats, session_start);
    logger.flush();
    code
}

/// UDP route probe first, then the interface's own address.
fn live_resolver(interface: &str) -> Box<dyn SelfAddressResolver> {
    let mut chain: Vec<Box<dyn SelfAddressResolver>> = Vec::new();
    if let Ok(target) = PROBE_TARGET.parse::<SocketAddr>() {
        chain.push(Box::new(UdpProbeResolver::new(target)));
    }
    chain.push(Box::new(InterfaceResolver { interface: interface.to_string() }));
    Box::new(FallbackResolver(chain))
}

/// Loads the signature file if one was given, otherwise the built-in set.
/// Logs and returns `None` on failure.
fn load_signatures(path: Option<&Path>, logger: &SharedLogger) -> Option<Vec<Signature>> {
    let Some(path) = path else {
        let builtin = SignatureSet::builtin();
        logger.info(&format!("Loaded {} built-in signatures", builtin.len()));
        return Some(builtin);
    };

    match SignatureSet::from_file(path) {
        Ok(sigs) => {
            logger.info(&format!("Loaded {} signatures from {}", sigs.len(), path.display()));
            Some(sigs)
        }
        Err(e) => {
            logger.log(&Event::Error { message: &e.to_string() });
            None
        }
    }
}

/// `--scan-file`: one offline verdict, reported through the exit status.
fn scan_file(path: &Path, signatures: Vec<Signature>, window: usize, logger: &SharedLogger) -> ExitCode {
    let detector = match SignatureSet::matcher(signatures) {
        Ok(m) => MalwareDetector::new(m, window, Arc::clone(logger)),
        Err(e) => {
            logger.log(&Event::Error { message: &format!("Signature matcher: {}", e) });
            return ExitCode::FAILURE;
        }
    };

    let code = match detector.analyze_file(path) {
        Ok(verdict) if verdict.is_malware => {
            let flow = path.display().to_string();
            for hit in &verdict.details {
                logger.log(&Event::MalwareDetected {
                    flow:      &flow,
                    signature: &hit.id,
                    offset:    hit.offset as u64,
                });
            }
            ExitCode::from(2)
        }
        Ok(_) => {
            logger.info(&format!("{}: clean", path.display()));
            ExitCode::SUCCESS
        }
        Err(e) => {
            logger.log(&Event::Error { message: &format!("{}: {}", path.display(), e) });
            ExitCode::FAILURE
        }
    };
    logger.flush();
    code
}

/// Ctrl+C raises the shared flag; the supervisor does the rest.
fn register_shutdown_handler(shutdown: ShutdownFlag, logger: &SharedLogger) {
    let result = ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    });
    if let Err(e) = result {
        logger.warn(&format!("Ctrl+C handler not installed: {}", e));
    }
}

/// Logs the session summary statistics.
fn print_summary(logger: &SharedLogger, stats: &SharedStats, session_start: Instant) {
    logger.log(&Event::SessionSummary {
        duration_secs:   session_start.elapsed().as_secs(),
        packets_total:   stats.packets_total.load(Ordering::Relaxed),
        icmp_cycles:     stats.icmp_cycles.load(Ordering::Relaxed),
        threats_flagged: stats.threats_flagged.load(Ordering::Relaxed),
        flows_tracked:   stats.total_flows_tracked.load(Ordering::Relaxed),
        malware_alerts:  stats.malware_alerts.load(Ordering::Relaxed),
    });
}
