use bobbi_watchdog::logger::Level;
use bobbi_watchdog::monitor::config::DEFAULT_FLOW_WINDOW;
use clap::Parser;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;

/// bobbi — real-time network threat monitor.
///
/// Watches one interface for ICMP floods (per-source echo counts over fixed
/// cycles) and scans reassembled TCP streams for malware signatures. Every
/// option can also be set through the environment variable shown.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "bobbi",
    version,
    about   = "Network watchdog: ICMP flood detection and TCP malware scanning",
    long_about = None,
)]
pub struct Cli {
    // ── Interface ────────────────────────────────────────────────────────────

    /// Network interface to capture on.
    ///
    /// If omitted, the first non-loopback IPv4 interface is used, falling
    /// back to `eth0`. Use `ip link` or `ifconfig` to list interfaces.
    #[arg(short = 'i', long = "interface", env = "INTERFACE", value_name = "IFACE")]
    pub interface: Option<String>,

    /// The host's own address. Skips auto-detection.
    ///
    /// Traffic from this address is excluded from ICMP counting, and traffic
    /// to or from it is excluded from TCP scanning.
    #[arg(long = "self-ip", env = "SELF_IP", value_name = "ADDR")]
    pub self_ip: Option<IpAddr>,

    // ── ICMP detection ───────────────────────────────────────────────────────

    /// A source is flagged when it sends more than this many ICMP packets in
    /// one cycle. Must be at least 1.
    #[arg(short = 't', long = "threshold", env = "THREAT_THRESHOLD", value_name = "N", default_value = "50")]
    pub threshold: NonZeroU32,

    /// Length of one ICMP measurement cycle, in seconds.
    #[arg(
        long = "cycle-duration",
        env = "ICMP_CYCLE_DURATION",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub cycle_duration: u64,

    /// Pause between ICMP cycles, in seconds.
    #[arg(long = "cycle-pause", env = "INTER_CYCLE_PAUSE", value_name = "SECS", default_value_t = 5)]
    pub cycle_pause: u64,

    // ── TCP scanning ─────────────────────────────────────────────────────────

    /// Stop the TCP capture after this many seconds. Runs until Ctrl+C if
    /// omitted.
    #[arg(long = "tcp-duration", env = "TCP_CAPTURE_DURATION", value_name = "SECS")]
    pub tcp_duration: Option<u64>,

    /// JSON file of extra signatures. The built-in set is used when omitted.
    #[arg(short = 's', long = "signatures", env = "SIGNATURE_FILE", value_name = "FILE")]
    pub signatures: Option<PathBuf>,

    /// Trailing payload bytes kept per flow. Raised automatically to the
    /// longest signature length.
    #[arg(long = "flow-window", env = "FLOW_WINDOW", value_name = "BYTES", default_value_t = DEFAULT_FLOW_WINDOW)]
    pub flow_window: usize,

    /// How often (in seconds) idle flows are swept from the flow table.
    #[arg(
        long = "evict-interval",
        env = "EVICT_INTERVAL",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub evict_interval: u64,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Append log output to this file in addition to stdout. Pass an empty
    /// string to log to stdout only.
    #[arg(short = 'o', long = "log-file", env = "LOG_FILE", value_name = "PATH", default_value = "network_log.txt")]
    pub log_file: String,

    /// Emit log entries as newline-delimited JSON (NDJSON).
    #[arg(short = 'j', long = "json", env = "LOG_JSON")]
    pub json: bool,

    /// Lowest severity written: debug, info, warning or error.
    #[arg(long = "log-level", env = "LOG_LEVEL", value_name = "LEVEL", default_value = "info")]
    pub log_level: Level,

    // ── Offline modes ────────────────────────────────────────────────────────

    /// Read packets from a saved PCAP file instead of a live interface.
    ///
    /// The file is analysed once by both detectors as a single ICMP cycle
    /// and a single TCP capture, then the watchdog exits.
    #[arg(short = 'r', long = "read", env = "PCAP_FILE", value_name = "FILE")]
    pub pcap_file: Option<String>,

    /// Scan one file for signatures and exit: status 0 when clean, 2 when
    /// malware is found.
    #[arg(long = "scan-file", value_name = "FILE", conflicts_with = "pcap_file")]
    pub scan_file: Option<PathBuf>,
}
