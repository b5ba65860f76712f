//! Structured logging for the watchdog.
//!
//! Provides a [`Logger`] that writes events to stdout and optionally to a log
//! file. Output can be formatted as human-readable plain text or as
//! newline-delimited JSON (NDJSON).
//!
//! Both workers log through the same `Arc<Logger>`. A single mutex guards the
//! stdout handle and the file writer together, so a line is always written in
//! one piece to both destinations.

use chrono::Local;
use serde::Serialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ── Levels ───────────────────────────────────────────────────────────────────

/// Severity attached to every [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Debug   => "DEBUG",
            Level::Info    => "INFO",
            Level::Warning => "WARNING",
            Level::Error   => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug"             => Ok(Level::Debug),
            "info"              => Ok(Level::Info),
            "warn" | "warning"  => Ok(Level::Warning),
            "error"             => Ok(Level::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct event kinds the watchdog can emit.
///
/// The `#[serde(tag = "event")]` attribute ensures JSON output includes an
/// `"event"` key so consumers can filter by type without inspecting structure.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    /// Free-form messages at each level.
    Debug { message: &'a str },
    Info { message: &'a str },
    Warning { message: &'a str },
    Error { message: &'a str },

    /// An ICMP measurement window is starting.
    IcmpCycle { interface: &'a str, duration_secs: u64 },

    /// A source exceeded the ICMP threshold within one cycle.
    IcmpThreat { src: &'a str, count: u64, threshold: u32 },

    /// A cycle finished without any source above the threshold.
    IcmpClean { sources: usize, packets: u64 },

    /// A malware signature was found in a TCP stream.
    MalwareDetected { flow: &'a str, signature: &'a str, offset: u64 },

    /// The capture primitive failed; the caller continues with no packets.
    CaptureFailed { interface: &'a str, reason: &'a str },

    /// A signature matcher failed on one flow; that flow's buffer was reset.
    FlowAnalysisFailed { flow: &'a str, reason: &'a str },

    /// Idle flows were released by the eviction sweep.
    FlowsEvicted { evicted: usize, remaining: usize },

    /// The host's own address is unknown; self-traffic is not filtered.
    DegradedMode { reason: &'a str },

    /// Session summary emitted on shutdown.
    SessionSummary {
        duration_secs:   u64,
        packets_total:   u64,
        icmp_cycles:     u64,
        threats_flagged: u64,
        flows_tracked:   u64,
        malware_alerts:  u64,
    },
}

impl Event<'_> {
    /// Severity of this event.
    pub fn level(&self) -> Level {
        match self {
            Event::Debug { .. } => Level::Debug,

            Event::Info { .. }
            | Event::IcmpCycle { .. }
            | Event::IcmpClean { .. }
            | Event::FlowsEvicted { .. }
            | Event::SessionSummary { .. } => Level::Info,

            Event::Warning { .. }
            | Event::IcmpThreat { .. }
            | Event::MalwareDetected { .. }
            | Event::DegradedMode { .. } => Level::Warning,

            Event::Error { .. }
            | Event::CaptureFailed { .. }
            | Event::FlowAnalysisFailed { .. } => Level::Error,
        }
    }
}

// ── Logger ───────────────────────────────────────────────────────────────────

/// Output destinations, locked as one unit.
struct Sinks {
    stdout: bool,
    file:   Option<BufWriter<std::fs::File>>,
}

/// Shared, thread-safe structured logger.
///
/// Constructed once in `main` and passed as an `Arc<Logger>` to both workers
/// and the supervisor.
pub struct Logger {
    /// Whether to format events as NDJSON instead of plain text.
    json:      bool,
    /// Events below this level are dropped.
    min_level: Level,
    sinks:     Mutex<Sinks>,
}

/// Type alias used throughout the codebase for convenience.
pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Creates a new logger writing to stdout.
    ///
    /// # Arguments
    /// * `json`      - Emit NDJSON instead of plain text when `true`.
    /// * `log_path`  - If `Some`, open (or create) this file for appended writes.
    /// * `min_level` - Events below this level are discarded.
    ///
    /// # Errors
    /// Returns an `io::Error` if the log file cannot be opened or created.
    pub fn new(json: bool, log_path: Option<&str>, min_level: Level) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Some(BufWriter::new(f))
            }
            None => None,
        };

        Ok(Self {
            json,
            min_level,
            sinks: Mutex::new(Sinks { stdout: true, file }),
        })
    }

    /// A logger that discards everything. Used by library callers and tests
    /// that only care about returned values.
    pub fn silent() -> SharedLogger {
        Arc::new(Self {
            json:      false,
            min_level: Level::Error,
            sinks:     Mutex::new(Sinks { stdout: false, file: None }),
        })
    }

    /// Whether an event at `level` would be written.
    pub fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    /// Logs a single [`Event`], writing to stdout and optionally to the log file.
    ///
    /// Plain-text output is prefixed with a timestamp and the level tag.
    /// NDJSON output is a single JSON object per line with `"timestamp"` and
    /// `"level"` fields injected alongside the event fields.
    pub fn log(&self, event: &Event) {
        let level = event.level();
        if !self.enabled(level) {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

        let line = if self.json {
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert("timestamp".to_string(), serde_json::Value::String(timestamp));
                obj.insert(
                    "level".to_string(),
                    serde_json::to_value(level).unwrap_or_default(),
                );
            }
            serde_json::to_string(&val).unwrap_or_default()
        } else {
            format!("[{}] [{}] {}", timestamp, level, plain_text(event))
        };

        // A poisoned lock only means another thread panicked mid-write; the
        // sinks themselves are still usable.
        let mut sinks = match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if sinks.stdout {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", line);
        }
        if let Some(writer) = sinks.file.as_mut() {
            let _ = writeln!(writer, "{}", line);
            let _ = writer.flush();
        }
    }

    pub fn info(&self, message: &str) {
        self.log(&Event::Info { message });
    }

    pub fn warn(&self, message: &str) {
        self.log(&Event::Warning { message });
    }

    pub fn error(&self, message: &str) {
        self.log(&Event::Error { message });
    }

    pub fn debug(&self, message: &str) {
        self.log(&Event::Debug { message });
    }

    /// Flushes the file writer. Called once by `main` before exit.
    pub fn flush(&self) {
        if let Ok(mut sinks) = self.sinks.lock() {
            if let Some(writer) = sinks.file.as_mut() {
                let _ = writer.flush();
            }
        }
    }
}

/// Formats an [`Event`] as a human-readable plain-text string (no timestamp).
fn plain_text(event: &Event) -> String {
    match event {
        Event::Debug { message }
        | Event::Info { message }
        | Event::Warning { message }
        | Event::Error { message } => message.to_string(),

        Event::IcmpCycle { interface, duration_secs } =>
            format!("[ICMP] capturing on {} for {}s", interface, duration_secs),

        Event::IcmpThreat { src, count, threshold } =>
            format!("[DDoS] {} sent {} ICMP packets (threshold {})", src, count, threshold),

        Event::IcmpClean { sources, packets } =>
            format!("[ICMP] no threat this cycle ({} packets from {} sources)", packets, sources),

        Event::MalwareDetected { flow, signature, offset } =>
            format!("[MALWARE] {} matched '{}' at stream offset {}", flow, signature, offset),

        Event::CaptureFailed { interface, reason } =>
            format!("[CAPTURE] {} unavailable: {}", interface, reason),

        Event::FlowAnalysisFailed { flow, reason } =>
            format!("[ANALYSIS] {} reset: {}", flow, reason),

        Event::FlowsEvicted { evicted, remaining } =>
            format!("[FLOWS] evicted {} idle flows, {} remaining", evicted, remaining),

        Event::DegradedMode { reason } =>
            format!("[DEGRADED] self-address unknown ({}); self-traffic will not be filtered", reason),

        Event::SessionSummary {
            duration_secs, packets_total, icmp_cycles, threats_flagged, flows_tracked, malware_alerts,
        } => format!(
            "[SUMMARY] duration={}s packets={} cycles={} threats={} flows={} malware={}",
            duration_secs, packets_total, icmp_cycles, threats_flagged, flows_tracked, malware_alerts
        ),
    }
}
