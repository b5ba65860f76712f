//! Network watchdog engine.
//!
//! Two detection workers run side by side over one [`PacketSource`]:
//!
//! * the ICMP worker repeats fixed-length capture cycles, counts echo traffic
//!   per source address and flags any source above the configured threshold;
//! * the TCP worker runs one long capture, reassembles payloads per flow and
//!   scans each stream for malware signatures.
//!
//! Detector state is owned by its worker. The only shared pieces are the
//! logger, the session statistics and the shutdown flag, all behind `Arc`.
//! [`supervisor::WorkerSupervisor`] owns the lifecycle: it returns once both
//! workers have stopped or once the shutdown flag is raised.

pub mod capture;
pub mod config;
pub mod detection;
pub mod error;
pub mod eviction;
pub mod flow;
pub mod host;
pub mod parsers;
pub mod signatures;
pub mod supervisor;
pub mod types;
pub mod worker;

use crate::logger::SharedLogger;
use crate::monitor::capture::PacketSource;
use crate::monitor::error::MonitorError;
use crate::monitor::signatures::SignatureMatcher;
use crate::monitor::supervisor::{SupervisorOutcome, Worker, WorkerSupervisor};
use crate::monitor::types::{SharedStats, ShutdownFlag};
use crate::monitor::worker::{spawn_icmp_worker, spawn_tcp_worker};

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Configuration bundle passed from `main` into the monitoring engine.
pub struct MonitorConfig {
    /// Interface both workers capture on.
    pub interface:      String,
    /// A source is flagged when its per-cycle ICMP count is strictly above this.
    pub icmp_threshold: NonZeroU32,
    /// Length of one ICMP measurement window.
    pub cycle_duration: Duration,
    /// Pause between ICMP cycles.
    pub cycle_pause:    Duration,
    /// Bound on the TCP capture; `None` runs until shutdown.
    pub tcp_duration:   Option<Duration>,
    /// Per-flow reassembly window in bytes.
    pub flow_window:    usize,
    /// How often idle flows are swept from the TCP flow table.
    pub evict_interval: Duration,
    /// The host's own address, resolved once at startup. `None` disables
    /// self-traffic filtering.
    pub self_addr:      Option<IpAddr>,
    /// Shared structured logger.
    pub logger:         SharedLogger,
    /// Shared session statistics for the shutdown summary.
    pub stats:          SharedStats,
    /// Set by the Ctrl+C handler or by the supervisor.
    pub shutdown:       ShutdownFlag,
}

/// Starts both workers and blocks until supervision ends.
///
/// # Errors
/// [`MonitorError::Io`] if a worker thread cannot be spawned. If the TCP
/// worker fails to start, the already running ICMP worker is stopped first.
pub fn start_monitor(
    cfg:     MonitorConfig,
    source:  Arc<dyn PacketSource>,
    matcher: Box<dyn SignatureMatcher>,
) -> Result<SupervisorOutcome, MonitorError> {
    let cfg = Arc::new(cfg);
    cfg.logger.info(&format!(
        "Network watchdog started on {} (ICMP threshold {})",
        cfg.interface, cfg.icmp_threshold
    ));

    let icmp = spawn_icmp_worker(Arc::clone(&cfg), Arc::clone(&source))?;
    let tcp = match spawn_tcp_worker(Arc::clone(&cfg), Arc::clone(&source), matcher) {
        Ok(handle) => handle,
        Err(e) => {
            cfg.shutdown.store(true, Ordering::SeqCst);
            Worker::new("icmp-worker", icmp).join(&cfg.logger);
            return Err(e);
        }
    };

    let supervisor = WorkerSupervisor::new(Arc::clone(&cfg.shutdown), Arc::clone(&cfg.logger));
    Ok(supervisor.supervise(vec![
        Worker::new("icmp-worker", icmp),
        Worker::new("tcp-worker", tcp),
    ]))
}
