use std::time::Duration;

/// Maximum time a TCP flow can remain idle before its stream buffer is evicted.
///
/// A flow that has been silent this long has either closed without the
/// monitor seeing a FIN/RST or is a long-poll that will re-open a fresh
/// buffer on its next segment. Either way its retained tail is released.
pub const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of trailing payload bytes retained per flow.
///
/// The effective window is never smaller than the longest signature minus
/// one byte, so this only bounds memory, never detection.
pub const DEFAULT_FLOW_WINDOW: usize = 4096;

/// Read timeout handed to libpcap, in milliseconds.
///
/// `next_packet` returns `TimeoutExpired` at least this often on a quiet
/// interface, which is when the capture loop re-checks the shutdown flag and
/// the cycle deadline, and the TCP worker gets its idle sweep tick.
pub const CAPTURE_READ_TIMEOUT_MS: i32 = 200;

/// Snapshot length for live captures. Large enough for a full jumbo frame
/// so no TCP payload is truncated before scanning.
pub const CAPTURE_SNAPLEN: i32 = 65_535;

/// How often the supervisor checks whether both workers are still alive.
pub const SUPERVISOR_POLL: Duration = Duration::from_secs(1);

/// How long the supervisor waits for the workers to return once the
/// shutdown flag has been raised.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Granularity of every interruptible sleep (inter-cycle pause, supervisor
/// poll). Bounds the shutdown latency of a sleeping task.
pub const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// External address used by the UDP connect probe. Nothing is ever sent;
/// connecting only selects the outbound route and thus the local address.
pub const PROBE_TARGET: &str = "8.8.8.8:80";

/// Interface used when neither the CLI nor the environment names one and no
/// non-loopback interface can be discovered.
pub const FALLBACK_INTERFACE: &str = "eth0";

/// Minimum run of x86 NOP bytes reported by the heuristic matcher.
pub const MIN_NOP_SLED: usize = 16;
