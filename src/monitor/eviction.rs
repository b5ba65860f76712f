//! Idle-flow eviction for the TCP worker.
//!
//! The flow table is private to the TCP worker, so eviction runs on that
//! thread between packets instead of on a sweeper thread behind a lock.
//! [`EvictionSchedule`] rate-limits the sweep to once per interval so the
//! full-table `retain` never runs at line rate.

use crate::logger::{Event, SharedLogger};
use crate::monitor::config::FLOW_IDLE_TIMEOUT;
use crate::monitor::flow::FlowTracker;
use std::fmt::Display;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Decides when the next sweep is due.
#[derive(Debug)]
pub struct EvictionSchedule {
    interval:   Duration,
    last_sweep: Instant,
}

impl EvictionSchedule {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last_sweep: now }
    }

    /// `true` at most once per interval; records the sweep when it fires.
    pub fn due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_sweep) >= self.interval {
            self.last_sweep = now;
            true
        } else {
            false
        }
    }
}

/// Removes flows idle for longer than [`FLOW_IDLE_TIMEOUT`] and logs the
/// result when anything was released.
pub fn sweep<K>(tracker: &mut FlowTracker<K>, now: Instant, logger: &SharedLogger) -> usize
where
    K: Hash + Eq + Clone + Display,
{
    let evicted = tracker.evict_idle(now, FLOW_IDLE_TIMEOUT);
    if evicted > 0 {
        logger.log(&Event::FlowsEvicted { evicted, remaining: tracker.len() });
    }
    evicted
}
