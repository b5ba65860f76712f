//! bobbi-watchdog: a real-time network threat monitor.
//!
//! The binary wires command-line configuration into [`monitor::start_monitor`];
//! everything it uses is public here so the engine can be driven from tests
//! with an in-memory [`monitor::capture::MemorySource`].

pub mod logger;
pub mod monitor;
