//! Error taxonomy for the detection engine.
//!
//! Every variant except [`MonitorError::Signatures`] and [`MonitorError::Io`]
//! is contained at the task boundary that produced it: the owning worker logs
//! it and carries on with an empty result. Cancellation is not represented
//! here at all; it travels through the [`ShutdownFlag`](super::types::ShutdownFlag).

use std::io;

/// Unified error type for capture, resolution and analysis failures.
#[derive(thiserror::Error, Debug)]
pub enum MonitorError {
    /// The capture device could not be opened, filtered or read
    /// (missing interface, insufficient privilege, driver failure).
    #[error("capture failed on '{interface}': {reason}")]
    Capture { interface: String, reason: String },

    /// The monitoring host's own address could not be determined.
    #[error("self-address resolution failed: {0}")]
    Resolution(String),

    /// A signature matcher could not scan a buffer. The caller attaches the
    /// flow it was scanning when logging.
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// The signature file could not be read or parsed.
    #[error("invalid signature set '{path}': {reason}")]
    Signatures { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MonitorError {
    pub(crate) fn capture(interface: &str, reason: impl ToString) -> Self {
        MonitorError::Capture {
            interface: interface.to_string(),
            reason:    reason.to_string(),
        }
    }
}
