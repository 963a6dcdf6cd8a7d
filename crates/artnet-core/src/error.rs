//! Error types for artnet-core.
//!
//! Runtime message handling never fails: malformed payloads clamp, unknown
//! prefixes are ignored and a missing player turns commands into no-ops.
//! The only errors are configuration mistakes caught at construction.

use std::time::Duration;

use thiserror::Error;

/// Result type for artnet-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building a node.
#[derive(Debug, Error)]
pub enum Error {
    /// The blink pulse does not fit inside the blink period.
    #[error("invalid blink timing: pulse {pulse_width:?} must be non-zero and shorter than period {period:?}")]
    InvalidBlinkTiming {
        pulse_width: Duration,
        period: Duration,
    },

    /// The status interval range is empty.
    #[error("invalid status interval: min {min:?} must be shorter than max {max:?}")]
    InvalidStatusInterval { min: Duration, max: Duration },

    /// The chaos sampling cadence is zero.
    #[error("chaos sample interval must be non-zero")]
    InvalidSampleInterval,

    /// A role name did not match any known role.
    #[error("unknown node role: {0}")]
    UnknownRole(String),
}
