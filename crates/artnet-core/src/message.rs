//! The broadcast vocabulary.
//!
//! Everything travels as plain text on one untyped broadcast channel. The
//! receiver tells messages apart by prefix:
//!
//! ```text
//! chaos:<int>          new chaos level          controller, on knob change
//! glitch               perturb local playback   any node, chaos-gated
//! eof_mp3[:...]        local playback finished  any playing node
//! /<path>              play this file now       controller
//! Status from node ... heartbeat                every node
//! ```

use std::fmt;

use crate::chaos::ChaosLevel;

const CHAOS_PREFIX: &str = "chaos:";
const GLITCH_PREFIX: &str = "glitch";
const FINISHED_PREFIX: &str = "eof_mp3";
const PATH_PREFIX: &str = "/";
const STATUS_PREFIX: &str = "Status from node";

/// A decoded broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Play this path immediately.
    PathRequest(String),
    /// Some node finished playing a file.
    PlaybackFinished,
    /// The controller's chaos level changed.
    ChaosUpdate(ChaosLevel),
    /// Ask every node for a local playback glitch.
    GlitchPulse,
    /// Liveness report; carried verbatim.
    StatusReport(String),
    /// Matched no known prefix.
    Unknown(String),
}

impl Message {
    /// Decode a broadcast. Never fails: unparsable chaos levels become 0 and
    /// unrecognized text becomes [`Message::Unknown`].
    pub fn parse(text: &str) -> Self {
        if let Some(payload) = text.strip_prefix(CHAOS_PREFIX) {
            Self::ChaosUpdate(ChaosLevel::new(parse_leading_int(payload)))
        } else if text.starts_with(GLITCH_PREFIX) {
            Self::GlitchPulse
        } else if text.starts_with(PATH_PREFIX) {
            Self::PathRequest(text.to_string())
        } else if text.starts_with(FINISHED_PREFIX) {
            Self::PlaybackFinished
        } else if text.starts_with(STATUS_PREFIX) {
            Self::StatusReport(text.to_string())
        } else {
            Self::Unknown(text.to_string())
        }
    }

    /// Build a heartbeat report for `node_id` with free-form detail.
    pub fn status(node_id: impl fmt::Display, detail: &str) -> Self {
        Self::StatusReport(format!("{} {} {}", STATUS_PREFIX, node_id, detail))
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathRequest(_) => "path",
            Self::PlaybackFinished => "eof",
            Self::ChaosUpdate(_) => "chaos",
            Self::GlitchPulse => "glitch",
            Self::StatusReport(_) => "status",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathRequest(path) => write!(f, "{}", path),
            Self::PlaybackFinished => write!(f, "{}:", FINISHED_PREFIX),
            Self::ChaosUpdate(level) => write!(f, "{}{}", CHAOS_PREFIX, level),
            Self::GlitchPulse => write!(f, "{}", GLITCH_PREFIX),
            Self::StatusReport(text) | Self::Unknown(text) => write!(f, "{}", text),
        }
    }
}

/// Parse like C `atol`: skip leading whitespace, optional sign, then digits.
/// No digits yields 0.
fn parse_leading_int(payload: &str) -> i64 {
    let trimmed = payload.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| acc.saturating_mul(10).saturating_add(i64::from(d - b'0')));

    if negative {
        -value
    } else {
        value
    }
}
