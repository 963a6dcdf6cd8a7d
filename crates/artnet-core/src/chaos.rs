//! Chaos intensity: sampling, propagation and the perturbations it drives.
//!
//! The controller quantizes its knob into a level 0–4 and floods
//! `chaos:<n>` whenever the level changes. Every node (controller included)
//! keeps a last-write-wins view of that level; there is no versioning, so
//! out-of-order delivery can briefly regress a node to an older value until
//! the next change is flooded.
//!
//! The level feeds three perturbations, all computed from the *local* view:
//!
//! | Source            | Condition                               | Command                      |
//! |-------------------|-----------------------------------------|------------------------------|
//! | inbound `glitch`  | always                                  | offset `level/2 − U[0,level)`|
//! | any inbound msg   | `level > 0` and `U[0, 7−level) == 1`    | seek near the current spot   |
//! | blink tick        | gate passes and `U[0,4) == 1`           | offset `1 − U[0,3)`          |

use std::fmt;

use rand::Rng;
use tracing::{debug, info};

use crate::message::Message;
use crate::role::NodeRole;

/// A chaos intensity, always within `0..=ChaosLevel::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "u8", into = "u8"))]
pub struct ChaosLevel(u8);

impl ChaosLevel {
    /// Highest chaos level.
    pub const MAX: u8 = 4;

    /// Calm: no perturbation at all.
    pub const CALM: Self = Self(0);

    /// Clamp any integer into range.
    pub fn new(value: i64) -> Self {
        Self(value.clamp(0, i64::from(Self::MAX)) as u8)
    }

    /// Quantize a 12-bit knob reading (0..=4095) into a level.
    pub const fn from_raw_sample(raw: u16) -> Self {
        let level = raw / 1000;
        if level > Self::MAX as u16 {
            Self(Self::MAX)
        } else {
            Self(level as u8)
        }
    }

    /// The numeric level.
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Whether this level is the maximum.
    pub const fn is_max(&self) -> bool {
        self.0 == Self::MAX
    }
}

impl From<u8> for ChaosLevel {
    fn from(value: u8) -> Self {
        Self::new(i64::from(value))
    }
}

impl From<ChaosLevel> for u8 {
    fn from(level: ChaosLevel) -> Self {
        level.0
    }
}

impl fmt::Display for ChaosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which chaos levels let the blink task glitch playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GlitchGate {
    /// Glitch at any level (simplified deployments).
    Always,
    /// Glitch only when the level is strictly above the given one.
    Above(ChaosLevel),
}

impl Default for GlitchGate {
    fn default() -> Self {
        Self::Above(ChaosLevel(2))
    }
}

impl GlitchGate {
    /// Whether the gate is open at `level`.
    pub fn passes(&self, level: ChaosLevel) -> bool {
        match self {
            Self::Always => true,
            Self::Above(threshold) => level > *threshold,
        }
    }
}

/// Holds this node's view of the chaos level.
#[derive(Debug, Clone)]
pub struct ChaosController {
    role: NodeRole,
    level: ChaosLevel,
}

impl ChaosController {
    /// Start calm.
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            level: ChaosLevel::CALM,
        }
    }

    /// Current local view.
    pub fn level(&self) -> ChaosLevel {
        self.level
    }

    /// Sample the knob. Returns the update to flood when the level changed.
    ///
    /// Players have no knob; samples reaching a player are ignored.
    pub fn sample_local(&mut self, raw: u16) -> Option<Message> {
        if !self.role.is_controller() {
            debug!(raw, "Ignoring chaos sample on player node");
            return None;
        }

        let sampled = ChaosLevel::from_raw_sample(raw);
        if sampled == self.level {
            return None;
        }

        self.level = sampled;
        info!(level = %sampled, "Chaos level set");
        Some(Message::ChaosUpdate(sampled))
    }

    /// Adopt a level flooded by a peer. Last write wins.
    pub fn on_chaos_message(&mut self, level: ChaosLevel) {
        debug!(previous = %self.level, level = %level, "Got chaos update");
        self.level = level;
    }

    /// Time offset (seconds) applied when a `glitch` pulse arrives.
    pub fn glitch_offset<R: Rng>(&self, rng: &mut R) -> i32 {
        let level = i32::from(self.level.value());
        if level == 0 {
            return 0;
        }
        level / 2 - rng.gen_range(0..level)
    }

    /// Random seek fraction applied after any inbound message.
    pub fn receive_seek<R: Rng>(&self, rng: &mut R) -> Option<f32> {
        let level = i32::from(self.level.value());
        if level == 0 {
            return None;
        }
        if rng.gen_range(0..(7 - level)) != 1 {
            return None;
        }

        let weird_factor = level * 20;
        let percent = 100 - rng.gen_range(0..weird_factor) + weird_factor / 2;
        Some(percent as f32 / 100.0)
    }

    /// Time offset (seconds) the blink task may inject on a tick.
    pub fn blink_glitch<R: Rng>(&self, gate: GlitchGate, rng: &mut R) -> Option<i32> {
        if !gate.passes(self.level) || rng.gen_range(0..4) != 1 {
            return None;
        }
        Some(1 - rng.gen_range(0..3))
    }

    /// Whether a local status request should also flood `glitch`.
    pub fn status_glitch(&self) -> bool {
        self.level.value() > 1
    }
}
