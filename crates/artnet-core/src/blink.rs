//! Phase-locked blinking: one flash per swarm member, every period.
//!
//! # The Cycle
//!
//! ```text
//! logical time ─┬─────────────────────────┬─────────────────────────┬──▶
//!               k·period                  (k+1)·period              (k+2)·period
//!               █ █ █ ░░░░░░░░░░░░░░░░░░░ █ █ █ █ ░░░░░░░░░░░░░░░░░
//!               └ 2×(peers+1) toggles ┘   (a peer joined)
//! ```
//!
//! A cycle is `2 × (peers + 1)` toggles spaced by the pulse width, so the
//! LED flashes once for every node including this one. When the last toggle
//! of a cycle fires, the next cycle is scheduled for the next multiple of
//! `period` on the mesh's logical clock:
//!
//! ```text
//! delay = period − (logical_time mod period)
//! ```
//!
//! Nodes restart independently, but because they all compute the same grid
//! from (approximately) the same logical time, their flashes line up.
//! Membership changes restart the cycle immediately with the LED off.

use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};

/// Blink timing, fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlinkConfig {
    /// Length of the shared grid every cycle starts on.
    pub period: Duration,
    /// How long the LED stays on per flash.
    pub pulse_width: Duration,
    /// How long the LED stays off between flashes.
    pub pulse_gap: Duration,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(5000),
            pulse_width: Duration::from_millis(175),
            pulse_gap: Duration::from_millis(175),
        }
    }
}

impl BlinkConfig {
    /// Check that both pulse phases are non-zero and shorter than the period.
    pub fn validate(&self) -> Result<()> {
        for pulse in [self.pulse_width, self.pulse_gap] {
            if pulse.is_zero() || pulse >= self.period {
                return Err(Error::InvalidBlinkTiming {
                    pulse_width: pulse,
                    period: self.period,
                });
            }
        }
        Ok(())
    }
}

/// Number of toggles in one cycle for a swarm with `peer_count` peers.
pub const fn cycle_iterations(peer_count: usize) -> usize {
    2 * (peer_count + 1)
}

/// Delay until the next multiple of `period` on the logical clock.
///
/// Exactly on a boundary this is a full period, never zero.
pub fn phase_delay(period: Duration, logical_time: Duration) -> Duration {
    let period_ns = period.as_nanos();
    if period_ns == 0 {
        return Duration::ZERO;
    }
    let into_period = logical_time.as_nanos() % period_ns;
    period - Duration::from_nanos(into_period as u64)
}

/// The blink task's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkSchedule {
    /// Toggles left in the current cycle.
    pub iterations_remaining: usize,
    /// Logical time the current cycle is anchored to.
    pub phase_anchor: Duration,
    /// Grid length.
    pub period: Duration,
    /// LED on time.
    pub pulse_width: Duration,
}

/// Result of one blink tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkTick {
    /// LED state after the toggle.
    pub led: bool,
    /// Delay until the next tick.
    pub next: Duration,
    /// Whether this tick ended the cycle.
    pub cycle_complete: bool,
}

/// Self-rescheduling blink task.
#[derive(Debug, Clone)]
pub struct BlinkSynchronizer {
    config: BlinkConfig,
    schedule: BlinkSchedule,
    on: bool,
}

impl BlinkSynchronizer {
    /// Create an idle synchronizer; call [`start`](Self::start) to arm it.
    pub fn new(config: BlinkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            schedule: BlinkSchedule {
                iterations_remaining: 0,
                phase_anchor: Duration::ZERO,
                period: config.period,
                pulse_width: config.pulse_width,
            },
            on: false,
        })
    }

    /// Current schedule.
    pub fn schedule(&self) -> &BlinkSchedule {
        &self.schedule
    }

    /// Current LED flag.
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Arm the first cycle. Returns the delay until its first tick.
    pub fn start(&mut self, peer_count: usize, logical_time: Duration) -> Duration {
        self.reset(peer_count, logical_time)
    }

    /// Restart the cycle after the swarm changed shape. The LED goes off and
    /// the new cycle begins on the next grid boundary.
    pub fn reset(&mut self, peer_count: usize, logical_time: Duration) -> Duration {
        self.on = false;
        self.rearm(peer_count, logical_time)
    }

    /// Toggle the LED and work out when to come back.
    pub fn on_tick(&mut self, peer_count: usize, logical_time: Duration) -> BlinkTick {
        self.on = !self.on;
        self.schedule.iterations_remaining = self.schedule.iterations_remaining.saturating_sub(1);

        if self.schedule.iterations_remaining == 0 {
            let next = self.rearm(peer_count, logical_time);
            return BlinkTick {
                led: self.on,
                next,
                cycle_complete: true,
            };
        }

        let next = if self.on {
            self.config.pulse_width
        } else {
            self.config.pulse_gap
        };
        BlinkTick {
            led: self.on,
            next,
            cycle_complete: false,
        }
    }

    fn rearm(&mut self, peer_count: usize, logical_time: Duration) -> Duration {
        let delay = phase_delay(self.config.period, logical_time);
        self.schedule.iterations_remaining = cycle_iterations(peer_count);
        self.schedule.phase_anchor = logical_time + delay;
        trace!(
            iterations = self.schedule.iterations_remaining,
            delay_ms = delay.as_millis() as u64,
            "Blink cycle armed"
        );
        delay
    }
}
