//! Heartbeat reports and delay-measurement scheduling.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::chaos::ChaosLevel;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::node::NodeId;
use crate::role::NodeRole;
use crate::router::PlaybackMode;

/// Heartbeat cadence. Each firing re-arms after a fresh draw from
/// `[min_interval, max_interval)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(5),
        }
    }
}

impl StatusConfig {
    /// The wider variant used by some deployments.
    pub fn relaxed() -> Self {
        Self {
            max_interval: Duration::from_secs(6),
            ..Self::default()
        }
    }

    /// Reject an empty interval range.
    pub fn validate(&self) -> Result<()> {
        if self.min_interval >= self.max_interval {
            return Err(Error::InvalidStatusInterval {
                min: self.min_interval,
                max: self.max_interval,
            });
        }
        Ok(())
    }
}

/// A point-in-time view of this node, used for heartbeats and the
/// diagnostic dump behind the status button.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub stability: u32,
    pub logical_time: Duration,
    pub peers: Vec<NodeId>,
    pub chaos: ChaosLevel,
    /// Sequencing position; only the controller has one.
    pub mode: Option<(PlaybackMode, u8)>,
}

impl StatusSnapshot {
    /// The heartbeat broadcast for this snapshot.
    pub fn report(&self) -> Message {
        let detail = format!(
            "peers: {} chaos: {} stability: {}",
            self.peers.len(),
            self.chaos,
            self.stability
        );
        Message::status(self.node_id, &detail)
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "node {} ({})", self.node_id, self.role)?;
        writeln!(
            f,
            "stability: {} || mesh time: {}us",
            self.stability,
            self.logical_time.as_micros()
        )?;
        writeln!(f, "num nodes: {}", self.peers.len() + 1)?;
        write!(f, "mesh nodes:")?;
        for peer in &self.peers {
            write!(f, " {}", peer)?;
        }
        writeln!(f)?;
        write!(f, "chaos: {}", self.chaos)?;
        if let Some((mode, question)) = self.mode {
            write!(f, " || mode: {} || question: {}", mode, question)?;
        }
        Ok(())
    }
}

/// Outcome of a heartbeat firing.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFiring {
    /// Broadcast to send.
    pub report: Message,
    /// Peers to start a delay measurement against (empty unless latched).
    pub measure: Vec<NodeId>,
    /// Delay until the next heartbeat.
    pub next: Duration,
}

/// Periodic heartbeat with a one-shot delay-measurement latch.
#[derive(Debug, Clone)]
pub struct StatusEmitter {
    config: StatusConfig,
    measure_pending: bool,
}

impl StatusEmitter {
    /// Create an emitter with the latch cleared.
    pub fn new(config: StatusConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            measure_pending: false,
        })
    }

    /// Draw the delay until the next heartbeat.
    pub fn next_interval<R: Rng>(&self, rng: &mut R) -> Duration {
        rng.gen_range(self.config.min_interval..self.config.max_interval)
    }

    /// Latch a delay measurement for the next heartbeat. Latching twice
    /// before a heartbeat still measures once.
    pub fn arm_delay_measurement(&mut self) {
        self.measure_pending = true;
    }

    /// Whether the next heartbeat will measure delays.
    pub fn measurement_pending(&self) -> bool {
        self.measure_pending
    }

    /// Fire the heartbeat: build the report, drain the latch and re-arm.
    pub fn fire<R: Rng>(&mut self, snapshot: &StatusSnapshot, rng: &mut R) -> StatusFiring {
        let measure = if std::mem::take(&mut self.measure_pending) {
            snapshot.peers.clone()
        } else {
            Vec::new()
        };
        let next = self.next_interval(rng);

        debug!(
            peers = snapshot.peers.len(),
            measuring = measure.len(),
            next_ms = next.as_millis() as u64,
            "Heartbeat"
        );

        StatusFiring {
            report: snapshot.report(),
            measure,
            next,
        }
    }
}
