//! ArtNet Swarm Core
//!
//! Synchronization and sequencing logic for a swarm of art-installation nodes
//! sharing an unreliable broadcast mesh.
//!
//! # What lives here
//!
//! - **Blink synchronization**: every node flashes once per swarm member,
//!   with cycle boundaries locked to a shared period grid on the mesh's
//!   logical clock.
//! - **Chaos propagation**: a 0–4 intensity sampled on the controller,
//!   flooded as `chaos:<n>`, and used by every node to perturb playback.
//! - **Question/answer sequencing**: the controller's playback state machine
//!   that turns button presses and `eof_mp3` broadcasts into path requests.
//! - **Heartbeat**: randomized status reports plus a one-shot delay
//!   measurement after every membership change.
//!
//! # No I/O
//!
//! Nothing in this crate touches a socket, a speaker or a clock. A node is a
//! [`SwarmNode`] fed one [`Event`] at a time; it answers with a list of
//! [`Effect`]s for the runtime to carry out. Mesh facts (peers, logical time,
//! stability) are read through [`MeshView`], and randomness is injected.
//!
//! ```
//! use artnet_core::{Effect, Event, MeshView, NodeId, NodeRole, NodeSettings, SwarmNode};
//! use rand::{rngs::StdRng, SeedableRng};
//! use std::time::Duration;
//!
//! struct Solo;
//!
//! impl MeshView for Solo {
//!     fn node_id(&self) -> NodeId { NodeId(1) }
//!     fn logical_time(&self) -> Duration { Duration::ZERO }
//!     fn peers(&self) -> Vec<NodeId> { Vec::new() }
//!     fn stability(&self) -> u32 { 0 }
//! }
//!
//! let settings = NodeSettings::new(NodeRole::Controller);
//! let mut node = SwarmNode::new(settings, StdRng::seed_from_u64(7)).unwrap();
//! node.start(&Solo);
//!
//! let effects = node.handle(Event::AdvancePressed, &Solo);
//! assert!(effects.iter().any(|e| matches!(e, Effect::Broadcast(_))));
//! ```

pub mod blink;
pub mod chaos;
pub mod error;
pub mod indicator;
pub mod message;
pub mod node;
pub mod role;
pub mod router;
pub mod status;

pub use blink::{cycle_iterations, phase_delay, BlinkConfig, BlinkSchedule, BlinkSynchronizer, BlinkTick};
pub use chaos::{ChaosController, ChaosLevel, GlitchGate};
pub use error::{Error, Result};
pub use indicator::level_duty;
pub use message::Message;
pub use node::{Effect, Event, MeshView, NodeId, NodeSettings, SwarmNode, Timer};
pub use role::NodeRole;
pub use router::{next_question, track_path, PlaybackMode, RouterEvent, RouterState};
pub use status::{StatusConfig, StatusEmitter, StatusFiring, StatusSnapshot};

/// Number of recorded questions (and answers) on every player's card.
pub const QUESTION_COUNT: u8 = 26;

/// Mesh port shared by every node in the installation.
pub const MESH_PORT: u16 = 5555;
