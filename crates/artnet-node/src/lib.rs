//! ArtNet Node - runtime for one swarm member
//!
//! Wires an [`artnet_core::SwarmNode`] to its collaborators and runs it.
//!
//! # Architecture
//!
//! - **Config**: environment variables plus a board table keyed by chip id
//! - **Mesh**: [`MeshLink`] transports, either an in-process [`LoopbackSwarm`]
//!   or a LAN [`UdpMesh`]
//! - **Audio**: [`Player`] implementations; [`NullPlayer`] when a node has no
//!   speaker, [`ClipPlayer`] for timed playback of files under a media root
//! - **Runtime**: [`NodeRuntime`], a single task that services one timer or
//!   one inbound event per iteration
//! - **Console**: line commands standing in for the buttons and knob
//!
//! # Example
//!
//! ```no_run
//! use artnet_node::{NodeConfig, NodeRuntime, NullPlayer, UdpMesh};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let mesh = UdpMesh::bind(config.mesh.clone(), events_tx.clone()).await?;
//!     let runtime = NodeRuntime::new(config.settings(), mesh, NullPlayer, events_rx, StdRng::from_entropy())?;
//!     runtime.run().await;
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod config;
pub mod console;
pub mod error;
pub mod mesh;
pub mod runtime;

pub use audio::{ClipPlayer, NullPlayer, Player};
pub use config::{BoardProfile, NodeConfig, UdpMeshConfig};
pub use error::{Error, Result};
pub use mesh::{LoopbackMesh, LoopbackSwarm, MeshLink, UdpMesh};
pub use runtime::{LedState, NodeRuntime};
