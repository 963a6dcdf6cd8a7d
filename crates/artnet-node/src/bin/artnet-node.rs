//! ArtNet Node
//!
//! One swarm member on the LAN. Configured from `ARTNET_*` environment
//! variables; type `next`, `status` or `knob <raw>` on stdin to work the
//! buttons and knob.

use artnet_node::{console, ClipPlayer, NodeConfig, NodeRuntime, NullPlayer, Player, UdpMesh};
use rand::{rngs::StdRng, SeedableRng};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artnet=info,artnet_node=info,artnet_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env()?;
    tracing::info!(
        chip = %config.chip_id,
        node = %config.node_id,
        role = %config.role,
        has_audio = config.has_audio,
        "Starting ArtNet node"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mesh = UdpMesh::bind(config.mesh.clone(), events_tx.clone()).await?;

    let inputs = console::Inputs {
        buttons: config.has_buttons,
        knob: config.has_knob,
    };
    let console_tx = events_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = console::run(BufReader::new(tokio::io::stdin()), inputs, console_tx).await {
            tracing::error!("Console error: {}", e);
        }
    });

    if config.has_audio {
        let player = ClipPlayer::new(config.media_dir.clone(), config.clip_length, events_tx);
        run(&config, mesh, player, events_rx).await
    } else {
        run(&config, mesh, NullPlayer, events_rx).await
    }
}

async fn run<P: Player>(
    config: &NodeConfig,
    mesh: UdpMesh,
    player: P,
    events: mpsc::UnboundedReceiver<artnet_core::Event>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = NodeRuntime::new(config.settings(), mesh, player, events, StdRng::from_entropy())?;
    runtime.run().await;
    Ok(())
}
