//! ArtNet Swarm Simulator
//!
//! Runs a controller and a handful of players in one process over a lossy
//! loopback mesh, pressing the advance button and turning the knob now and
//! then, and prints what each node ended up doing.
//!
//! Usage: `artnet-swarm [players] [seconds] [loss]`

use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use artnet_core::{Event, NodeId, NodeRole, NodeSettings};
use artnet_node::{LedState, LoopbackSwarm, NodeRuntime, NullPlayer, Player};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::{mpsc, watch};

const CONTROLLER_ID: NodeId = NodeId(6429);
const CLIP_LENGTH: Duration = Duration::from_secs(2);

/// Player that records what it was told to do and reports each clip's end
/// after a fixed delay.
#[derive(Clone)]
struct TallyPlayer {
    tally: Arc<Mutex<Tally>>,
    events: mpsc::UnboundedSender<Event>,
    finish: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

#[derive(Debug, Default)]
struct Tally {
    played: Vec<String>,
    seeks: usize,
    offsets: usize,
}

impl TallyPlayer {
    fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            tally: Arc::default(),
            events,
            finish: Arc::default(),
        }
    }
}

impl Player for TallyPlayer {
    fn play(&mut self, path: &str) {
        self.tally.lock().unwrap_or_else(|e| e.into_inner()).played.push(path.to_string());

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(CLIP_LENGTH).await;
            let _ = events.send(Event::PlaybackFinished);
        });
        if let Some(previous) = self.finish.lock().unwrap_or_else(|e| e.into_inner()).replace(task) {
            previous.abort();
        }
    }

    fn seek(&mut self, _fraction: f32) {
        self.tally.lock().unwrap_or_else(|e| e.into_inner()).seeks += 1;
    }

    fn set_time_offset(&mut self, _seconds: i32) {
        self.tally.lock().unwrap_or_else(|e| e.into_inner()).offsets += 1;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let player_count: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4);
    let seconds: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(30);
    let loss: f64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0.1);

    println!("ArtNet Swarm Simulator");
    println!("======================");
    println!();
    println!("1 controller + {} players, {}s, {:.0}% loss", player_count, seconds, loss * 100.0);
    println!();

    let swarm = LoopbackSwarm::with_loss(loss);
    let mut tasks = Vec::new();

    let (controller_tx, controller_rx) = mpsc::unbounded_channel();
    let controller = NodeRuntime::new(
        NodeSettings::new(NodeRole::Controller),
        swarm.join(CONTROLLER_ID, controller_tx.clone()),
        NullPlayer,
        controller_rx,
        StdRng::from_entropy(),
    )?;
    tasks.push(tokio::spawn(controller.run()));

    let mut players: Vec<(NodeId, TallyPlayer, watch::Receiver<LedState>)> = Vec::new();
    for i in 0..player_count {
        let id = NodeId(1000 + i);
        let (tx, rx) = mpsc::unbounded_channel();
        let player = TallyPlayer::new(tx.clone());
        let runtime = NodeRuntime::new(
            NodeSettings::new(NodeRole::Player),
            swarm.join(id, tx),
            player.clone(),
            rx,
            StdRng::from_entropy(),
        )?;
        players.push((id, player, runtime.leds()));
        tasks.push(tokio::spawn(runtime.run()));
    }

    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    for second in 0..seconds {
        ticker.tick().await;
        if second % 7 == 0 {
            let _ = controller_tx.send(Event::AdvancePressed);
        }
        if second % 5 == 0 {
            let raw = rng.gen_range(0..=4095u16);
            println!("[{:>3}s] knob -> {}", second, raw);
            let _ = controller_tx.send(Event::ChaosInput(raw));
        }
    }
    let _ = controller_tx.send(Event::StatusRequested);
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!();
    println!("Summary:");
    println!("  Members: {}", swarm.members().len());
    for (id, player, leds) in &players {
        let tally = player.tally.lock().unwrap_or_else(|e| e.into_inner());
        let led = *leds.borrow();
        println!(
            "  node {:>5}: {} tracks (last {}), {} seeks, {} offsets, level {}",
            id,
            tally.played.len(),
            tally.played.last().map(String::as_str).unwrap_or("-"),
            tally.seeks,
            tally.offsets,
            led.level_duty
        );
    }

    for task in tasks {
        task.abort();
    }
    Ok(())
}
