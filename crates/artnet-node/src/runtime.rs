//! Node runtime: one task that owns a [`SwarmNode`] and services it.
//!
//! Timers and inbound events are multiplexed in a single `select!` loop, so
//! the core sees a strictly serialized event stream. Effects are carried out
//! immediately against the mesh and the player. LED state is published on a
//! watch channel for whatever drives the hardware (or a terminal view).

use std::collections::HashMap;

use artnet_core::{indicator, Effect, Event, NodeSettings, SwarmNode, Timer};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::audio::Player;
use crate::error::Result;
use crate::mesh::MeshLink;

/// How often the level LED duty is recomputed; fast enough for a smooth
/// 4 s breath.
pub const LEVEL_REFRESH: Duration = Duration::from_millis(50);

/// Indicator outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedState {
    /// Status LED, blinking in phase across the swarm.
    pub status: bool,
    /// Level LED duty, `0..=1000`.
    pub level_duty: u16,
}

pub struct NodeRuntime<M, P, R> {
    node: SwarmNode<R>,
    mesh: M,
    player: P,
    events: mpsc::UnboundedReceiver<Event>,
    timers: HashMap<Timer, Instant>,
    led_tx: watch::Sender<LedState>,
    started: Instant,
}

impl<M, P, R> NodeRuntime<M, P, R>
where
    M: MeshLink,
    P: Player,
    R: Rng,
{
    pub fn new(
        settings: NodeSettings,
        mesh: M,
        player: P,
        events: mpsc::UnboundedReceiver<Event>,
        rng: R,
    ) -> Result<Self> {
        let node = SwarmNode::new(settings, rng)?;
        let (led_tx, _) = watch::channel(LedState::default());
        Ok(Self {
            node,
            mesh,
            player,
            events,
            timers: HashMap::new(),
            led_tx,
            started: Instant::now(),
        })
    }

    /// Subscribe to LED updates.
    pub fn leds(&self) -> watch::Receiver<LedState> {
        self.led_tx.subscribe()
    }

    pub fn node(&self) -> &SwarmNode<R> {
        &self.node
    }

    pub fn mesh(&self) -> &M {
        &self.mesh
    }

    /// Feed one event through the node and carry out its effects.
    pub fn dispatch(&mut self, event: Event) {
        trace!(?event, "Dispatch");
        let effects = self.node.handle(event, &self.mesh);
        self.apply(effects);
        self.refresh_level();
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(message) => self.mesh.broadcast(&message.to_string()),
                Effect::Play(path) => self.player.play(&path),
                Effect::Seek(fraction) => self.player.seek(fraction),
                Effect::SetTimeOffset(seconds) => self.player.set_time_offset(seconds),
                Effect::MeasureDelay(peer) => self.mesh.measure_delay(peer),
                Effect::StatusLed(on) => self.led_tx.send_modify(|leds| leds.status = on),
                Effect::Arm(timer, delay) => {
                    self.timers.insert(timer, Instant::now() + delay);
                }
            }
        }
    }

    fn refresh_level(&self) {
        let duty = indicator::level_duty(self.mesh.stability(), self.started.elapsed());
        self.led_tx.send_if_modified(|leds| {
            let changed = leds.level_duty != duty;
            leds.level_duty = duty;
            changed
        });
    }

    fn next_timer(&self) -> Option<(Timer, Instant)> {
        self.timers
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(timer, at)| (*timer, *at))
    }

    /// Run until every event sender is dropped.
    pub async fn run(mut self) {
        let effects = self.node.start(&self.mesh);
        self.apply(effects);
        info!(node = %self.mesh.node_id(), "Runtime started");

        let mut level = tokio::time::interval(LEVEL_REFRESH);
        level.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let next = self.next_timer();
            let deadline = next.map_or_else(Instant::now, |(_, at)| at);

            let event = tokio::select! {
                biased;

                _ = sleep_until(deadline), if next.is_some() => next.map(|(timer, _)| {
                    self.timers.remove(&timer);
                    Event::Timer(timer)
                }),

                _ = level.tick() => None,

                received = self.events.recv() => match received {
                    Some(event) => Some(event),
                    None => break,
                },
            };

            match event {
                Some(event) => self.dispatch(event),
                None => self.refresh_level(),
            }
        }

        debug!(node = %self.mesh.node_id(), "Event channel closed, runtime stopping");
    }
}
