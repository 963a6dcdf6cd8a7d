//! The per-node coordinator.
//!
//! A [`SwarmNode`] owns every piece of mutable state on a node: the chaos
//! view, the blink schedule, the heartbeat latch and (on the controller) the
//! sequencing cursor. The runtime feeds it one [`Event`] at a time and
//! carries out the returned [`Effect`]s; since nothing else touches the
//! state, handlers never interleave and no locking is needed.
//!
//! # Dispatch
//!
//! | Event                | Controller                         | Player                 |
//! |----------------------|------------------------------------|------------------------|
//! | `AdvancePressed`     | router step, flood question path   | ignored                |
//! | inbound `eof_mp3`    | router step                        | ignored                |
//! | inbound `/path`      | play if it has audio               | play                   |
//! | local playback done  | flood `eof_mp3:`                   | flood `eof_mp3:`       |
//! | `Timer(ChaosSample)` | quantize knob, flood on change     | never armed            |
//! | inbound `chaos:<n>`  | overwrite view                     | overwrite view         |
//! | inbound `glitch`     | time offset                        | time offset            |
//! | membership change    | restart blink cycle                | restart blink cycle    |

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, trace};

use crate::blink::{BlinkConfig, BlinkSynchronizer};
use crate::chaos::{ChaosController, ChaosLevel, GlitchGate};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::role::NodeRole;
use crate::router::{RouterEvent, RouterState};
use crate::status::{StatusConfig, StatusEmitter, StatusSnapshot};

/// Mesh-assigned node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only facts the mesh provides.
pub trait MeshView {
    /// This node's identifier.
    fn node_id(&self) -> NodeId;

    /// Shared clock, approximately agreed across the swarm.
    fn logical_time(&self) -> Duration;

    /// Currently known peers, excluding this node.
    fn peers(&self) -> Vec<NodeId>;

    /// Link-quality metric; higher is better.
    fn stability(&self) -> u32;

    /// Number of known peers.
    fn peer_count(&self) -> usize {
        self.peers().len()
    }
}

/// The node's self-rescheduling timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Blink,
    Status,
    ChaosSample,
}

/// Everything that can happen to a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A timer armed with [`Effect::Arm`] expired.
    Timer(Timer),
    /// A broadcast arrived from a peer.
    Received { from: NodeId, text: String },
    /// Local playback reached the end of the file.
    PlaybackFinished,
    /// The "next" button was pressed.
    AdvancePressed,
    /// The "status" button was pressed.
    StatusRequested,
    /// Latest raw knob reading; acted on at the next sample tick.
    ChaosInput(u16),
    /// A direct connection to a new peer came up.
    PeerJoined(NodeId),
    /// Mesh membership changed somewhere.
    ConnectionsChanged,
    /// The mesh adjusted this node's logical clock.
    TimeAdjusted { offset_us: i64 },
    /// A delay measurement completed.
    DelayMeasured { peer: NodeId, delay: Duration },
}

/// Commands for the runtime. All are fire-and-forget.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Flood a message to every peer.
    Broadcast(Message),
    /// Start playing a file.
    Play(String),
    /// Seek the current file to a fraction of its length.
    Seek(f32),
    /// Shift playback by whole seconds.
    SetTimeOffset(i32),
    /// Ask the mesh to measure round-trip delay to a peer.
    MeasureDelay(NodeId),
    /// Drive the status LED.
    StatusLed(bool),
    /// (Re)arm a timer to fire after the delay.
    Arm(Timer, Duration),
}

/// Per-node settings, fixed at startup.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub role: NodeRole,
    /// Whether a speaker and card are attached.
    pub has_audio: bool,
    pub blink: BlinkConfig,
    pub status: StatusConfig,
    /// How often the controller reads its knob.
    pub chaos_sample_interval: Duration,
    /// When blink ticks may glitch playback.
    pub blink_glitch: GlitchGate,
}

impl NodeSettings {
    /// Defaults for `role`. Players have audio, the controller does not.
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            has_audio: !role.is_controller(),
            blink: BlinkConfig::default(),
            status: StatusConfig::default(),
            chaos_sample_interval: Duration::from_millis(400),
            blink_glitch: GlitchGate::default(),
        }
    }

    #[must_use]
    pub fn with_audio(mut self, has_audio: bool) -> Self {
        self.has_audio = has_audio;
        self
    }

    #[must_use]
    pub fn with_blink(mut self, blink: BlinkConfig) -> Self {
        self.blink = blink;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusConfig) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_chaos_sample_interval(mut self, interval: Duration) -> Self {
        self.chaos_sample_interval = interval;
        self
    }

    #[must_use]
    pub fn with_blink_glitch(mut self, gate: GlitchGate) -> Self {
        self.blink_glitch = gate;
        self
    }
}

/// One node's synchronization and sequencing state.
#[derive(Debug)]
pub struct SwarmNode<R> {
    settings: NodeSettings,
    chaos: ChaosController,
    blink: BlinkSynchronizer,
    status: StatusEmitter,
    router: RouterState,
    knob: Option<u16>,
    rng: R,
}

impl<R: Rng> SwarmNode<R> {
    /// Build a node. Fails only on invalid timing settings.
    pub fn new(settings: NodeSettings, rng: R) -> Result<Self> {
        if settings.chaos_sample_interval.is_zero() {
            return Err(Error::InvalidSampleInterval);
        }
        let blink = BlinkSynchronizer::new(settings.blink)?;
        let status = StatusEmitter::new(settings.status)?;

        Ok(Self {
            chaos: ChaosController::new(settings.role),
            blink,
            status,
            router: RouterState::default(),
            knob: None,
            settings,
            rng,
        })
    }

    pub fn role(&self) -> NodeRole {
        self.settings.role
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Local view of the chaos level.
    pub fn chaos_level(&self) -> ChaosLevel {
        self.chaos.level()
    }

    /// Sequencing state. Meaningful on the controller only.
    pub fn router(&self) -> RouterState {
        self.router
    }

    pub fn blink(&self) -> &BlinkSynchronizer {
        &self.blink
    }

    pub fn status(&self) -> &StatusEmitter {
        &self.status
    }

    /// Arm the initial timers.
    pub fn start(&mut self, mesh: &impl MeshView) -> Vec<Effect> {
        info!(
            node = %mesh.node_id(),
            role = %self.settings.role,
            has_audio = self.settings.has_audio,
            "Swarm node starting"
        );

        let mut effects = vec![
            Effect::StatusLed(false),
            Effect::Arm(Timer::Blink, self.blink.start(mesh.peer_count(), mesh.logical_time())),
            Effect::Arm(Timer::Status, self.status.next_interval(&mut self.rng)),
        ];
        if self.settings.role.is_controller() {
            effects.push(Effect::Arm(Timer::ChaosSample, self.settings.chaos_sample_interval));
        }
        effects
    }

    /// Handle one event.
    pub fn handle(&mut self, event: Event, mesh: &impl MeshView) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            Event::Timer(Timer::Blink) => self.on_blink_tick(mesh, &mut effects),
            Event::Timer(Timer::Status) => self.on_status_tick(mesh, &mut effects),
            Event::Timer(Timer::ChaosSample) => self.on_chaos_sample(&mut effects),
            Event::Received { from, text } => self.on_receive(from, &text, &mut effects),
            Event::PlaybackFinished => {
                info!("Local playback finished");
                effects.push(Effect::Broadcast(Message::PlaybackFinished));
            }
            Event::AdvancePressed => {
                if self.settings.role.is_controller() {
                    self.route(RouterEvent::Advance, &mut effects);
                } else {
                    debug!("Ignoring advance on player node");
                }
            }
            Event::StatusRequested => self.dump_status(mesh, &mut effects),
            Event::ChaosInput(raw) => {
                trace!(raw, "Knob reading");
                self.knob = Some(raw);
            }
            Event::PeerJoined(peer) => {
                info!(peer = %peer, "New connection");
                self.restart_blink(mesh, &mut effects);
            }
            Event::ConnectionsChanged => {
                info!(peers = mesh.peer_count(), "Changed connections");
                self.restart_blink(mesh, &mut effects);
                self.dump_status(mesh, &mut effects);
                self.status.arm_delay_measurement();
            }
            Event::TimeAdjusted { offset_us } => {
                debug!(offset_us, logical_us = mesh.logical_time().as_micros() as u64, "Adjusted time");
            }
            Event::DelayMeasured { peer, delay } => {
                info!(peer = %peer, delay_us = delay.as_micros() as u64, "Delay to node");
            }
        }

        effects
    }

    /// Current diagnostic snapshot.
    pub fn snapshot(&self, mesh: &impl MeshView) -> StatusSnapshot {
        StatusSnapshot {
            node_id: mesh.node_id(),
            role: self.settings.role,
            stability: mesh.stability(),
            logical_time: mesh.logical_time(),
            peers: mesh.peers(),
            chaos: self.chaos.level(),
            mode: self
                .settings
                .role
                .is_controller()
                .then_some((self.router.mode, self.router.question)),
        }
    }

    fn on_blink_tick(&mut self, mesh: &impl MeshView, effects: &mut Vec<Effect>) {
        let tick = self.blink.on_tick(mesh.peer_count(), mesh.logical_time());
        effects.push(Effect::StatusLed(tick.led));

        if let Some(offset) = self.chaos.blink_glitch(self.settings.blink_glitch, &mut self.rng) {
            trace!(offset, "Blink glitch");
            effects.push(Effect::SetTimeOffset(offset));
        }

        effects.push(Effect::Arm(Timer::Blink, tick.next));
    }

    fn on_status_tick(&mut self, mesh: &impl MeshView, effects: &mut Vec<Effect>) {
        let snapshot = self.snapshot(mesh);
        let firing = self.status.fire(&snapshot, &mut self.rng);

        debug!(report = %firing.report, "Sending status");
        effects.push(Effect::Broadcast(firing.report));
        effects.extend(firing.measure.into_iter().map(Effect::MeasureDelay));
        effects.push(Effect::Arm(Timer::Status, firing.next));
    }

    fn on_chaos_sample(&mut self, effects: &mut Vec<Effect>) {
        if !self.settings.role.is_controller() {
            return;
        }
        if let Some(update) = self.knob.and_then(|raw| self.chaos.sample_local(raw)) {
            effects.push(Effect::Broadcast(update));
        }
        effects.push(Effect::Arm(Timer::ChaosSample, self.settings.chaos_sample_interval));
    }

    fn on_receive(&mut self, from: NodeId, text: &str, effects: &mut Vec<Effect>) {
        let message = Message::parse(text);
        debug!(from = %from, kind = message.kind(), msg = text, "Message received");

        match message {
            Message::ChaosUpdate(level) => self.chaos.on_chaos_message(level),
            Message::GlitchPulse => {
                let offset = self.chaos.glitch_offset(&mut self.rng);
                if offset != 0 {
                    effects.push(Effect::SetTimeOffset(offset));
                }
            }
            Message::PathRequest(path) => {
                if self.settings.has_audio {
                    info!(path = %path, "Starting playback");
                    effects.push(Effect::Play(path));
                } else {
                    debug!(path = %path, "No audio on this node, ignoring path request");
                }
            }
            Message::PlaybackFinished => {
                if self.settings.role.is_controller() {
                    self.route(RouterEvent::PlaybackFinished, effects);
                }
            }
            Message::StatusReport(_) => {}
            Message::Unknown(_) => trace!(msg = text, "Ignoring unrecognized message"),
        }

        if let Some(fraction) = self.chaos.receive_seek(&mut self.rng) {
            trace!(fraction, "Receive glitch seek");
            effects.push(Effect::Seek(fraction));
        }
    }

    fn route(&mut self, event: RouterEvent, effects: &mut Vec<Effect>) {
        let (next, broadcasts) = self.router.step(event, self.chaos.level(), &mut self.rng);
        self.router = next;
        effects.extend(broadcasts.into_iter().map(Effect::Broadcast));
    }

    fn restart_blink(&mut self, mesh: &impl MeshView, effects: &mut Vec<Effect>) {
        let delay = self.blink.reset(mesh.peer_count(), mesh.logical_time());
        effects.push(Effect::StatusLed(false));
        effects.push(Effect::Arm(Timer::Blink, delay));
    }

    fn dump_status(&mut self, mesh: &impl MeshView, effects: &mut Vec<Effect>) {
        info!("\n{}", self.snapshot(mesh));
        if self.chaos.status_glitch() {
            effects.push(Effect::Broadcast(Message::GlitchPulse));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::PlaybackMode;
    use rand::{rngs::StdRng, SeedableRng};

    struct FakeMesh {
        id: NodeId,
        peers: Vec<NodeId>,
        time: Duration,
    }

    impl FakeMesh {
        fn new(id: u32, peers: &[u32]) -> Self {
            Self {
                id: NodeId(id),
                peers: peers.iter().copied().map(NodeId).collect(),
                time: Duration::ZERO,
            }
        }
    }

    impl MeshView for FakeMesh {
        fn node_id(&self) -> NodeId {
            self.id
        }
        fn logical_time(&self) -> Duration {
            self.time
        }
        fn peers(&self) -> Vec<NodeId> {
            self.peers.clone()
        }
        fn stability(&self) -> u32 {
            50
        }
    }

    fn node(role: NodeRole) -> SwarmNode<StdRng> {
        SwarmNode::new(NodeSettings::new(role), StdRng::seed_from_u64(42)).unwrap()
    }

    fn received(text: &str) -> Event {
        Event::Received {
            from: NodeId(1373),
            text: text.to_string(),
        }
    }

    fn broadcasts(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Broadcast(m) => Some(m.to_string()),
                _ => None,
            })
            .collect()
    }

    fn armed(effects: &[Effect], timer: Timer) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::Arm(t, d) if *t == timer => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn controller_sequence_end_to_end() {
        let mesh = FakeMesh::new(6429, &[1373, 8417]);
        let mut controller = node(NodeRole::Controller);
        controller.start(&mesh);
        assert_eq!(controller.router(), RouterState::default());

        let out = controller.handle(Event::AdvancePressed, &mesh);
        assert_eq!(broadcasts(&out), vec!["/01-question.mp3"]);
        assert_eq!(controller.router().mode, PlaybackMode::Question);
        assert_eq!(controller.router().question, 1);

        let out = controller.handle(received("eof_mp3:"), &mesh);
        assert_eq!(broadcasts(&out), vec!["/01-answer.mp3"]);
        assert_eq!(controller.router().mode, PlaybackMode::Answer);

        let out = controller.handle(received("eof_mp3:"), &mesh);
        assert!(broadcasts(&out).is_empty());
        assert_eq!(controller.router().mode, PlaybackMode::Answer);
    }

    #[test]
    fn start_arms_timers_by_role() {
        let mesh = FakeMesh::new(1, &[]);

        let out = node(NodeRole::Controller).start(&mesh);
        assert_eq!(armed(&out, Timer::Blink), Some(Duration::from_millis(5000)));
        assert!(armed(&out, Timer::Status).is_some());
        assert_eq!(armed(&out, Timer::ChaosSample), Some(Duration::from_millis(400)));

        let out = node(NodeRole::Player).start(&mesh);
        assert!(armed(&out, Timer::ChaosSample).is_none());
    }

    #[test]
    fn player_plays_paths_and_reports_completion() {
        let mesh = FakeMesh::new(1373, &[6429]);
        let mut player = node(NodeRole::Player);

        let out = player.handle(received("/04-question.mp3"), &mesh);
        assert!(out.contains(&Effect::Play("/04-question.mp3".into())));

        let out = player.handle(Event::PlaybackFinished, &mesh);
        assert_eq!(broadcasts(&out), vec!["eof_mp3:"]);
    }

    #[test]
    fn player_does_not_sequence() {
        let mesh = FakeMesh::new(1373, &[6429]);
        let mut player = node(NodeRole::Player);

        assert!(broadcasts(&player.handle(Event::AdvancePressed, &mesh)).is_empty());
        assert!(broadcasts(&player.handle(received("eof_mp3:"), &mesh)).is_empty());
        assert_eq!(player.router(), RouterState::default());
    }

    #[test]
    fn controller_without_audio_ignores_paths() {
        let mesh = FakeMesh::new(6429, &[]);
        let mut controller = node(NodeRole::Controller);
        let out = controller.handle(received("/01-question.mp3"), &mesh);
        assert!(!out.iter().any(|e| matches!(e, Effect::Play(_))));

        let mut speaking = SwarmNode::new(
            NodeSettings::new(NodeRole::Controller).with_audio(true),
            StdRng::seed_from_u64(1),
        )
        .unwrap();
        let out = speaking.handle(received("/01-question.mp3"), &mesh);
        assert!(out.contains(&Effect::Play("/01-question.mp3".into())));
    }

    #[test]
    fn knob_is_sampled_on_cadence() {
        let mesh = FakeMesh::new(6429, &[]);
        let mut controller = node(NodeRole::Controller);

        // Readings alone never broadcast.
        assert!(controller.handle(Event::ChaosInput(3200), &mesh).is_empty());
        assert_eq!(controller.chaos_level(), ChaosLevel::CALM);

        let out = controller.handle(Event::Timer(Timer::ChaosSample), &mesh);
        assert_eq!(broadcasts(&out), vec!["chaos:3"]);
        assert_eq!(armed(&out, Timer::ChaosSample), Some(Duration::from_millis(400)));

        let out = controller.handle(Event::Timer(Timer::ChaosSample), &mesh);
        assert!(broadcasts(&out).is_empty());
    }

    #[test]
    fn repeated_chaos_update_has_no_extra_effects() {
        let mesh = FakeMesh::new(1373, &[6429]);
        let mut player = node(NodeRole::Player);

        player.handle(received("chaos:3"), &mesh);
        let out = player.handle(received("chaos:3"), &mesh);
        assert_eq!(player.chaos_level().value(), 3);
        assert!(out.iter().all(|e| matches!(e, Effect::Seek(_))));
    }

    #[test]
    fn out_of_range_chaos_is_clamped() {
        let mesh = FakeMesh::new(1373, &[]);
        let mut player = node(NodeRole::Player);
        player.handle(received("chaos:9"), &mesh);
        assert_eq!(player.chaos_level().value(), 4);
        player.handle(received("chaos:-3"), &mesh);
        assert_eq!(player.chaos_level().value(), 0);
    }

    #[test]
    fn glitch_uses_local_chaos() {
        let mesh = FakeMesh::new(1373, &[]);
        let mut calm = node(NodeRole::Player);
        let out = calm.handle(received("glitch"), &mesh);
        assert!(out.is_empty());

        let mut wild = node(NodeRole::Player);
        wild.handle(received("chaos:4"), &mesh);
        let offsets: Vec<i32> = (0..200)
            .flat_map(|_| wild.handle(received("glitch"), &mesh))
            .filter_map(|e| match e {
                Effect::SetTimeOffset(o) => Some(o),
                _ => None,
            })
            .collect();
        assert!(!offsets.is_empty());
        assert!(offsets.iter().all(|o| (-1..=2).contains(o)));
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let mesh = FakeMesh::new(1373, &[]);
        let mut player = node(NodeRole::Player);
        assert!(player.handle(received("hello mesh"), &mesh).is_empty());
    }

    #[test]
    fn membership_change_restarts_blink_and_latches_measurement() {
        let mut mesh = FakeMesh::new(6429, &[1, 2]);
        let mut controller = node(NodeRole::Controller);
        controller.start(&mesh);
        controller.handle(Event::Timer(Timer::Blink), &mesh);
        assert!(controller.blink().is_on());

        mesh.peers.push(NodeId(3));
        mesh.time = Duration::from_millis(12_300);
        let out = controller.handle(Event::ConnectionsChanged, &mesh);

        assert!(out.contains(&Effect::StatusLed(false)));
        assert_eq!(armed(&out, Timer::Blink), Some(Duration::from_millis(2700)));
        assert_eq!(controller.blink().schedule().iterations_remaining, 8);
        assert!(controller.status().measurement_pending());

        let out = controller.handle(Event::Timer(Timer::Status), &mesh);
        let measured: Vec<NodeId> = out
            .iter()
            .filter_map(|e| match e {
                Effect::MeasureDelay(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(measured, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert!(broadcasts(&out)[0].starts_with("Status from node 6429"));

        let out = controller.handle(Event::Timer(Timer::Status), &mesh);
        assert!(!out.iter().any(|e| matches!(e, Effect::MeasureDelay(_))));
    }

    #[test]
    fn peer_joined_restarts_blink_without_latch() {
        let mesh = FakeMesh::new(1373, &[6429]);
        let mut player = node(NodeRole::Player);
        player.start(&mesh);

        let out = player.handle(Event::PeerJoined(NodeId(6429)), &mesh);
        assert!(out.contains(&Effect::StatusLed(false)));
        assert!(armed(&out, Timer::Blink).is_some());
        assert!(!player.status().measurement_pending());
    }

    #[test]
    fn status_button_glitches_swarm_above_one() {
        let mesh = FakeMesh::new(6429, &[]);
        let mut controller = node(NodeRole::Controller);
        assert!(broadcasts(&controller.handle(Event::StatusRequested, &mesh)).is_empty());

        controller.handle(received("chaos:2"), &mesh);
        assert_eq!(
            broadcasts(&controller.handle(Event::StatusRequested, &mesh)),
            vec!["glitch"]
        );
    }

    #[test]
    fn blink_ticks_drive_led_and_rearm() {
        let mesh = FakeMesh::new(1373, &[]);
        let mut player = node(NodeRole::Player);
        player.start(&mesh);

        let out = player.handle(Event::Timer(Timer::Blink), &mesh);
        assert_eq!(out.first(), Some(&Effect::StatusLed(true)));
        assert_eq!(armed(&out, Timer::Blink), Some(Duration::from_millis(175)));
    }

    #[test]
    fn calm_blink_never_glitches() {
        let mesh = FakeMesh::new(1373, &[]);
        let mut player = node(NodeRole::Player);
        player.start(&mesh);
        for _ in 0..100 {
            let out = player.handle(Event::Timer(Timer::Blink), &mesh);
            assert!(!out.iter().any(|e| matches!(e, Effect::SetTimeOffset(_))));
        }
    }

    #[test]
    fn zero_sample_interval_is_rejected() {
        let settings = NodeSettings::new(NodeRole::Controller).with_chaos_sample_interval(Duration::ZERO);
        assert!(matches!(
            SwarmNode::new(settings, StdRng::seed_from_u64(0)),
            Err(Error::InvalidSampleInterval)
        ));
    }
}
