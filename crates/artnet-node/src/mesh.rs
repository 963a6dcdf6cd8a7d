//! Mesh transports.
//!
//! The core only needs to flood text, learn about peers, read a shared
//! clock and ask for delay measurements. Two transports provide that:
//!
//! - [`LoopbackSwarm`]: an in-process hub for simulations and tests. Floods
//!   go through a `tokio::sync::broadcast` channel; each member drops a
//!   configurable fraction of them to mimic a lossy radio mesh.
//! - [`UdpMesh`]: a LAN transport. Every node floods JSON frames to the
//!   broadcast address, learns peers from what it hears and forgets peers
//!   that fall silent. The logical clock is wall-clock time, which is close
//!   enough on an NTP-synced network to keep blink grids aligned.
//!
//! Inbound traffic and membership changes are delivered as [`Event`]s on the
//! node's event channel, so the runtime sees them in the same serialized
//! stream as its timers and buttons.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use artnet_core::{Event, MeshView, NodeId};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::UdpMeshConfig;
use crate::error::Result;

/// Full-scale stability value.
pub const MAX_STABILITY: u32 = 1000;

/// Outbound side of a mesh, on top of the facts [`MeshView`] exposes.
pub trait MeshLink: MeshView {
    /// Flood `text` to every peer. Best effort.
    fn broadcast(&self, text: &str);

    /// Start a round-trip measurement; the result arrives later as
    /// [`Event::DelayMeasured`].
    fn measure_delay(&self, peer: NodeId);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Loopback swarm
// ============================================================================

#[derive(Debug, Clone)]
struct Flood {
    from: NodeId,
    text: String,
}

struct SwarmInner {
    flood_tx: broadcast::Sender<Flood>,
    members: Mutex<BTreeMap<NodeId, mpsc::UnboundedSender<Event>>>,
    epoch: Instant,
    loss: f64,
}

/// In-process hub connecting any number of [`LoopbackMesh`] members.
#[derive(Clone)]
pub struct LoopbackSwarm {
    inner: Arc<SwarmInner>,
}

impl Default for LoopbackSwarm {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSwarm {
    /// A lossless swarm.
    pub fn new() -> Self {
        Self::with_loss(0.0)
    }

    /// A swarm where each delivery is dropped with probability `loss`.
    pub fn with_loss(loss: f64) -> Self {
        let (flood_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(SwarmInner {
                flood_tx,
                members: Mutex::new(BTreeMap::new()),
                epoch: Instant::now(),
                loss: loss.clamp(0.0, 1.0),
            }),
        }
    }

    /// Current members, in id order.
    pub fn members(&self) -> Vec<NodeId> {
        lock(&self.inner.members).keys().copied().collect()
    }

    /// Add a member whose inbound events go to `events`.
    ///
    /// Existing members see the newcomer as a new connection; everyone sees
    /// a membership change. Must be called inside a tokio runtime.
    pub fn join(&self, id: NodeId, events: mpsc::UnboundedSender<Event>) -> LoopbackMesh {
        let mut flood_rx = self.inner.flood_tx.subscribe();
        let forward_tx = events.clone();
        let loss = self.inner.loss;

        let forwarder = tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            loop {
                match flood_rx.recv().await {
                    Ok(flood) if flood.from == id => {}
                    Ok(flood) => {
                        if loss > 0.0 && rng.gen_bool(loss) {
                            trace!(to = %id, from = %flood.from, "Dropped flood");
                            continue;
                        }
                        let event = Event::Received {
                            from: flood.from,
                            text: flood.text,
                        };
                        if forward_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(node = %id, missed, "Member lagged behind the swarm");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        {
            let mut members = lock(&self.inner.members);
            for tx in members.values() {
                let _ = tx.send(Event::PeerJoined(id));
                let _ = tx.send(Event::ConnectionsChanged);
            }
            if !members.is_empty() {
                let _ = events.send(Event::ConnectionsChanged);
            }
            members.insert(id, events);
        }
        info!(node = %id, "Joined loopback swarm");

        LoopbackMesh {
            id,
            swarm: self.clone(),
            forwarder,
        }
    }

    fn leave(&self, id: NodeId) {
        let mut members = lock(&self.inner.members);
        if members.remove(&id).is_some() {
            for tx in members.values() {
                let _ = tx.send(Event::ConnectionsChanged);
            }
            info!(node = %id, "Left loopback swarm");
        }
    }
}

/// One member's handle on a [`LoopbackSwarm`]. Leaves the swarm on drop.
pub struct LoopbackMesh {
    id: NodeId,
    swarm: LoopbackSwarm,
    forwarder: JoinHandle<()>,
}

impl MeshView for LoopbackMesh {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn logical_time(&self) -> Duration {
        self.swarm.inner.epoch.elapsed()
    }

    fn peers(&self) -> Vec<NodeId> {
        lock(&self.swarm.inner.members)
            .keys()
            .copied()
            .filter(|peer| *peer != self.id)
            .collect()
    }

    fn stability(&self) -> u32 {
        ((1.0 - self.swarm.inner.loss) * f64::from(MAX_STABILITY)) as u32
    }
}

impl MeshLink for LoopbackMesh {
    fn broadcast(&self, text: &str) {
        trace!(from = %self.id, msg = text, "Flood");
        // No receivers just means nobody else has joined yet.
        let _ = self.swarm.inner.flood_tx.send(Flood {
            from: self.id,
            text: text.to_string(),
        });
    }

    fn measure_delay(&self, peer: NodeId) {
        let members = lock(&self.swarm.inner.members);
        if members.contains_key(&peer) {
            if let Some(tx) = members.get(&self.id) {
                let _ = tx.send(Event::DelayMeasured {
                    peer,
                    delay: Duration::ZERO,
                });
            }
        } else {
            debug!(peer = %peer, "Delay measurement to unknown peer");
        }
    }
}

impl Drop for LoopbackMesh {
    fn drop(&mut self) {
        self.forwarder.abort();
        self.swarm.leave(self.id);
    }
}

// ============================================================================
// UDP mesh
// ============================================================================

/// Wire frame for the UDP mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    /// Presence announcement.
    Hello { from: NodeId },
    /// A flood carrying one broadcast message.
    Broadcast { from: NodeId, text: String },
    /// Round-trip probe; `sent_us` is on the sender's local clock.
    Ping { from: NodeId, to: NodeId, sent_us: u64 },
    /// Echo of a ping.
    Pong { from: NodeId, to: NodeId, sent_us: u64 },
}

impl Frame {
    fn sender(&self) -> NodeId {
        match self {
            Frame::Hello { from }
            | Frame::Broadcast { from, .. }
            | Frame::Ping { from, .. }
            | Frame::Pong { from, .. } => *from,
        }
    }
}

/// First pause after a failed receive; doubles per consecutive failure.
const RECV_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next receive after `failures` consecutive errors.
fn recv_backoff(failures: u32) -> Duration {
    match failures {
        0 => Duration::ZERO,
        n => RECV_BACKOFF_MIN
            .saturating_mul(1 << (n - 1).min(16))
            .min(RECV_BACKOFF_MAX),
    }
}

struct UdpShared {
    config: UdpMeshConfig,
    socket: UdpSocket,
    peers: Mutex<HashMap<NodeId, Instant>>,
    started: Instant,
    events: mpsc::UnboundedSender<Event>,
    /// Encoded frames waiting for the sender task.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl UdpShared {
    fn local_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    fn send(&self, frame: &Frame) {
        let bytes = match serde_json::to_vec(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                return;
            }
        };
        if self.outbound.send(bytes).is_err() {
            debug!("Mesh sender stopped, dropping frame");
        }
    }

    /// Record that `peer` was heard. Returns true if it is new.
    fn touch(&self, peer: NodeId) -> bool {
        lock(&self.peers).insert(peer, Instant::now()).is_none()
    }

    /// Forget silent peers. Returns how many were dropped.
    fn expire(&self) -> usize {
        let timeout = self.config.peer_timeout;
        let mut peers = lock(&self.peers);
        let before = peers.len();
        peers.retain(|_, seen| seen.elapsed() < timeout);
        before - peers.len()
    }

    fn handle_frame(&self, frame: Frame) {
        let from = frame.sender();
        if from == self.config.node_id {
            return;
        }

        if self.touch(from) {
            info!(peer = %from, "New connection");
            let _ = self.events.send(Event::PeerJoined(from));
            let _ = self.events.send(Event::ConnectionsChanged);
        }

        match frame {
            Frame::Hello { .. } => {}
            Frame::Broadcast { from, text } => {
                let _ = self.events.send(Event::Received { from, text });
            }
            Frame::Ping { from, to, sent_us } if to == self.config.node_id => {
                self.send(&Frame::Pong {
                    from: self.config.node_id,
                    to: from,
                    sent_us,
                });
            }
            Frame::Pong { from, to, sent_us } if to == self.config.node_id => {
                let rtt = self.local_us().saturating_sub(sent_us);
                let _ = self.events.send(Event::DelayMeasured {
                    peer: from,
                    delay: Duration::from_micros(rtt / 2),
                });
            }
            Frame::Ping { .. } | Frame::Pong { .. } => {}
        }
    }
}

/// LAN mesh over UDP broadcast.
pub struct UdpMesh {
    shared: Arc<UdpShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpMesh {
    /// Bind the mesh socket and start listening and announcing.
    pub async fn bind(config: UdpMeshConfig, events: mpsc::UnboundedSender<Event>) -> Result<Self> {
        let socket = bind_broadcast_socket(config.bind)?;
        info!(
            node = %config.node_id,
            bind = %config.bind,
            broadcast = %config.broadcast,
            "UDP mesh bound"
        );

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let shared = Arc::new(UdpShared {
            config,
            socket,
            peers: Mutex::new(HashMap::new()),
            started: Instant::now(),
            events,
            outbound,
        });

        // Sends wait for writability, so frames queued right after bind go out.
        let sender = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let dest = shared.config.broadcast;
                while let Some(bytes) = outbound_rx.recv().await {
                    if let Err(e) = shared.socket.send_to(&bytes, dest).await {
                        warn!(dest = %dest, "Dropped outbound frame: {}", e);
                    }
                }
            })
        };

        let receiver = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let mut failures = 0u32;
                loop {
                    match shared.socket.recv_from(&mut buf).await {
                        Ok((len, src)) => {
                            failures = 0;
                            match serde_json::from_slice::<Frame>(&buf[..len]) {
                                Ok(frame) => shared.handle_frame(frame),
                                Err(e) => warn!(src = %src, "Ignoring malformed frame: {}", e),
                            }
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            let pause = recv_backoff(failures);
                            warn!(failures, pause_ms = pause.as_millis() as u64, "Mesh receive error: {}", e);
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
            })
        };

        let announcer = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(shared.config.hello_interval);
                loop {
                    ticker.tick().await;
                    shared.send(&Frame::Hello {
                        from: shared.config.node_id,
                    });
                    let dropped = shared.expire();
                    if dropped > 0 {
                        info!(dropped, "Peers timed out");
                        let _ = shared.events.send(Event::ConnectionsChanged);
                    }
                }
            })
        };

        Ok(Self {
            shared,
            tasks: vec![sender, receiver, announcer],
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }
}

impl MeshView for UdpMesh {
    fn node_id(&self) -> NodeId {
        self.shared.config.node_id
    }

    fn logical_time(&self) -> Duration {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
    }

    fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = lock(&self.shared.peers).keys().copied().collect();
        peers.sort();
        peers
    }

    /// Mean freshness of the peer table, 0 (silent) to 1000 (just heard).
    fn stability(&self) -> u32 {
        let timeout = self.shared.config.peer_timeout.as_secs_f64();
        let peers = lock(&self.shared.peers);
        if peers.is_empty() || timeout <= 0.0 {
            return 0;
        }
        let freshness: f64 = peers
            .values()
            .map(|seen| (1.0 - seen.elapsed().as_secs_f64() / timeout).max(0.0))
            .sum();
        (freshness / peers.len() as f64 * f64::from(MAX_STABILITY)) as u32
    }
}

impl MeshLink for UdpMesh {
    fn broadcast(&self, text: &str) {
        self.shared.send(&Frame::Broadcast {
            from: self.shared.config.node_id,
            text: text.to_string(),
        });
    }

    fn measure_delay(&self, peer: NodeId) {
        self.shared.send(&Frame::Ping {
            from: self.shared.config.node_id,
            to: peer,
            sent_us: self.shared.local_us(),
        });
    }
}

impl Drop for UdpMesh {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn bind_broadcast_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_received(rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<(NodeId, String)> {
        loop {
            match timeout(WAIT, rx.recv()).await.ok()?? {
                Event::Received { from, text } => return Some((from, text)),
                _ => continue,
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn loopback_floods_reach_everyone_but_sender() {
        let swarm = LoopbackSwarm::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = swarm.join(NodeId(1), a_tx);
        let _b = swarm.join(NodeId(2), b_tx);

        a.broadcast("chaos:2");

        assert_eq!(next_received(&mut b_rx).await, Some((NodeId(1), "chaos:2".to_string())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain(&mut a_rx).iter().any(|e| matches!(e, Event::Received { .. })));
    }

    #[tokio::test]
    async fn loopback_membership_events() {
        let swarm = LoopbackSwarm::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = swarm.join(NodeId(1), a_tx);
        assert!(a.peers().is_empty());

        let b = swarm.join(NodeId(2), b_tx);
        assert_eq!(a.peers(), vec![NodeId(2)]);
        assert_eq!(b.peers(), vec![NodeId(1)]);
        assert_eq!(drain(&mut a_rx), vec![Event::PeerJoined(NodeId(2)), Event::ConnectionsChanged]);
        assert_eq!(drain(&mut b_rx), vec![Event::ConnectionsChanged]);

        drop(b);
        assert_eq!(swarm.members(), vec![NodeId(1)]);
        assert_eq!(drain(&mut a_rx), vec![Event::ConnectionsChanged]);
    }

    #[tokio::test]
    async fn total_loss_delivers_nothing() {
        let swarm = LoopbackSwarm::with_loss(1.0);
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = swarm.join(NodeId(1), a_tx);
        let _b = swarm.join(NodeId(2), b_tx);

        for _ in 0..10 {
            a.broadcast("glitch");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain(&mut b_rx).iter().any(|e| matches!(e, Event::Received { .. })));
        assert_eq!(a.stability(), 0);
    }

    #[tokio::test]
    async fn loopback_delay_measurement() {
        let swarm = LoopbackSwarm::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let a = swarm.join(NodeId(1), a_tx);
        let _b = swarm.join(NodeId(2), b_tx);
        drain(&mut a_rx);

        a.measure_delay(NodeId(2));
        a.measure_delay(NodeId(99));
        assert_eq!(
            drain(&mut a_rx),
            vec![Event::DelayMeasured {
                peer: NodeId(2),
                delay: Duration::ZERO
            }]
        );
    }

    #[test]
    fn frames_are_tagged_json() {
        let frame = Frame::Broadcast {
            from: NodeId(7),
            text: "eof_mp3:".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"broadcast","from":7,"text":"eof_mp3:"}"#);
        assert_eq!(serde_json::from_str::<Frame>(&json).unwrap(), frame);
        assert_eq!(frame.sender(), NodeId(7));
    }

    fn local_config(id: u32, broadcast: SocketAddr) -> UdpMeshConfig {
        UdpMeshConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            broadcast,
            ..UdpMeshConfig::new(NodeId(id))
        }
    }

    #[tokio::test]
    async fn udp_mesh_learns_peers_and_delivers() {
        // Point A at B's socket and B at A's: unicast stands in for broadcast.
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let placeholder: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let b = UdpMesh::bind(local_config(2, placeholder), b_tx).await.unwrap();
        let a = UdpMesh::bind(local_config(1, b.local_addr().unwrap()), a_tx).await.unwrap();

        a.broadcast("/03-question.mp3");
        assert_eq!(
            next_received(&mut b_rx).await,
            Some((NodeId(1), "/03-question.mp3".to_string()))
        );
        assert_eq!(b.peers(), vec![NodeId(1)]);
        assert!(b.stability() > 0);
        assert!(a.peers().is_empty());
        drop(a);
        drain(&mut a_rx);
    }

    #[tokio::test]
    async fn udp_floods_right_after_bind_arrive_in_order() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let placeholder: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let b = UdpMesh::bind(local_config(2, placeholder), b_tx).await.unwrap();
        let a = UdpMesh::bind(local_config(1, b.local_addr().unwrap()), a_tx).await.unwrap();

        a.broadcast("immediate");
        a.broadcast("eof_mp3:");
        a.broadcast("later");

        for expected in ["immediate", "eof_mp3:", "later"] {
            assert_eq!(next_received(&mut b_rx).await, Some((NodeId(1), expected.to_string())));
        }
    }

    #[test]
    fn receive_backoff_grows_and_caps() {
        assert_eq!(recv_backoff(0), Duration::ZERO);
        assert_eq!(recv_backoff(1), Duration::from_millis(10));
        assert_eq!(recv_backoff(2), Duration::from_millis(20));
        assert_eq!(recv_backoff(5), Duration::from_millis(160));
        assert_eq!(recv_backoff(8), RECV_BACKOFF_MAX);
        assert_eq!(recv_backoff(u32::MAX), RECV_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn udp_ignores_own_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let placeholder: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mesh = UdpMesh::bind(local_config(5, placeholder), tx).await.unwrap();

        mesh.shared.handle_frame(Frame::Broadcast {
            from: NodeId(5),
            text: "glitch".into(),
        });
        assert!(drain(&mut rx).is_empty());
        assert!(mesh.peers().is_empty());
        assert_eq!(mesh.stability(), 0);
    }
}
