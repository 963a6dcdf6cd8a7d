//! Node configuration.
//!
//! Everything comes from `ARTNET_*` environment variables with sensible
//! defaults. Per-device identity comes from the board table: the chip id
//! (the 12-hex-digit efuse MAC) decides the role and whether a speaker is
//! attached and which local inputs are wired, unless the matching variables
//! override it.
//!
//! | Variable                   | Default                | Meaning                          |
//! |----------------------------|------------------------|----------------------------------|
//! | `ARTNET_CHIP_ID`           | –                      | board lookup and node id         |
//! | `ARTNET_NODE_ID`           | derived from chip id   | mesh node id                     |
//! | `ARTNET_ROLE`              | from board             | `controller` or `player`         |
//! | `ARTNET_HAS_AUDIO`         | from board             | `true` / `false`                 |
//! | `ARTNET_HAS_BUTTONS`       | from board, else role  | accept `next` / `status`         |
//! | `ARTNET_HAS_KNOB`          | from board, else role  | accept `knob <raw>`              |
//! | `ARTNET_MEDIA_DIR`         | `./media`              | root for requested paths         |
//! | `ARTNET_CLIP_SECS`         | `5`                    | length of every clip             |
//! | `ARTNET_BLINK_PERIOD_MS`   | `5000`                 | blink grid                       |
//! | `ARTNET_BLINK_PULSE_MS`    | `175`                  | flash length                     |
//! | `ARTNET_BLINK_GLITCH`      | `above:2`              | `always` or `above:<level>`      |
//! | `ARTNET_CHAOS_SAMPLE_MS`   | `400`                  | knob sampling cadence            |
//! | `ARTNET_STATUS_VARIANT`    | `default`              | `default` (3-5 s) or `relaxed` (3-6 s) |
//! | `ARTNET_STATUS_MIN_SECS`   | from variant           | heartbeat interval lower bound   |
//! | `ARTNET_STATUS_MAX_SECS`   | from variant           | heartbeat interval upper bound   |
//! | `ARTNET_BIND`              | `0.0.0.0:5555`         | mesh socket                      |
//! | `ARTNET_BROADCAST`         | `255.255.255.255:5555` | mesh broadcast destination       |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use artnet_core::{BlinkConfig, ChaosLevel, GlitchGate, NodeId, NodeRole, NodeSettings, StatusConfig, MESH_PORT};

use crate::error::{Error, Result};

/// A known board in the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardProfile {
    pub chip_id: &'static str,
    /// Last four digits of the mesh node id, as written on the enclosure.
    pub short_id: u16,
    pub role: NodeRole,
    pub has_audio: bool,
    pub has_buttons: bool,
    pub has_knob: bool,
}

/// Every board the installation knows about.
pub const BOARDS: &[BoardProfile] = &[
    // Controller: buttons and knob, no speaker.
    BoardProfile {
        chip_id: "cc7206bd9e7c",
        short_id: 6429,
        role: NodeRole::Controller,
        has_audio: false,
        has_buttons: true,
        has_knob: true,
    },
    // Breadboard line out.
    BoardProfile {
        chip_id: "8c6ce91f9c9c",
        short_id: 1373,
        role: NodeRole::Player,
        has_audio: true,
        has_buttons: false,
        has_knob: false,
    },
    // Line out.
    BoardProfile {
        chip_id: "e0e4cd09f0b8",
        short_id: 8417,
        role: NodeRole::Player,
        has_audio: true,
        has_buttons: false,
        has_knob: false,
    },
    // Amp, default question speaker.
    BoardProfile {
        chip_id: "3c7506bd9e7c",
        short_id: 7053,
        role: NodeRole::Player,
        has_audio: true,
        has_buttons: false,
        has_knob: false,
    },
    // Amp, default answer speaker.
    BoardProfile {
        chip_id: "f463e91f9c9c",
        short_id: 9173,
        role: NodeRole::Player,
        has_audio: true,
        has_buttons: false,
        has_knob: false,
    },
];

impl BoardProfile {
    /// Find a board by chip id (case-insensitive).
    pub fn lookup(chip_id: &str) -> Option<&'static BoardProfile> {
        BOARDS.iter().find(|b| b.chip_id.eq_ignore_ascii_case(chip_id))
    }
}

/// Mesh node id for a chip id.
///
/// The chip id is the efuse MAC printed as a little-endian 48-bit number;
/// the mesh id is the last four bytes of the station MAC, which is the base
/// MAC plus one.
pub fn mesh_node_id(chip_id: &str) -> Option<NodeId> {
    if chip_id.is_empty() || chip_id.len() > 12 {
        return None;
    }
    let mac = u64::from_str_radix(chip_id, 16).ok()?.to_le_bytes();
    let base = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
    Some(NodeId(base.wrapping_add(1)))
}

/// UDP mesh transport settings.
#[derive(Debug, Clone)]
pub struct UdpMeshConfig {
    pub node_id: NodeId,
    /// Local socket address.
    pub bind: SocketAddr,
    /// Where floods are sent.
    pub broadcast: SocketAddr,
    /// How often presence is announced.
    pub hello_interval: Duration,
    /// Silence after which a peer is dropped.
    pub peer_timeout: Duration,
}

impl UdpMeshConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            bind: SocketAddr::from(([0, 0, 0, 0], MESH_PORT)),
            broadcast: SocketAddr::from(([255, 255, 255, 255], MESH_PORT)),
            hello_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub chip_id: String,
    pub node_id: NodeId,
    pub role: NodeRole,
    pub has_audio: bool,
    /// Whether the `next` and `status` buttons are wired.
    pub has_buttons: bool,
    /// Whether the chaos knob is wired.
    pub has_knob: bool,
    pub media_dir: PathBuf,
    pub clip_length: Duration,
    pub blink: BlinkConfig,
    pub blink_glitch: GlitchGate,
    pub chaos_sample_interval: Duration,
    pub status: StatusConfig,
    pub mesh: UdpMeshConfig,
}

impl NodeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chip_id = var("ARTNET_CHIP_ID").unwrap_or_default().trim().to_ascii_lowercase();
        let board = BoardProfile::lookup(&chip_id);
        match board {
            Some(b) => tracing::info!(chip_id = %chip_id, board = b.short_id, "Matched board"),
            None => tracing::warn!(chip_id = %chip_id, "Unknown board, defaulting to player without audio"),
        }

        let node_id = match var("ARTNET_NODE_ID") {
            Some(raw) => NodeId(parse(&raw, "ARTNET_NODE_ID")?),
            None => mesh_node_id(&chip_id).ok_or_else(|| {
                Error::Config("set ARTNET_CHIP_ID to a 12-digit hex chip id or ARTNET_NODE_ID".into())
            })?,
        };

        let role = match var("ARTNET_ROLE") {
            Some(raw) => raw.parse::<NodeRole>()?,
            None => board.map_or(NodeRole::Player, |b| b.role),
        };

        let has_audio = match var("ARTNET_HAS_AUDIO") {
            Some(raw) => parse(&raw, "ARTNET_HAS_AUDIO")?,
            None => board.is_some_and(|b| b.has_audio),
        };

        let has_buttons = match var("ARTNET_HAS_BUTTONS") {
            Some(raw) => parse(&raw, "ARTNET_HAS_BUTTONS")?,
            None => board.map_or(role.is_controller(), |b| b.has_buttons),
        };

        let has_knob = match var("ARTNET_HAS_KNOB") {
            Some(raw) => parse(&raw, "ARTNET_HAS_KNOB")?,
            None => board.map_or(role.is_controller(), |b| b.has_knob),
        };

        let media_dir = PathBuf::from(var("ARTNET_MEDIA_DIR").unwrap_or_else(|| "./media".to_string()));

        let clip_secs: f64 = parse_or(&var, "ARTNET_CLIP_SECS", 5.0)?;
        let clip_length = Duration::try_from_secs_f64(clip_secs)
            .map_err(|e| Error::Config(format!("ARTNET_CLIP_SECS: {}", e)))?;

        let pulse = Duration::from_millis(parse_or(&var, "ARTNET_BLINK_PULSE_MS", 175)?);
        let blink = BlinkConfig {
            period: Duration::from_millis(parse_or(&var, "ARTNET_BLINK_PERIOD_MS", 5000)?),
            pulse_width: pulse,
            pulse_gap: pulse,
        };
        blink.validate()?;

        let blink_glitch = match var("ARTNET_BLINK_GLITCH") {
            Some(raw) => parse_glitch_gate(&raw)?,
            None => GlitchGate::default(),
        };

        let chaos_sample_interval = Duration::from_millis(parse_or(&var, "ARTNET_CHAOS_SAMPLE_MS", 400)?);
        if chaos_sample_interval.is_zero() {
            return Err(Error::Config("ARTNET_CHAOS_SAMPLE_MS must be non-zero".into()));
        }

        let variant = match var("ARTNET_STATUS_VARIANT").as_deref().map(str::trim) {
            None | Some("default") => StatusConfig::default(),
            Some("relaxed") => StatusConfig::relaxed(),
            Some(other) => {
                return Err(Error::Config(format!(
                    "invalid ARTNET_STATUS_VARIANT={:?}: expected default or relaxed",
                    other
                )))
            }
        };
        let status = StatusConfig {
            min_interval: match var("ARTNET_STATUS_MIN_SECS") {
                Some(raw) => Duration::from_secs(parse(&raw, "ARTNET_STATUS_MIN_SECS")?),
                None => variant.min_interval,
            },
            max_interval: match var("ARTNET_STATUS_MAX_SECS") {
                Some(raw) => Duration::from_secs(parse(&raw, "ARTNET_STATUS_MAX_SECS")?),
                None => variant.max_interval,
            },
        };
        status.validate()?;

        let mut mesh = UdpMeshConfig::new(node_id);
        if let Some(raw) = var("ARTNET_BIND") {
            mesh.bind = parse(&raw, "ARTNET_BIND")?;
        }
        if let Some(raw) = var("ARTNET_BROADCAST") {
            mesh.broadcast = parse(&raw, "ARTNET_BROADCAST")?;
        }

        Ok(Self {
            chip_id,
            node_id,
            role,
            has_audio,
            has_buttons,
            has_knob,
            media_dir,
            clip_length,
            blink,
            blink_glitch,
            chaos_sample_interval,
            status,
            mesh,
        })
    }

    /// Settings for the core node.
    pub fn settings(&self) -> NodeSettings {
        NodeSettings::new(self.role)
            .with_audio(self.has_audio)
            .with_blink(self.blink)
            .with_blink_glitch(self.blink_glitch)
            .with_chaos_sample_interval(self.chaos_sample_interval)
            .with_status(self.status)
    }
}

/// `always`, or `above:<level>` for glitching only past a chaos level.
fn parse_glitch_gate(raw: &str) -> Result<GlitchGate> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("always") {
        return Ok(GlitchGate::Always);
    }
    match raw.split_once(':') {
        Some((kind, level)) if kind.eq_ignore_ascii_case("above") => {
            let level: u8 = parse(level, "ARTNET_BLINK_GLITCH")?;
            Ok(GlitchGate::Above(ChaosLevel::new(i64::from(level))))
        }
        _ => Err(Error::Config(format!(
            "invalid ARTNET_BLINK_GLITCH={:?}: expected always or above:<level>",
            raw
        ))),
    }
}

fn parse<T: FromStr>(raw: &str, key: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", key, raw, e)))
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    var(key).map_or(Ok(default), |raw| parse(&raw, key))
}
