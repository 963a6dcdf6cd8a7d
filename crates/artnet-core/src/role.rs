//! Node roles.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The part a node plays in the installation.
///
/// Assigned once at startup from configuration and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NodeRole {
    /// Drives the question/answer sequence and samples the chaos knob.
    Controller,
    /// Plays whatever path the controller requests and reports completion.
    Player,
}

impl NodeRole {
    /// Whether this node owns the playback state machine.
    pub const fn is_controller(&self) -> bool {
        matches!(self, Self::Controller)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Player => write!(f, "player"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(Self::Controller),
            "player" => Ok(Self::Player),
            other => Err(Error::UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_text() {
        for role in [NodeRole::Controller, NodeRole::Player] {
            assert_eq!(role.to_string().parse::<NodeRole>().unwrap(), role);
        }
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(" Controller ".parse::<NodeRole>().unwrap(), NodeRole::Controller);
        assert!("speaker".parse::<NodeRole>().is_err());
    }
}
