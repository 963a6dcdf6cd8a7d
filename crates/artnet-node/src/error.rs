//! Error types for the node runtime.

use thiserror::Error;

/// Result type for node runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running a node.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid node settings
    #[error("Core error: {0}")]
    Core(#[from] artnet_core::Error),

    /// Bad environment configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Frame encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
