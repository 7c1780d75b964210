//! Error types for the wakenode front end

use thiserror::Error;

/// Result type alias for wakenode operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice front end
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error (fatal to the owning loop)
    #[error("audio error: {0}")]
    Audio(String),

    /// A single frame could not be read; the capture loop may continue
    #[error("audio read error: {0}")]
    AudioRead(String),

    /// Wake word or VAD model error
    #[error("model error: {0}")]
    Model(String),

    /// Command or mute channel failure
    #[error("channel error: {0}")]
    Channel(String),

    /// Malformed message on a wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer discovery error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the capture loop may keep running after this error
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::AudioRead(_) | Self::Model(_))
    }
}
