//! Error types for voxlive.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxliveError {
    // Configuration errors
    #[error("Unknown language persona: {key}")]
    UnknownPersona { key: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Device errors
    #[error("Microphone access denied or unavailable: {message}")]
    DeviceAccess { message: String },

    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio playback failed: {message}")]
    AudioPlayback { message: String },

    // Remote stream errors
    #[error("Failed to connect to remote service: {message}")]
    Connect { message: String },

    #[error("Remote service error: {message}")]
    Remote { message: String },

    #[error("Connection closed.")]
    RemoteClosed,

    // Inbound payload errors
    #[error("Malformed audio payload: {message}")]
    MalformedAudio { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxliveError>;
