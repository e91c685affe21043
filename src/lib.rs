//! voxlive - Realtime voice conversation client core
//!
//! Microphone capture streamed to a remote conversational agent, with
//! live transcripts and gapless playback of the agent's speech.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod codec;
pub mod config;
pub mod conversation;
pub mod defaults;
pub mod error;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod transport;

// Device seams (source → session → sink)
pub use audio::{AudioOutput, AudioSource, CpalDeviceFactory, DeviceFactory, PlaybackId};

// Session lifecycle
pub use conversation::Conversation;
pub use session::{Session, SessionHandle, SessionState};

// Transcript presentation
pub use transcript::{Speaker, TranscriptItem};

// Wire types
pub use codec::{AudioBuffer, EncodedChunk};
pub use transport::{RemoteConnector, RemoteSession, ServerEvent, SetupConfig, WsConnector};

// Error handling
pub use error::{Result, VoxliveError};

// Config
pub use config::Config;
