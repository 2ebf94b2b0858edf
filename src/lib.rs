//! Kaiwa - Real-Time Voice Conversation Server
//!
//! A WebRTC voice server for spoken language practice:
//! - Energy-based utterance detection over the inbound audio track
//! - Transcription, LLM reply and speech synthesis per turn
//! - Real-time paced playback on the returned audio track
//! - Status/transcript/pingpong signalling over data channels
//!
//! # Example
//!
//! ```ignore
//! use kaiwa::server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     server::start("127.0.0.1", 8080, None, None).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod activity;
pub mod audio;
pub mod error;
pub mod sync;
pub mod track;
pub mod types;

pub mod config;
pub mod detector;
pub mod player;
pub mod services;
pub mod session;
pub mod signal;
pub mod storage;

pub mod cli;
pub mod server;

// Re-export commonly used types for convenience
pub use audio::AudioFrame;
pub use config::Config;
pub use detector::{ListeningConfig, UtteranceDetector};
pub use error::{SessionError, SessionResult};
pub use player::ResponsePlayer;
pub use session::Chatter;
pub use types::{Character, Message, Role, Transcript, Voice};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Real-Time Voice Conversation Server", NAME, VERSION)
}
