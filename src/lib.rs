//! Parley - Spoken Dialogue Assistant Server
//!
//! The server half of a voice assistant:
//! - WebSocket and WebRTC transports for client audio (Opus, 16 kHz, 20 ms)
//! - Silero VAD gating into per-session utterance buffers
//! - ASR -> LLM -> TTS provider pipeline with sentence-level streaming
//! - Real-time play-out pacing with barge-in
//! - Role persona store with a CRUD sidecar API
//!
//! # Example
//!
//! ```ignore
//! use parley::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(std::path::Path::new("config.toml"))?;
//!     parley::server::start(config).await
//! }
//! ```

pub mod audio;
pub mod cli;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod intent;
pub mod pipeline;
pub mod protocol;
pub mod providers;
pub mod roles;
pub mod server;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod vad;

// Re-export the types most callers touch
pub use config::Config;
pub use protocol::{ClientMessage, ListenMode, ServerMessage, TtsState};
pub use session::{Session, SessionState};
pub use transport::Transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
