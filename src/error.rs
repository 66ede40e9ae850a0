//! Error taxonomy for the dialogue server
//!
//! Every task catches at its own boundary and converts failures into one of
//! these categories. Transport errors are fatal for the session; media errors
//! drop the offending frame; provider errors degrade to empty/canned output.

use thiserror::Error;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying connection is gone. Terminal for the session.
    #[error("transport closed")]
    Closed,
    /// A message violated the control protocol. The session survives;
    /// the client gets an `error` control message.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Per-frame media failures. Log and drop the frame; the session continues.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    #[error("resample failed: {0}")]
    ResampleFailed(String),
}

/// Provider (ASR/LLM/TTS) failures
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider timed out after {0} ms")]
    Timeout(u64),
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// State-machine violations. These indicate a bug; the session is reset
/// to Idle after logging.
#[derive(Debug, Error)]
#[error("illegal transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: &'static str,
    pub to: &'static str,
}

/// Configuration failures. Fail fast at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
