//! Provider interfaces
//!
//! ASR, LLM, and TTS sit behind one narrow trait each. Providers never see
//! sessions — they get audio, messages, or text plus a session id string.
//! Failures surface as [`ProviderError`] and degrade to empty/canned output
//! at the call site; they never kill a session.

pub mod asr;
pub mod llm;
pub mod tts;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::AudioChunk;
use crate::config::Config;
use crate::error::ProviderError;

/// One turn of conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Result of a function-calling LLM turn
#[derive(Debug, Clone)]
pub enum LlmOutcome {
    /// Ordinary text reply
    Text(String),
    /// The model asked for a registered function
    FunctionCall {
        name: String,
        arguments: serde_json::Value,
    },
}

/// Speech to text
#[async_trait]
pub trait AsrProvider: Send + Sync {
    /// Transcribe one utterance. An empty string means "heard nothing".
    async fn recognize(
        &self,
        chunks: &[AudioChunk],
        session_id: &str,
    ) -> Result<String, ProviderError>;
}

/// Text to reply text
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a plain reply; each delta goes out on `tx` as produced.
    /// Returns the full reply text once the stream ends.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<String, ProviderError>;

    /// One non-streamed turn with function schemas attached
    async fn chat_with_functions(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<LlmOutcome, ProviderError>;
}

/// Text to Opus frames
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesise one sentence segment. Returns 20 ms Opus frames and the
    /// audio duration in seconds.
    async fn synthesize(&self, text: &str, voice: &str)
        -> Result<(Vec<Bytes>, f64), ProviderError>;
}

/// The provider set a session pipeline runs against
#[derive(Clone)]
pub struct Providers {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

impl Providers {
    /// Build the configured HTTP adapters behind a shared reqwest client
    pub fn from_config(config: &Config) -> Self {
        let client = reqwest::Client::new();
        Self {
            asr: Arc::new(asr::HttpAsr::new(config.active_asr().clone(), client.clone())),
            llm: Arc::new(llm::HttpLlm::new(config.active_llm().clone(), client.clone())),
            tts: Arc::new(tts::HttpTts::new(config.active_tts().clone(), client)),
        }
    }
}
