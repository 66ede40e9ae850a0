//! Control-message codec
//!
//! JSON messages multiplexed with audio on the session transport. Binary
//! frames are Opus packets; text frames parse into [`ClientMessage`] and
//! serialise from [`ServerMessage`].

use serde::{Deserialize, Serialize};

/// Push-to-talk / wakeword phase carried by `listen` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// How the session decides when an utterance ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// VAD decides; `listen stop` is ignored
    Auto,
    /// Push-to-talk; VAD speech-end is ignored
    Manual,
    /// Audio ignored until a wakeword `detect` arrives
    Wakeword,
}

/// Boundary markers the server emits around synthesised audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

/// Messages from the client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "listen")]
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        /// Recognised wakeword text for `state = detect`
        #[serde(default)]
        text: Option<String>,
    },
    /// Barge-in: cancel the current reply immediately
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "iot")]
    Iot {
        #[serde(default)]
        descriptors: Option<serde_json::Value>,
        #[serde(default)]
        states: Option<serde_json::Value>,
    },
}

/// Messages to the client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "device-id")]
        device_id: String,
        session_id: String,
    },
    #[serde(rename = "stt")]
    Stt { text: String, session_id: String },
    #[serde(rename = "llm")]
    Llm {
        text: String,
        emotion: String,
        session_id: String,
    },
    #[serde(rename = "tts")]
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        session_id: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// `tts` marker without text (start / stop)
    pub fn tts(state: TtsState, session_id: &str) -> Self {
        Self::Tts { state, text: None, session_id: session_id.to_string() }
    }

    /// `tts` marker carrying the sentence text
    pub fn tts_sentence(state: TtsState, text: &str, session_id: &str) -> Self {
        Self::Tts {
            state,
            text: Some(text.to_string()),
            session_id: session_id.to_string(),
        }
    }
}

/// Strip punctuation and emoji before echoing a transcript to the client
pub fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}
