//! Configuration management
//!
//! One TOML file read at startup. Every key has a serde default so a missing
//! file yields a runnable local configuration; a malformed file fails fast.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// WebSocket server bind settings
    #[serde(default)]
    pub server: ServerConfig,
    /// WebRTC transport + signalling settings
    #[serde(default)]
    pub webrtc: WebrtcConfig,
    /// Which provider implementation fills each slot
    #[serde(default)]
    pub selected_module: SelectedModules,
    /// Per-provider ASR tables, keyed by module name
    #[serde(default = "default_asr_table")]
    pub asr: HashMap<String, AsrConfig>,
    /// Per-provider LLM tables, keyed by module name
    #[serde(default = "default_llm_table")]
    pub llm: HashMap<String, LlmConfig>,
    /// Per-provider TTS tables, keyed by module name
    #[serde(default = "default_tts_table")]
    pub tts: HashMap<String, TtsConfig>,
    /// VAD gate settings
    #[serde(default)]
    pub vad: VadSettings,
    /// Default system prompt applied to new sessions
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Utterances matching one of these close the session after the reply
    #[serde(default = "default_exit_commands")]
    pub exit_commands: Vec<String>,
    /// Recognised wakewords for `listen detect`
    #[serde(default = "default_wakeup_words")]
    pub wakeup_words: Vec<String>,
    /// Reply to a wakeword with a greeting (false = just acknowledge)
    #[serde(default = "default_true")]
    pub enable_greeting: bool,
    /// Play a chime after `tts stop`
    #[serde(default)]
    pub enable_stop_tts_notify: bool,
    /// WAV file for the stop chime
    #[serde(default = "default_stop_notify_voice")]
    pub stop_tts_notify_voice: String,
    /// Force-dispatch cap for a single utterance, in seconds
    #[serde(default = "default_max_utterance_seconds")]
    pub max_utterance_seconds: u64,
    /// Maximum dialogue turns kept per session (system prompt excluded)
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// Port for the role CRUD HTTP API
    #[serde(default = "default_role_api_port")]
    pub role_api_port: u16,
    /// Role table location
    #[serde(default = "default_roles_path")]
    pub roles_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { ip: default_ip(), port: default_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_webrtc_port")]
    pub port: u16,
    #[serde(default = "default_signaling_path")]
    pub signaling_path: String,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_webrtc_port(),
            signaling_path: default_signaling_path(),
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
        }
    }
}

/// TURN relay with credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedModules {
    #[serde(default = "default_asr_module")]
    pub asr: String,
    #[serde(default = "default_llm_module")]
    pub llm: String,
    #[serde(default = "default_tts_module")]
    pub tts: String,
    #[serde(default = "default_vad_module")]
    pub vad: String,
}

impl Default for SelectedModules {
    fn default() -> Self {
        Self {
            asr: default_asr_module(),
            llm: default_llm_module(),
            tts: default_tts_module(),
            vad: default_vad_module(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_asr_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    /// "plain" streams text; "function_call" sends intent schemas as tools
    #[serde(default = "default_llm_mode")]
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Default voice id; roles may override per session
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    #[serde(default = "default_tts_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Speech probability threshold
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    /// Trailing silence that ends an utterance
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_duration_ms: u64,
    /// Silero ONNX model location
    #[serde(default = "default_vad_model_path")]
    pub model_path: String,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            min_silence_duration_ms: default_min_silence_ms(),
            model_path: default_vad_model_path(),
        }
    }
}

fn default_ip() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_webrtc_port() -> u16 { 8082 }
fn default_signaling_path() -> String { "/ws/signaling".to_string() }
fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_asr_module() -> String { "http".to_string() }
fn default_llm_module() -> String { "openai".to_string() }
fn default_tts_module() -> String { "http".to_string() }
fn default_vad_module() -> String { "silero".to_string() }
fn default_asr_timeout_ms() -> u64 { 10_000 }
fn default_tts_timeout_ms() -> u64 { 10_000 }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_max_tokens() -> u32 { 512 }
fn default_llm_mode() -> String { "plain".to_string() }
fn default_tts_voice() -> String { "zh-CN-XiaoxiaoNeural".to_string() }
fn default_vad_threshold() -> f32 { 0.5 }
fn default_min_silence_ms() -> u64 { 1000 }
fn default_vad_model_path() -> String { "models/silero_vad.onnx".to_string() }
fn default_prompt() -> String {
    "You are a friendly voice assistant. Keep replies short and conversational; \
     they will be spoken aloud."
        .to_string()
}
fn default_exit_commands() -> Vec<String> {
    vec!["再见".to_string(), "拜拜".to_string(), "goodbye".to_string()]
}
fn default_wakeup_words() -> Vec<String> {
    vec!["小智".to_string(), "小志".to_string()]
}
fn default_true() -> bool { true }
fn default_stop_notify_voice() -> String { "assets/tts_notify.wav".to_string() }
fn default_max_utterance_seconds() -> u64 { 60 }
fn default_max_history_turns() -> usize { 20 }
fn default_role_api_port() -> u16 { 8081 }
fn default_roles_path() -> String { "data/roles.json".to_string() }

fn default_asr_table() -> HashMap<String, AsrConfig> {
    let mut m = HashMap::new();
    m.insert(
        "http".to_string(),
        AsrConfig {
            endpoint: "http://127.0.0.1:9000/asr".to_string(),
            api_key: String::new(),
            timeout_ms: default_asr_timeout_ms(),
        },
    );
    m
}

fn default_llm_table() -> HashMap<String, LlmConfig> {
    let mut m = HashMap::new();
    m.insert(
        "openai".to_string(),
        LlmConfig {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            mode: default_llm_mode(),
        },
    );
    m
}

fn default_tts_table() -> HashMap<String, TtsConfig> {
    let mut m = HashMap::new();
    m.insert(
        "http".to_string(),
        TtsConfig {
            endpoint: "http://127.0.0.1:9001/tts".to_string(),
            api_key: String::new(),
            voice: default_tts_voice(),
            timeout_ms: default_tts_timeout_ms(),
        },
    );
    m
}

impl Config {
    /// Load configuration from a file, or defaults when the file is absent.
    /// Parse failures and broken module selections fail fast.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.asr.contains_key(&self.selected_module.asr) {
            return Err(ConfigError::Invalid(format!(
                "selected_module.asr = {:?} has no [asr.{}] table",
                self.selected_module.asr, self.selected_module.asr
            )));
        }
        if !self.llm.contains_key(&self.selected_module.llm) {
            return Err(ConfigError::Invalid(format!(
                "selected_module.llm = {:?} has no [llm.{}] table",
                self.selected_module.llm, self.selected_module.llm
            )));
        }
        if !self.tts.contains_key(&self.selected_module.tts) {
            return Err(ConfigError::Invalid(format!(
                "selected_module.tts = {:?} has no [tts.{}] table",
                self.selected_module.tts, self.selected_module.tts
            )));
        }
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(ConfigError::Invalid(format!(
                "vad.threshold must be within [0, 1], got {}",
                self.vad.threshold
            )));
        }
        Ok(())
    }

    /// The ASR table selected by `selected_module.asr`
    pub fn active_asr(&self) -> &AsrConfig {
        &self.asr[&self.selected_module.asr]
    }

    /// The LLM table selected by `selected_module.llm`
    pub fn active_llm(&self) -> &LlmConfig {
        &self.llm[&self.selected_module.llm]
    }

    /// The TTS table selected by `selected_module.tts`
    pub fn active_tts(&self) -> &TtsConfig {
        &self.tts[&self.selected_module.tts]
    }
}
