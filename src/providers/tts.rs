//! HTTP TTS adapter
//!
//! Posts `{text, voice}` and expects a WAV body, which is converted to
//! 16 kHz mono and framed into 20 ms Opus packets by the codec. Retry
//! policy lives in the speak pipeline, not here.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::TtsProvider;
use crate::audio::codec;
use crate::config::TtsConfig;
use crate::error::ProviderError;

pub struct HttpTts {
    config: TtsConfig,
    client: Client,
}

impl HttpTts {
    pub fn new(config: TtsConfig, client: Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl TtsProvider for HttpTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<(Vec<Bytes>, f64), ProviderError> {
        let voice = if voice.is_empty() { &self.config.voice } else { voice };
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(&json!({ "text": text, "voice": voice }));
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.timeout_ms)
            } else {
                ProviderError::Unavailable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(ProviderError::Rejected(format!(
                "tts returned {}",
                response.status()
            )));
        }

        let is_json = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("json"))
            .unwrap_or(false);
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let wav = unwrap_audio_body(is_json, &body)?;
        let pcm = codec::wav_bytes_to_pcm(&wav)
            .map_err(|e| ProviderError::Rejected(format!("unusable tts audio: {e}")))?;
        let (frames, duration) = codec::encode_pcm_to_opus(&pcm)
            .map_err(|e| ProviderError::Rejected(format!("opus framing failed: {e}")))?;

        debug!(
            "tts segment: {} chars -> {} frames ({duration:.2}s)",
            text.len(),
            frames.len()
        );
        Ok((frames, duration))
    }
}

/// Two provider response shapes exist: a raw WAV body, or JSON carrying
/// base64 audio in a `data` field.
fn unwrap_audio_body(is_json: bool, body: &[u8]) -> Result<Vec<u8>, ProviderError> {
    if !is_json {
        return Ok(body.to_vec());
    }
    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ProviderError::Rejected(format!("bad tts response: {e}")))?;
    let encoded = parsed
        .get("data")
        .and_then(|d| d.as_str())
        .ok_or_else(|| ProviderError::Rejected("tts response has no data".into()))?;
    BASE64
        .decode(encoded)
        .map_err(|e| ProviderError::Rejected(format!("bad base64 audio: {e}")))
}
