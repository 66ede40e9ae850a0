//! HTTP ASR adapter
//!
//! Posts the utterance as one concatenated 16 kHz mono s16le blob and reads
//! back `{"text": ...}`. Timeouts and transport failures map to
//! [`ProviderError`]; the dispatcher turns those into an empty transcript.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::AsrProvider;
use crate::audio::{codec, AudioChunk};
use crate::config::AsrConfig;
use crate::error::ProviderError;

pub struct HttpAsr {
    config: AsrConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct AsrResponse {
    #[serde(default)]
    text: String,
}

impl HttpAsr {
    pub fn new(config: AsrConfig, client: Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl AsrProvider for HttpAsr {
    async fn recognize(
        &self,
        chunks: &[AudioChunk],
        session_id: &str,
    ) -> Result<String, ProviderError> {
        let blob = codec::chunks_to_pcm_blob(chunks);
        if blob.is_empty() {
            return Ok(String::new());
        }
        debug!(
            "asr dispatch: {} chunks, {} pcm bytes, session {}",
            chunks.len(),
            blob.len(),
            session_id
        );

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "audio/L16; rate=16000; channels=1")
            .header("session-id", session_id)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .body(blob);
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
                "asr returned {}",
                response.status()
            )));
        }

        let parsed: AsrResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("bad asr response: {e}")))?;
        Ok(parsed.text.trim().to_string())
    }
}
