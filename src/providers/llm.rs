//! OpenAI-compatible LLM adapter
//!
//! Plain mode streams `/chat/completions` SSE deltas; function mode sends
//! the intent registry's schemas as `tools` and returns either text or one
//! function call.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChatMessage, LlmOutcome, LlmProvider};
use crate::config::LlmConfig;
use crate::error::ProviderError;

pub struct HttpLlm {
    config: LlmConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpLlm {
    pub fn new(config: LlmConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn request(&self, body: &impl Serialize) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(body);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }
        builder
    }

    async fn send_checked(
        &self,
        body: &impl Serialize,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!("llm returned {status}: {text}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            stream: Some(true),
            tools: None,
        };
        let response = self.send_checked(&body).await?;

        let mut stream = response.bytes_stream();
        let mut full = String::new();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Unavailable(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by a blank line
            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();

                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) {
                        if let Some(content) =
                            parsed.choices.first().and_then(|c| c.delta.content.as_deref())
                        {
                            full.push_str(content);
                            if tx.send(content.to_string()).await.is_err() {
                                // consumer gone (barge-in); stop reading
                                return Ok(full);
                            }
                        }
                    }
                }
            }
        }

        debug!("llm stream complete: {} chars", full.len());
        Ok(full)
    }

    async fn chat_with_functions(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<LlmOutcome, ProviderError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            stream: None,
            tools: if tools.is_empty() { None } else { Some(tools) },
        };
        let response = self.send_checked(&body).await?;
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("bad llm response: {e}")))?;

        let message = raw
            .pointer("/choices/0/message")
            .cloned()
            .unwrap_or_else(|| json!({}));

        if let Some(call) = message.pointer("/tool_calls/0/function") {
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = call
                .get("arguments")
                .and_then(|a| a.as_str())
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| json!({}));
            return Ok(LlmOutcome::FunctionCall { name, arguments });
        }

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(LlmOutcome::Text(text))
    }
}
