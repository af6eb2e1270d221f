use crate::config::ProviderConfig;
use crate::errors::TaskmateError;
use crate::providers::base::{ChatProvider, ChatRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// OpenAI-compatible chat completions backend. Works against any endpoint
/// speaking the `/v1/chat/completions` wire format.
pub struct OpenAIProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
}

impl OpenAIProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            default_model: config.model.clone(),
            base_url: config.base_url.clone(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(config.request_timeout))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(base_url: String) -> Self {
        Self::new(&ProviderConfig {
            api_key: "test-key".into(),
            model: "test-model".into(),
            base_url,
            request_timeout: 5,
        })
    }

    fn parse_response(json: &Value) -> Result<String> {
        let choice = json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("No choices in chat completion response")?;
        choice["message"]["content"]
            .as_str()
            .map(std::string::ToString::to_string)
            .context("No content in chat completion response")
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<String> {
        let mut wire_messages: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
        if !req.system_prompt.is_empty() {
            wire_messages.push(json!({"role": "system", "content": req.system_prompt}));
        }
        for msg in &req.messages {
            wire_messages.push(json!({"role": msg.role, "content": msg.content}));
        }

        let body = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": wire_messages,
        });

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::Error::from(TaskmateError::ModelCallTimeout)
                } else {
                    anyhow::Error::from(TaskmateError::ModelCallFailed {
                        message: e.to_string(),
                        retryable: true,
                    })
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            // 5xx and 429 are worth retrying; 4xx auth/validation errors are not
            let retryable = status.is_server_error() || status.as_u16() == 429;
            return Err(TaskmateError::ModelCallFailed {
                message: format!("HTTP {}: {}", status, truncate(&body_text, 300)),
                retryable,
            }
            .into());
        }

        let json: Value = response.json().await.map_err(|e| {
            TaskmateError::ModelCallFailed {
                message: format!("malformed payload: {}", e),
                retryable: false,
            }
        })?;
        Self::parse_response(&json)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
