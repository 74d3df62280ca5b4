//! Inference provider port and the OpenAI-compatible HTTP implementation.
//!
//! Every LLM touchpoint in the engine (generation, extraction,
//! summarization, intent classification) goes through [`InferenceProvider`],
//! so tests can substitute a scripted model.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::types::{MemoryError, Message};

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    /// Ask the endpoint for a `json_object` response format.
    pub json_object: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.3,
            json_object: false,
        }
    }
}

/// Port for chat-completion generation.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        options: &InferenceOptions,
    ) -> Result<String, MemoryError>;

    /// Release the underlying client. Idempotent; called once at session
    /// shutdown.
    async fn shutdown(&self) {}

    /// Bounded retry with a fixed delay, for internal (non-user-facing)
    /// calls such as extraction and summarization.
    async fn generate_with_retry(
        &self,
        messages: &[Message],
        options: &InferenceOptions,
        max_retries: u32,
    ) -> Result<String, MemoryError> {
        let mut last_error = MemoryError::Llm {
            reason: "no attempts made".to_string(),
        };
        for attempt in 0..=max_retries {
            match self.generate(messages, options).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    if attempt < max_retries && e.is_transient() {
                        warn!(attempt = attempt + 1, error = %e, "generation failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        last_error = e;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(last_error)
    }
}

/// Chat completion over an OpenAI-compatible endpoint.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiCompatProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, MemoryError> {
        if config.api_key.is_empty() {
            return Err(MemoryError::Llm {
                reason: "API key must be provided".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MemoryError::Llm {
                reason: format!("failed to create HTTP client: {e}"),
            })?;

        info!(model = %config.model, url = %config.api_url, "external LLM configured");

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatProvider {
    async fn generate(
        &self,
        messages: &[Message],
        options: &InferenceOptions,
    ) -> Result<String, MemoryError> {
        let start = Instant::now();

        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "stream": false,
        });
        if options.json_object {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MemoryError::LlmTimeout {
                        seconds: self.timeout_secs,
                    }
                } else {
                    MemoryError::Llm {
                        reason: format!("request failed: {e}"),
                    }
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Llm {
                reason: format!("endpoint returned {status}: {body_text}"),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| MemoryError::Llm {
            reason: format!("failed to parse response: {e}"),
        })?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| MemoryError::Llm {
                reason: format!("unexpected response shape: {json}"),
            })?
            .to_string();

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            response_chars = content.len(),
            model = %self.model,
            "generated response"
        );

        Ok(content)
    }

    async fn shutdown(&self) {
        // Connection pooling lives inside reqwest; dropping the client
        // closes idle connections.
        info!("external LLM client closed");
    }
}
