//! Messages-style chat completion provider
//!
//! Speaks the Anthropic Messages wire format. Per-agent params may override
//! `model`, `max_tokens`, `temperature` and supply a `system` prompt.

use super::{classify_status, classify_transport};
use crate::completion::provider::{ProviderError, ProviderParams, SyncProvider};
use crate::config::{resolve_env_var, ChatProviderSection, ConfigError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat provider configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub version: String,
    pub timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 4096,
            version: "2023-06-01".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl ChatConfig {
    /// Build from the `[providers.chat]` section, reading the key from the environment
    pub fn from_section(section: &ChatProviderSection, timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: resolve_env_var(&section.api_key_env)?,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            model: section.model.clone(),
            max_tokens: section.max_tokens,
            version: section.api_version.clone(),
            timeout,
        })
    }
}

/// Chat completion provider
pub struct ChatProvider {
    config: ChatConfig,
    client: Client,
}

impl ChatProvider {
    pub fn new(config: ChatConfig) -> Result<Self, ConfigError> {
        if config.api_key.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "chat provider API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn build_request(&self, prompt: &str, params: &ProviderParams) -> ChatRequest {
        ChatRequest {
            model: params
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or(&self.config.model)
                .to_string(),
            max_tokens: params
                .get("max_tokens")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32)
                .unwrap_or(self.config.max_tokens),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            system: params
                .get("system")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            temperature: params
                .get("temperature")
                .and_then(|v| v.as_f64())
                .map(|t| t as f32),
        }
    }
}

#[async_trait]
impl SyncProvider for ChatProvider {
    fn name(&self) -> &str {
        "chat"
    }

    async fn produce(&self, prompt: &str, params: &ProviderParams) -> Result<String, ProviderError> {
        let request = self.build_request(prompt, params);

        let response = self
            .client
            .post(format!("{}/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.version)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &error_text, "chat API"));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid chat response: {e}")))?;

        let content = chat_response
            .content
            .into_iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(ProviderError::Permanent(
                "no text content returned from chat API".to_string(),
            ));
        }

        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: Vec<ChatContent>,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}
