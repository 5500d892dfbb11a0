//! Anthropic messages-API backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::errors::AppError;

use super::LlmProvider;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f64,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(cfg: &LlmConfig) -> Result<Self, AppError> {
        let api_key = cfg.api_key.clone().ok_or_else(|| {
            AppError::Configuration("anthropic provider requires an api key".into())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            model: cfg.model.clone(),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Network(format!("anthropic request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Llm(format!(
                "anthropic returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| AppError::Llm(format!("anthropic response is not JSON: {}", e)))?;
        parsed["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Llm("anthropic response missing text content".into()))
    }
}

// ── Tests ────────────────────────────────────────────────────
