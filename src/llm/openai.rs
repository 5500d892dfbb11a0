//! OpenAI-compatible chat-completions backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::errors::AppError;

use super::LlmProvider;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f64,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(cfg: &LlmConfig) -> Result<Self, AppError> {
        let api_key = cfg
            .api_key
            .clone()
            .ok_or_else(|| AppError::Configuration("openai provider requires an api key".into()))?;
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
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Network(format!("openai request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Llm(format!(
                "openai returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| AppError::Llm(format!("openai response is not JSON: {}", e)))?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Llm("openai response missing message content".into()))
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(base_url: String) -> LlmConfig {
        LlmConfig {
            provider: "openai".into(),
            api_key: Some("sk-test".into()),
            model: "gpt-4o-mini".into(),
            base_url: Some(base_url),
            temperature: 0.3,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let mut c = cfg("http://localhost".into());
        c.api_key = None;
        assert!(matches!(
            OpenAiProvider::new(&c).unwrap_err(),
            AppError::Configuration(_)
        ));
    }

    #[tokio::test]
    async fn test_complete_extracts_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(bearer_token("sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "{\"decision\":\"PERMIT\"}" } }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&cfg(server.uri())).unwrap();
        let out = provider.complete("evaluate this").await.unwrap();
        assert_eq!(out, "{\"decision\":\"PERMIT\"}");
    }

    #[tokio::test]
    async fn test_http_error_maps_to_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&cfg(server.uri())).unwrap();
        let err = provider.complete("evaluate").await.unwrap_err();
        assert!(matches!(err, AppError::Llm(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_maps_to_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&cfg(server.uri())).unwrap();
        let err = provider.complete("evaluate").await.unwrap_err();
        assert!(matches!(err, AppError::Llm(_)));
    }
}
