//! Uniform interface over chat-completion backends.
//!
//! One capability: `complete(prompt) → text`. Two HTTP backends (an
//! OpenAI-compatible chat-completions endpoint and the Anthropic messages
//! API) plus an in-memory mock for tests. `extract_json` lifts the first
//! usable JSON object out of model output and never fails — callers deal
//! with invalid JSON themselves.

pub mod anthropic;
pub mod mock;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::errors::AppError;

pub use anthropic::AnthropicProvider;
pub use mock::MockLlm;
pub use openai::OpenAiProvider;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String, AppError>;
}

/// Build the configured provider.
pub fn from_config(cfg: &LlmConfig) -> Result<Arc<dyn LlmProvider>, AppError> {
    match cfg.provider.as_str() {
        "openai" | "openai-compatible" => Ok(Arc::new(OpenAiProvider::new(cfg)?)),
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(cfg)?)),
        "mock" => Ok(Arc::new(MockLlm::default())),
        other => Err(AppError::Configuration(format!(
            "unknown llm provider: {}",
            other
        ))),
    }
}

/// Extract the most plausible JSON payload from model output.
///
/// Preference order: a fenced code block whose contents parse, then the
/// outermost `{…}` slice when it parses, then the raw text unchanged.
pub fn extract_json(text: &str) -> String {
    if let Some(block) = fenced_block(text) {
        if serde_json::from_str::<serde_json::Value>(block).is_ok() {
            return block.to_string();
        }
    }

    let trimmed = text.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            let candidate = &trimmed[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return candidate.to_string();
            }
        }
    }

    text.to_string()
}

/// Contents of the first ``` fenced block, tolerating a language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // Skip a language tag like `json` up to the first newline.
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

// ── Tests ────────────────────────────────────────────────────
