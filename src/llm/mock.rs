//! In-memory LLM backend for tests and offline runs.
//!
//! Maps substring triggers in the prompt to canned responses; unmatched
//! prompts get the configurable default. The call counter is the
//! observable the cache tests hang on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::AppError;

use super::LlmProvider;

pub struct MockLlm {
    triggers: RwLock<Vec<(String, String)>>,
    default_response: RwLock<String>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            triggers: RwLock::new(Vec::new()),
            default_response: RwLock::new(
                r#"{"decision": "INDETERMINATE", "reason": "mock default", "confidence": 0.5}"#
                    .to_string(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    /// Respond with `response` whenever `trigger` appears in the prompt.
    /// Triggers are matched in registration order.
    pub fn with_trigger(self, trigger: impl Into<String>, response: impl Into<String>) -> Self {
        self.triggers
            .write()
            .expect("trigger lock poisoned")
            .push((trigger.into(), response.into()));
        self
    }

    pub fn with_default(self, response: impl Into<String>) -> Self {
        *self
            .default_response
            .write()
            .expect("default lock poisoned") = response.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let triggers = self.triggers.read().expect("trigger lock poisoned");
        for (trigger, response) in triggers.iter() {
            if prompt.contains(trigger.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self
            .default_response
            .read()
            .expect("default lock poisoned")
            .clone())
    }
}

// ── Tests ────────────────────────────────────────────────────
