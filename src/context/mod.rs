//! Decision context and the enrichment pipeline.
//!
//! A [`DecisionContext`] is the invariant input to the policy engine: who
//! is asking (`agent`), what they want to do (`action` on `resource`), and
//! an open `environment` map that enrichers decorate before evaluation.
//! Enrichers run concurrently; each contributes a namespaced object under
//! `environment.enrichments.<name>` and never overwrites another's keys.
//! A failing enricher is logged and skipped.

pub mod enrichers;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Action ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    List,
    Read,
    Execute,
    Admin,
    Delete,
    Modify,
}

impl Action {
    /// Actions that change state; INDETERMINATE decisions fail closed here.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Action::Execute | Action::Admin | Action::Delete | Action::Modify
        )
    }

    /// Map a JSON-RPC method to the action it represents.
    pub fn from_method(method: &str) -> Action {
        match method {
            "tools/list" | "resources/list" | "prompts/list" | "initialize" | "ping" => {
                Action::List
            }
            "resources/read" | "prompts/get" => Action::Read,
            "tools/call" => Action::Execute,
            _ => Action::Read,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Read => "read",
            Action::Execute => "execute",
            Action::Admin => "admin",
            Action::Delete => "delete",
            Action::Modify => "modify",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── DecisionContext ──────────────────────────────────────────

/// The engine's input. Immutable once the enrichment pipeline has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    pub action: Action,
    /// For tool calls this is `tool:<name>`; for resources, the URI.
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub environment: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clearance_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violation_history: Vec<String>,
}

impl DecisionContext {
    pub fn new(agent: impl Into<String>, action: Action, resource: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            agent_type: None,
            action,
            resource: resource.into(),
            purpose: None,
            time: Utc::now(),
            environment: Map::new(),
            clearance_level: None,
            violation_history: Vec::new(),
        }
    }

    /// Look up one enricher's contribution, e.g. `enrichment("resource")`.
    pub fn enrichment(&self, name: &str) -> Option<&Value> {
        self.environment.get("enrichments")?.get(name)
    }
}

// ── Enricher registry ────────────────────────────────────────

/// A pluggable context decorator. Pure with respect to the context: it may
/// read anything but only contributes keys under its own namespace.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;
    async fn enrich(&self, ctx: &DecisionContext) -> anyhow::Result<Map<String, Value>>;
}

/// Runs registered enrichers concurrently and merges their contributions
/// into `environment.enrichments`.
pub struct Collector {
    enrichers: Vec<Arc<dyn Enricher>>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            enrichers: Vec::new(),
        }
    }

    /// The built-in pipeline: time, agent, resource classifier, security.
    pub fn with_builtins(production: bool) -> Self {
        let mut collector = Self::new();
        collector.register(Arc::new(enrichers::TimeEnricher::default()));
        collector.register(Arc::new(enrichers::AgentEnricher));
        collector.register(Arc::new(enrichers::ResourceClassifier::new(production)));
        collector.register(Arc::new(enrichers::SecurityEnricher::default()));
        collector
    }

    pub fn register(&mut self, enricher: Arc<dyn Enricher>) {
        self.enrichers.push(enricher);
    }

    pub async fn collect(&self, mut ctx: DecisionContext) -> DecisionContext {
        let runs = self.enrichers.iter().map(|e| {
            let enricher = e.clone();
            let ctx = ctx.clone();
            async move {
                let name = enricher.name().to_string();
                (name, enricher.enrich(&ctx).await)
            }
        });
        let results = futures::future::join_all(runs).await;

        let mut enrichments = match ctx.environment.remove("enrichments") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };

        for (name, outcome) in results {
            match outcome {
                Ok(contribution) => {
                    enrichments.insert(name, Value::Object(contribution));
                }
                Err(e) => {
                    tracing::warn!(enricher = %name, error = %e, "enricher failed, skipping");
                }
            }
        }

        ctx.environment
            .insert("enrichments".to_string(), Value::Object(enrichments));
        ctx
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────
