//! Policy and decision data model.
//!
//! A policy body is either free-form natural language (evaluated by the
//! LLM) or a structured rule set (evaluated deterministically first).
//! Applicability is a cheap pre-filter: status plus optional hour-range,
//! agent-type, resource-pattern and tag conditions.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{Action, DecisionContext};

// ── Decision ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    Permit,
    Deny,
    Indeterminate,
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Effect::Permit => "PERMIT",
            Effect::Deny => "DENY",
            Effect::Indeterminate => "INDETERMINATE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// The engine's verdict, including enforcement directives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub decision: Effect,
    pub reason: String,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub obligations: Vec<String>,
    /// Seconds this decision may be reused for, when the policy bounds it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_period: Option<u64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PolicyDecision {
    pub fn permit(reason: impl Into<String>) -> Self {
        Self {
            decision: Effect::Permit,
            reason: reason.into(),
            confidence: 1.0,
            risk_level: RiskLevel::Low,
            constraints: Vec::new(),
            obligations: Vec::new(),
            validity_period: None,
            metadata: Map::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Effect::Deny,
            reason: reason.into(),
            confidence: 1.0,
            risk_level: RiskLevel::Medium,
            constraints: Vec::new(),
            obligations: Vec::new(),
            validity_period: None,
            metadata: Map::new(),
        }
    }

    /// The synthesized verdict for anything the engine cannot settle:
    /// HIGH risk and a manual-review obligation.
    pub fn indeterminate(reason: impl Into<String>) -> Self {
        Self {
            decision: Effect::Indeterminate,
            reason: reason.into(),
            confidence: 0.0,
            risk_level: RiskLevel::High,
            constraints: Vec::new(),
            obligations: vec!["manual-review".to_string()],
            validity_period: None,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

// ── Policy ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Active,
    Deprecated,
    Draft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRevision {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadata {
    pub status: PolicyStatus,
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<PolicyRevision>,
}

impl PolicyMetadata {
    pub fn new(priority: i32) -> Self {
        let now = Utc::now();
        Self {
            status: PolicyStatus::Active,
            priority,
            tags: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            updated_by: None,
            history: Vec::new(),
        }
    }
}

/// Free-form text or a structured rule set. Untagged so policy documents
/// can carry either a string or an object body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyBody {
    Rules(RuleSet),
    Text(String),
}

impl PolicyBody {
    /// Canonical form used for fingerprinting.
    pub fn canonical(&self) -> String {
        match self {
            PolicyBody::Text(t) => t.clone(),
            PolicyBody::Rules(r) => serde_json::to_string(r).unwrap_or_default(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PolicyBody::Text(t) => Some(t),
            PolicyBody::Rules(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub permissions: Vec<PolicyRule>,
    #[serde(default)]
    pub prohibitions: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// Empty means any action.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Regex patterns over the resource string; empty means any.
    #[serde(default)]
    pub resource_patterns: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub obligations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ordered per-rule conditions. Every listed condition must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Hour of day in `[startHour, endHour)`.
    TimeRange {
        #[serde(rename = "startHour")]
        start_hour: u32,
        #[serde(rename = "endHour")]
        end_hour: u32,
    },
    /// Caller's agent type must be one of these.
    AgentType {
        #[serde(rename = "agentTypes")]
        agent_types: Vec<String>,
    },
    /// Caller's clearance must be at least this.
    MinClearance { level: u8 },
    /// The time enricher must have flagged business hours.
    BusinessHours,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourRange {
    pub start_hour: u32,
    pub end_hour: u32,
}

/// Optional applicability conditions; all present conditions must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Applicability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<HourRange>,
    #[serde(default)]
    pub agent_types: Vec<String>,
    #[serde(default)]
    pub resource_patterns: Vec<String>,
    /// Tag hints matched against the resource classifier's tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub body: PolicyBody,
    pub metadata: PolicyMetadata,
    #[serde(default)]
    pub applicability: Applicability,
}

impl Policy {
    /// Status is active and every optional condition matches the context.
    pub fn is_applicable(&self, ctx: &DecisionContext) -> bool {
        if self.metadata.status != PolicyStatus::Active {
            return false;
        }

        let app = &self.applicability;

        if let Some(range) = &app.time_range {
            let hour = context_hour(ctx);
            if !(range.start_hour..range.end_hour).contains(&hour) {
                return false;
            }
        }

        if !app.agent_types.is_empty() {
            match &ctx.agent_type {
                Some(t) if app.agent_types.iter().any(|a| a == t) => {}
                _ => return false,
            }
        }

        if !app.resource_patterns.is_empty() {
            let any = app.resource_patterns.iter().any(|p| {
                match compile_pattern(p) {
                    Some(re) => re.is_match(&ctx.resource),
                    None => {
                        tracing::warn!(policy = %self.name, pattern = %p, "invalid resource pattern");
                        false
                    }
                }
            });
            if !any {
                return false;
            }
        }

        if !app.tags.is_empty() {
            let resource_tags = context_resource_tags(ctx);
            if !app
                .tags
                .iter()
                .any(|t| resource_tags.iter().any(|rt| rt == t))
            {
                return false;
            }
        }

        true
    }
}

/// Hour of day for condition checks: the time enricher's value when
/// present, otherwise derived from the context timestamp.
pub fn context_hour(ctx: &DecisionContext) -> u32 {
    ctx.enrichment("time")
        .and_then(|t| t.get("hour"))
        .and_then(Value::as_u64)
        .map(|h| h as u32)
        .unwrap_or_else(|| ctx.time.with_timezone(&chrono::Local).hour())
}

/// Resource tags assigned by the classifier enricher.
pub fn context_resource_tags(ctx: &DecisionContext) -> Vec<String> {
    ctx.enrichment("resource")
        .and_then(|r| r.get("tags"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Caller's clearance: the explicit context field, else the agent
/// enricher's parsed value.
pub fn context_clearance(ctx: &DecisionContext) -> Option<u8> {
    if let Some(c) = ctx.clearance_level {
        return Some(c);
    }
    ctx.enrichment("agent")
        .and_then(|a| a.get("clearance"))
        .and_then(Value::as_u64)
        .map(|c| c.min(u8::MAX as u64) as u8)
}

/// Compile a policy-author regex with a size limit.
pub fn compile_pattern(pattern: &str) -> Option<regex::Regex> {
    regex::RegexBuilder::new(pattern)
        .size_limit(1_000_000)
        .build()
        .ok()
}

// ── Tests ────────────────────────────────────────────────────
