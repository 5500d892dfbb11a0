//! Built-in context enrichers: time, agent metadata, resource
//! classification, security hints.

use async_trait::async_trait;
use chrono::{Datelike, Local, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{DecisionContext, Enricher};

// ── Time ─────────────────────────────────────────────────────

/// Adds hour, day-of-week and business-hours flags derived from the
/// request's own timestamp (never the wall clock).
pub struct TimeEnricher {
    pub business_start: u32,
    pub business_end: u32,
}

impl Default for TimeEnricher {
    fn default() -> Self {
        Self {
            business_start: 9,
            business_end: 18,
        }
    }
}

#[async_trait]
impl Enricher for TimeEnricher {
    fn name(&self) -> &str {
        "time"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> anyhow::Result<Map<String, Value>> {
        let local = ctx.time.with_timezone(&Local);
        let hour = local.hour();
        let weekday = local.weekday();
        let is_weekend = matches!(weekday, chrono::Weekday::Sat | chrono::Weekday::Sun);
        let is_business_hours =
            !is_weekend && hour >= self.business_start && hour < self.business_end;

        let mut out = Map::new();
        out.insert("hour".into(), json!(hour));
        out.insert("dayOfWeek".into(), json!(weekday.to_string()));
        out.insert("isBusinessHours".into(), json!(is_business_hours));
        out.insert("isWeekend".into(), json!(is_weekend));
        Ok(out)
    }
}

// ── Agent ────────────────────────────────────────────────────

/// Parses the caller's metadata header (JSON, stashed in
/// `environment.agentMetadata` by the transport) into structured fields.
pub struct AgentEnricher;

#[async_trait]
impl Enricher for AgentEnricher {
    fn name(&self) -> &str {
        "agent"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> anyhow::Result<Map<String, Value>> {
        let mut out = Map::new();
        if let Some(t) = &ctx.agent_type {
            out.insert("agentType".into(), json!(t));
        }

        let meta = match ctx.environment.get("agentMetadata") {
            Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
                .map_err(|e| anyhow::anyhow!("agent-metadata header is not JSON: {}", e))?,
            Some(v) => v.clone(),
            None => return Ok(out),
        };

        for key in ["department", "clearance", "permissions", "team"] {
            if let Some(v) = meta.get(key) {
                out.insert(key.to_string(), v.clone());
            }
        }
        Ok(out)
    }
}

// ── Resource classifier ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Critical,
}

struct ClassifierRule {
    pattern: &'static Lazy<Regex>,
    data_type: &'static str,
    sensitivity: Sensitivity,
    tags: &'static [&'static str],
    retention_days: u32,
    requires_encryption: bool,
}

static SECRET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)secret|credential|password|token|private[_-]?key").unwrap());
static CUSTOMER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)customer|crm|/users?/|profile").unwrap());
static FINANCIAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)financ|payment|invoice|billing|payroll").unwrap());
static MAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^gmail://|mail|inbox").unwrap());
static PUBLIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)public|/docs?/|readme").unwrap());

/// Development-shaped resources (`tool:` prefixed names, `__` namespaced
/// tools) classify as low-sensitivity local resources.
static DEV_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tool:|__").unwrap());

const RULES: &[ClassifierRule] = &[
    ClassifierRule {
        pattern: &SECRET_RE,
        data_type: "secret",
        sensitivity: Sensitivity::Critical,
        tags: &["sensitive", "secret"],
        retention_days: 0,
        requires_encryption: true,
    },
    ClassifierRule {
        pattern: &FINANCIAL_RE,
        data_type: "financial",
        sensitivity: Sensitivity::Critical,
        tags: &["sensitive", "financial"],
        retention_days: 2555,
        requires_encryption: true,
    },
    ClassifierRule {
        pattern: &CUSTOMER_RE,
        data_type: "pii",
        sensitivity: Sensitivity::High,
        tags: &["sensitive", "customer"],
        retention_days: 730,
        requires_encryption: true,
    },
    ClassifierRule {
        pattern: &MAIL_RE,
        data_type: "communication",
        sensitivity: Sensitivity::Medium,
        tags: &["communication"],
        retention_days: 365,
        requires_encryption: false,
    },
    ClassifierRule {
        pattern: &PUBLIC_RE,
        data_type: "public",
        sensitivity: Sensitivity::Low,
        tags: &["public"],
        retention_days: 30,
        requires_encryption: false,
    },
];

/// Ordered first-match classification of the resource string.
pub struct ResourceClassifier {
    production: bool,
}

impl ResourceClassifier {
    pub fn new(production: bool) -> Self {
        Self { production }
    }

    fn classify(&self, resource: &str) -> (&'static str, Sensitivity, Vec<&'static str>, u32, bool) {
        for rule in RULES {
            let re: &Regex = rule.pattern;
            if re.is_match(resource) {
                return (
                    rule.data_type,
                    rule.sensitivity,
                    rule.tags.to_vec(),
                    rule.retention_days,
                    rule.requires_encryption,
                );
            }
        }
        if DEV_RE.is_match(resource) {
            return ("local", Sensitivity::Low, vec!["development"], 30, false);
        }
        // Unclassified: assume the worst in production.
        let sensitivity = if self.production {
            Sensitivity::High
        } else {
            Sensitivity::Medium
        };
        ("unclassified", sensitivity, vec![], 365, self.production)
    }
}

#[async_trait]
impl Enricher for ResourceClassifier {
    fn name(&self) -> &str {
        "resource"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> anyhow::Result<Map<String, Value>> {
        let (data_type, sensitivity, tags, retention, encryption) = self.classify(&ctx.resource);
        let mut out = Map::new();
        out.insert("dataType".into(), json!(data_type));
        out.insert("sensitivity".into(), serde_json::to_value(sensitivity)?);
        out.insert("tags".into(), json!(tags));
        out.insert("retentionDays".into(), json!(retention));
        out.insert("requiresEncryption".into(), json!(encryption));
        Ok(out)
    }
}

// ── Security ─────────────────────────────────────────────────

static SUSPICIOUS_RES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"\.\./").unwrap(), "path traversal"),
        (Regex::new(r"(?i)/etc/(passwd|shadow)").unwrap(), "system credential file"),
        (Regex::new(r"(?i)\brm\s+-rf\b").unwrap(), "destructive shell command"),
        (Regex::new(r"(?i)drop\s+table").unwrap(), "sql destruction"),
        (Regex::new(r"(?i)exfiltrat").unwrap(), "exfiltration wording"),
        (Regex::new(r"(?i)ignore\s+previous\s+instructions").unwrap(), "prompt injection wording"),
    ]
});

/// Annotates risk hints from suspicious patterns and violation history.
#[derive(Default)]
pub struct SecurityEnricher;

#[async_trait]
impl Enricher for SecurityEnricher {
    fn name(&self) -> &str {
        "security"
    }

    async fn enrich(&self, ctx: &DecisionContext) -> anyhow::Result<Map<String, Value>> {
        let mut hints: Vec<&str> = Vec::new();
        let haystacks = [
            Some(ctx.resource.as_str()),
            ctx.purpose.as_deref(),
        ];
        for (re, hint) in SUSPICIOUS_RES.iter() {
            if haystacks
                .iter()
                .flatten()
                .any(|text| re.is_match(text))
            {
                hints.push(hint);
            }
        }

        let mut out = Map::new();
        out.insert("suspicious".into(), json!(!hints.is_empty()));
        out.insert("riskHints".into(), json!(hints));
        out.insert(
            "hasViolationHistory".into(),
            json!(!ctx.violation_history.is_empty()),
        );
        out.insert(
            "violationCount".into(),
            json!(ctx.violation_history.len()),
        );
        Ok(out)
    }
}

// ── Tests ────────────────────────────────────────────────────
