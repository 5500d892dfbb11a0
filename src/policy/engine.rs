//! The hybrid decision engine.
//!
//! `decide` runs the fixed pipeline: applicability filter → cache lookup →
//! per-policy evaluation (structured rules first, LLM fallback) → conflict
//! resolution → cache deposit. Given the same policy set, context and LLM
//! text the result is identical; the only wall-clock input is whatever the
//! enrichers already put on the context.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::context::DecisionContext;
use crate::llm::{extract_json, LlmProvider};
use crate::policy::admin::PolicyAdministrator;
use crate::policy::cache::{CacheKey, DecisionCache};
use crate::policy::conflict::{self, Contribution};
use crate::policy::model::{Effect, Policy, PolicyBody, PolicyDecision, RiskLevel};
use crate::policy::rules;

/// Template for the LLM analysis prompt. Placeholders are substituted
/// verbatim; the model is asked for a single JSON verdict.
const PROMPT_TEMPLATE: &str = r#"You are a policy decision point for an AI-agent capability proxy.
Evaluate the request below against the policy and answer with one JSON object only.

POLICY "{policy_name}":
{policy_body}

REQUEST:
- agent: {agent}
- agent type: {agent_type}
- action: {action}
- resource: {resource}
- purpose: {purpose}

CONTEXT:
{context_json}

Answer with exactly this shape:
{"decision": "PERMIT" | "DENY" | "INDETERMINATE", "reason": "<cite the policy clause>", "confidence": <0.0-1.0>, "riskLevel": "LOW" | "MEDIUM" | "HIGH" | "CRITICAL", "constraints": [], "obligations": []}"#;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Structured-rule confidence below this defers to the LLM.
    pub ai_threshold: f64,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ai_threshold: 0.8,
            cache_enabled: true,
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

pub struct PolicyEngine {
    admin: Arc<PolicyAdministrator>,
    llm: Arc<dyn LlmProvider>,
    cache: DecisionCache,
    config: EngineConfig,
}

impl PolicyEngine {
    pub fn new(
        admin: Arc<PolicyAdministrator>,
        llm: Arc<dyn LlmProvider>,
        config: EngineConfig,
    ) -> Self {
        let cache = DecisionCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            admin,
            llm,
            cache,
            config,
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Produce one decision for the context.
    pub async fn decide(&self, ctx: &DecisionContext) -> PolicyDecision {
        let policies = self.admin.applicable(ctx).await;
        if policies.is_empty() {
            return PolicyDecision::indeterminate("no applicable policy for this request")
                .with_metadata("applicablePolicies", json!(0));
        }

        let key = CacheKey::new(&policies, ctx);
        if self.config.cache_enabled {
            if let Some(hit) = self.cache.get(&key) {
                tracing::debug!(agent = %ctx.agent, resource = %ctx.resource, "decision cache hit");
                return hit;
            }
        }

        let mut contributions = Vec::with_capacity(policies.len());
        for policy in &policies {
            let decision = self.evaluate_policy(policy, ctx).await;
            contributions.push(Contribution {
                policy_id: policy.id.clone(),
                policy_name: policy.name.clone(),
                priority: policy.metadata.priority,
                decision,
            });
        }

        let strategy = conflict::suggest_strategy(ctx);
        let decision = conflict::resolve(contributions, strategy);

        if self.config.cache_enabled {
            self.cache.put(key, decision.clone());
        }
        decision
    }

    /// One policy's verdict: deterministic rules first, LLM when the rules
    /// are silent or insufficiently confident.
    async fn evaluate_policy(&self, policy: &Policy, ctx: &DecisionContext) -> PolicyDecision {
        if let PolicyBody::Rules(rule_set) = &policy.body {
            if let Some(decision) = rules::evaluate(rule_set, ctx) {
                if decision.confidence >= self.config.ai_threshold {
                    return decision;
                }
                tracing::debug!(
                    policy = %policy.name,
                    confidence = decision.confidence,
                    "structured verdict below threshold, consulting llm"
                );
            }
        }
        self.evaluate_with_llm(policy, ctx).await
    }

    async fn evaluate_with_llm(&self, policy: &Policy, ctx: &DecisionContext) -> PolicyDecision {
        let prompt = build_prompt(policy, ctx);
        let text = match self.llm.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(policy = %policy.name, error = %e, "llm evaluation failed");
                return PolicyDecision::indeterminate("llm evaluation failed")
                    .with_metadata("aiError", json!(e.to_string()));
            }
        };

        let payload = extract_json(&text);
        match parse_verdict(&payload) {
            Ok(decision) => decision,
            Err(reason) => {
                tracing::warn!(policy = %policy.name, reason = %reason, "llm verdict rejected");
                PolicyDecision::indeterminate("llm returned an invalid verdict")
                    .with_metadata("parseError", json!(reason))
            }
        }
    }
}

/// Substitute context and policy into the analysis prompt.
fn build_prompt(policy: &Policy, ctx: &DecisionContext) -> String {
    let context_json = serde_json::to_string_pretty(&ctx.environment)
        .unwrap_or_else(|_| "{}".to_string());
    PROMPT_TEMPLATE
        .replace("{policy_name}", &policy.name)
        .replace("{policy_body}", &policy.body.canonical())
        .replace("{agent}", &ctx.agent)
        .replace("{agent_type}", ctx.agent_type.as_deref().unwrap_or("unknown"))
        .replace("{action}", ctx.action.as_str())
        .replace("{resource}", &ctx.resource)
        .replace("{purpose}", ctx.purpose.as_deref().unwrap_or("unspecified"))
        .replace("{context_json}", &context_json)
}

#[derive(Debug, Deserialize)]
struct LlmVerdict {
    decision: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(rename = "riskLevel", default)]
    risk_level: Option<RiskLevel>,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    obligations: Vec<String>,
    #[serde(rename = "validityPeriod", default)]
    validity_period: Option<u64>,
}

/// Parse and validate an LLM verdict. Errors describe the violation for
/// the `parseError` metadata flag.
fn parse_verdict(payload: &str) -> Result<PolicyDecision, String> {
    let verdict: LlmVerdict =
        serde_json::from_str(payload).map_err(|e| format!("not a verdict object: {}", e))?;

    let decision = match verdict.decision.as_str() {
        "PERMIT" => Effect::Permit,
        "DENY" => Effect::Deny,
        "INDETERMINATE" => Effect::Indeterminate,
        other => return Err(format!("decision \"{}\" is not in the allowed set", other)),
    };

    let reason = match verdict.reason {
        Some(r) if !r.trim().is_empty() => r,
        _ => return Err("reason is missing or empty".to_string()),
    };

    let confidence = match verdict.confidence {
        Some(c) if (0.0..=1.0).contains(&c) => c,
        Some(c) => return Err(format!("confidence {} outside [0, 1]", c)),
        None => return Err("confidence is missing".to_string()),
    };

    let risk_level = verdict.risk_level.unwrap_or(match decision {
        Effect::Permit => RiskLevel::Low,
        Effect::Deny => RiskLevel::Medium,
        Effect::Indeterminate => RiskLevel::High,
    });

    Ok(PolicyDecision {
        decision,
        reason,
        confidence,
        risk_level,
        constraints: verdict.constraints,
        obligations: verdict.obligations,
        validity_period: verdict.validity_period,
        metadata: serde_json::Map::new(),
    })
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Action;
    use crate::errors::AppError;
    use crate::llm::MockLlm;
    use crate::policy::model::{
        Applicability, PolicyMetadata, PolicyRule, RuleSet,
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct FailingLlm;

    #[async_trait]
    impl LlmProvider for FailingLlm {
        fn name(&self) -> &str {
            "failing"
        }
        async fn complete(&self, _prompt: &str) -> Result<String, AppError> {
            Err(AppError::Llm("provider unreachable".into()))
        }
    }

    fn engine_with(
        llm: Arc<dyn LlmProvider>,
        admin: Arc<PolicyAdministrator>,
    ) -> PolicyEngine {
        PolicyEngine::new(admin, llm, EngineConfig::default())
    }

    fn ctx(action: Action, resource: &str) -> DecisionContext {
        let mut c = DecisionContext::new("a1", action, resource);
        // Pin the hour so cache fingerprints are stable inside one test.
        c.time = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        c
    }

    fn rules_body(permissions: Vec<PolicyRule>) -> PolicyBody {
        PolicyBody::Rules(RuleSet {
            permissions,
            prohibitions: vec![],
        })
    }

    async fn add_text_policy(
        admin: &PolicyAdministrator,
        name: &str,
        priority: i32,
        body: &str,
    ) {
        admin
            .add(
                None,
                name,
                PolicyBody::Text(body.to_string()),
                Some(PolicyMetadata::new(priority)),
                None,
            )
            .await;
    }

    #[tokio::test]
    async fn test_no_applicable_policy_is_indeterminate() {
        let mock = Arc::new(MockLlm::new());
        let admin = Arc::new(PolicyAdministrator::new());
        let engine = engine_with(mock.clone(), admin);

        let d = engine.decide(&ctx(Action::Read, "tool:x")).await;
        assert_eq!(d.decision, Effect::Indeterminate);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_structured_rules_skip_llm() {
        let mock = Arc::new(MockLlm::new());
        let admin = Arc::new(PolicyAdministrator::new());
        admin
            .add(
                None,
                "tool-reads",
                rules_body(vec![PolicyRule {
                    actions: vec![Action::Execute],
                    resource_patterns: vec!["^tool:".into()],
                    ..Default::default()
                }]),
                None,
                None,
            )
            .await;
        let engine = engine_with(mock.clone(), admin);

        let d = engine.decide(&ctx(Action::Execute, "tool:read_file")).await;
        assert_eq!(d.decision, Effect::Permit);
        assert_eq!(mock.call_count(), 0, "deterministic rule must not call llm");
    }

    #[tokio::test]
    async fn test_text_policy_falls_through_to_llm() {
        let mock = Arc::new(
            MockLlm::new().with_trigger(
                "customer",
                r#"{"decision": "DENY", "reason": "customer data needs clearance", "confidence": 0.95, "riskLevel": "HIGH"}"#,
            ),
        );
        let admin = Arc::new(PolicyAdministrator::new());
        add_text_policy(&admin, "customer-data-policy", 100, "customer reads need clearance 3").await;
        let engine = engine_with(mock.clone(), admin);

        let d = engine.decide(&ctx(Action::Read, "/customer/db")).await;
        assert_eq!(d.decision, Effect::Deny);
        assert_eq!(d.reason, "customer data needs clearance");
        assert_eq!(d.risk_level, RiskLevel::High);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_llm_json_synthesizes_indeterminate() {
        let mock = Arc::new(MockLlm::new().with_default("I'd rather not say."));
        let admin = Arc::new(PolicyAdministrator::new());
        add_text_policy(&admin, "vague", 0, "do the right thing").await;
        let engine = engine_with(mock, admin);

        let d = engine.decide(&ctx(Action::Read, "tool:x")).await;
        assert_eq!(d.decision, Effect::Indeterminate);
        assert_eq!(d.risk_level, RiskLevel::High);
        assert!(d.obligations.contains(&"manual-review".to_string()));
        assert!(d.metadata.contains_key("parseError"));
    }

    #[tokio::test]
    async fn test_llm_error_flags_ai_error() {
        let admin = Arc::new(PolicyAdministrator::new());
        add_text_policy(&admin, "p", 0, "anything").await;
        let engine = engine_with(Arc::new(FailingLlm), admin);

        let d = engine.decide(&ctx(Action::Read, "tool:x")).await;
        assert_eq!(d.decision, Effect::Indeterminate);
        assert_eq!(d.risk_level, RiskLevel::High);
        assert!(d.metadata.contains_key("aiError"));
    }

    #[tokio::test]
    async fn test_cache_prevents_second_llm_call() {
        let mock = Arc::new(MockLlm::new().with_default(
            r#"{"decision": "PERMIT", "reason": "fine", "confidence": 0.9}"#,
        ));
        let admin = Arc::new(PolicyAdministrator::new());
        add_text_policy(&admin, "p", 0, "reads are fine").await;
        let engine = engine_with(mock.clone(), admin);

        let c = ctx(Action::Read, "tool:read_file");
        let first = engine.decide(&c).await;
        let second = engine.decide(&c).await;

        assert_eq!(mock.call_count(), 1, "second decision must come from cache");
        assert_eq!(first.decision, second.decision);
        assert_eq!(first.reason, second.reason);
        assert_eq!(first.constraints, second.constraints);
        assert_eq!(first.obligations, second.obligations);
    }

    #[tokio::test]
    async fn test_policy_update_invalidates_cache_key() {
        let mock = Arc::new(MockLlm::new().with_default(
            r#"{"decision": "PERMIT", "reason": "fine", "confidence": 0.9}"#,
        ));
        let admin = Arc::new(PolicyAdministrator::new());
        let id = admin
            .add(
                None,
                "p",
                PolicyBody::Text("v1".into()),
                None,
                None,
            )
            .await;
        let engine = engine_with(mock.clone(), admin.clone());

        let c = ctx(Action::Read, "tool:x");
        engine.decide(&c).await;
        admin
            .update(&id, PolicyBody::Text("v2".into()), None)
            .await
            .unwrap();
        engine.decide(&c).await;

        assert_eq!(
            mock.call_count(),
            2,
            "new policy version must miss the cache"
        );
    }

    #[tokio::test]
    async fn test_conflict_strict_for_secret_resource() {
        let mock = Arc::new(
            MockLlm::new()
                .with_trigger(
                    "permissive-policy",
                    r#"{"decision": "PERMIT", "reason": "open by default", "confidence": 0.9}"#,
                )
                .with_trigger(
                    "restrictive-policy",
                    r#"{"decision": "DENY", "reason": "secrets are closed", "confidence": 0.9}"#,
                ),
        );
        let admin = Arc::new(PolicyAdministrator::new());
        add_text_policy(&admin, "permissive-policy", 50, "most things are fine").await;
        add_text_policy(&admin, "restrictive-policy", 50, "secret material is denied").await;
        let engine = engine_with(mock, admin);

        let d = engine.decide(&ctx(Action::Read, "/vault/secret/api-keys")).await;
        assert_eq!(d.decision, Effect::Deny);
        assert_eq!(d.metadata["conflictResolution"], "strict");
        assert_eq!(
            d.metadata["conflictingPolicies"].as_array().unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_determinism_for_same_llm_output() {
        let admin = Arc::new(PolicyAdministrator::new());
        add_text_policy(&admin, "p", 0, "anything").await;
        let mock = Arc::new(MockLlm::new().with_default(
            r#"{"decision": "DENY", "reason": "stable", "confidence": 0.7}"#,
        ));
        let engine = engine_with(mock, admin);

        let c = ctx(Action::Read, "tool:x");
        let first = engine.decide(&c).await;
        engine.clear_cache();
        let second = engine.decide(&c).await;

        assert_eq!(first.decision, second.decision);
        assert_eq!(first.reason, second.reason);
        assert_eq!(first.confidence, second.confidence);
    }

    #[test]
    fn test_parse_verdict_validation() {
        assert!(parse_verdict(r#"{"decision": "PERMIT", "reason": "ok", "confidence": 0.9}"#).is_ok());
        // Unknown decision value
        assert!(parse_verdict(r#"{"decision": "MAYBE", "reason": "ok", "confidence": 0.9}"#).is_err());
        // Empty reason
        assert!(parse_verdict(r#"{"decision": "PERMIT", "reason": " ", "confidence": 0.9}"#).is_err());
        // Confidence out of range
        assert!(parse_verdict(r#"{"decision": "PERMIT", "reason": "ok", "confidence": 1.5}"#).is_err());
        // Missing confidence
        assert!(parse_verdict(r#"{"decision": "PERMIT", "reason": "ok"}"#).is_err());
    }

    #[test]
    fn test_build_prompt_substitutes_fields() {
        let policy = Policy {
            id: "p1".into(),
            name: "customer-data-policy".into(),
            body: PolicyBody::Text("customer reads need clearance".into()),
            metadata: PolicyMetadata::new(0),
            applicability: Applicability::default(),
        };
        let prompt = build_prompt(&policy, &ctx(Action::Read, "/customer/db"));
        assert!(prompt.contains("customer-data-policy"));
        assert!(prompt.contains("customer reads need clearance"));
        assert!(prompt.contains("- agent: a1"));
        assert!(prompt.contains("- action: read"));
        assert!(prompt.contains("- resource: /customer/db"));
        assert!(!prompt.contains("{policy_name}"));
    }
}
