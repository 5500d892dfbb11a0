//! Conflict resolution across multiple applicable policies.
//!
//! Strategies:
//! - `priority` (default) — highest-priority policy wins.
//! - `strict` — DENY > INDETERMINATE > PERMIT.
//! - `permissive` — PERMIT > INDETERMINATE > DENY.
//! - `consensus` — majority effect, ties broken by priority.
//!
//! Resolution is order-independent for a given strategy: winners are
//! selected by (priority, id) rather than input position.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::{Action, DecisionContext};
use crate::policy::model::{context_resource_tags, Effect, PolicyDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Priority,
    Strict,
    Permissive,
    Consensus,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Priority => "priority",
            Strategy::Strict => "strict",
            Strategy::Permissive => "permissive",
            Strategy::Consensus => "consensus",
        }
    }
}

/// One policy's contribution to conflict resolution.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub policy_id: String,
    pub policy_name: String,
    pub priority: i32,
    pub decision: PolicyDecision,
}

const SENSITIVE_TAGS: &[&str] = &["sensitive", "confidential", "secret"];

/// Pick the strategy suited to this context: strict for sensitive
/// resources and destructive actions, permissive for reads of non-private
/// data, priority otherwise.
pub fn suggest_strategy(ctx: &DecisionContext) -> Strategy {
    if matches!(ctx.action, Action::Delete | Action::Modify) {
        return Strategy::Strict;
    }

    let tags = context_resource_tags(ctx);
    let tagged_sensitive = tags
        .iter()
        .any(|t| SENSITIVE_TAGS.iter().any(|s| t.eq_ignore_ascii_case(s)));
    let named_sensitive = SENSITIVE_TAGS
        .iter()
        .any(|s| ctx.resource.to_lowercase().contains(s));
    if tagged_sensitive || named_sensitive {
        return Strategy::Strict;
    }

    if matches!(ctx.action, Action::Read | Action::List) {
        let sensitivity = ctx
            .enrichment("resource")
            .and_then(|r| r.get("sensitivity"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("high");
        if sensitivity == "low" || sensitivity == "medium" {
            return Strategy::Permissive;
        }
    }

    Strategy::Priority
}

/// Combine per-policy decisions into one.
///
/// With a single contribution the decision passes through annotated with
/// the policy that produced it. Disagreements are resolved by `strategy`
/// and the result is annotated with the conflicting policies and method.
pub fn resolve(mut contributions: Vec<Contribution>, strategy: Strategy) -> PolicyDecision {
    if contributions.is_empty() {
        return PolicyDecision::indeterminate("no applicable policy produced a decision");
    }

    // Deterministic ordering regardless of caller order.
    contributions.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.policy_id.cmp(&b.policy_id))
    });

    if contributions.len() == 1 {
        let c = contributions.remove(0);
        return c
            .decision
            .with_metadata("policyUsed", json!(c.policy_name));
    }

    let disagreement = contributions
        .iter()
        .any(|c| c.decision.decision != contributions[0].decision.decision);
    if !disagreement {
        let names: Vec<String> = contributions
            .iter()
            .map(|c| c.policy_name.clone())
            .collect();
        let c = contributions.remove(0);
        return c
            .decision
            .with_metadata("policyUsed", json!(names[0]))
            .with_metadata("agreeingPolicies", json!(names));
    }

    let winner_effect = match strategy {
        Strategy::Priority => contributions[0].decision.decision,
        Strategy::Strict => strongest(&contributions, &[
            Effect::Deny,
            Effect::Indeterminate,
            Effect::Permit,
        ]),
        Strategy::Permissive => strongest(&contributions, &[
            Effect::Permit,
            Effect::Indeterminate,
            Effect::Deny,
        ]),
        Strategy::Consensus => consensus_effect(&contributions),
    };

    // The highest-priority contribution with the winning effect carries the
    // reason, constraints and obligations.
    let winner = contributions
        .iter()
        .find(|c| c.decision.decision == winner_effect)
        .expect("winning effect present")
        .clone();

    let conflicting: Vec<serde_json::Value> = contributions
        .iter()
        .map(|c| {
            json!({
                "id": c.policy_id,
                "name": c.policy_name,
                "priority": c.priority,
                "decision": c.decision.decision,
            })
        })
        .collect();

    winner
        .decision
        .with_metadata("policyUsed", json!(winner.policy_name))
        .with_metadata("conflictingPolicies", json!(conflicting))
        .with_metadata("conflictResolution", json!(strategy.as_str()))
}

/// First effect in `order` that any contribution produced.
fn strongest(contributions: &[Contribution], order: &[Effect]) -> Effect {
    for effect in order {
        if contributions.iter().any(|c| c.decision.decision == *effect) {
            return *effect;
        }
    }
    Effect::Indeterminate
}

/// Majority effect; ties resolve to the effect of the highest-priority
/// contribution among the tied effects.
fn consensus_effect(contributions: &[Contribution]) -> Effect {
    let mut counts: Vec<(Effect, usize)> = Vec::new();
    for c in contributions {
        match counts.iter_mut().find(|(e, _)| *e == c.decision.decision) {
            Some((_, n)) => *n += 1,
            None => counts.push((c.decision.decision, 1)),
        }
    }
    let max = counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
    let tied: Vec<Effect> = counts
        .iter()
        .filter(|(_, n)| *n == max)
        .map(|(e, _)| *e)
        .collect();
    if tied.len() == 1 {
        return tied[0];
    }
    // contributions are already priority-sorted
    contributions
        .iter()
        .find(|c| tied.contains(&c.decision.decision))
        .map(|c| c.decision.decision)
        .unwrap_or(Effect::Indeterminate)
}

// ── Tests ────────────────────────────────────────────────────
