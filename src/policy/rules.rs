//! Deterministic evaluation of structured rule sets.
//!
//! Prohibitions are checked before permissions: a matching prohibition
//! denies outright, a matching permission permits with the rule's attached
//! constraints and obligations. No match defers to the LLM evaluator.

use crate::context::DecisionContext;
use crate::policy::model::{
    compile_pattern, context_clearance, context_hour, PolicyDecision, PolicyRule, RiskLevel,
    RuleCondition, RuleSet,
};

/// Evaluate a rule set against a context. `None` means no rule matched and
/// the caller should fall through to the LLM evaluator.
pub fn evaluate(rules: &RuleSet, ctx: &DecisionContext) -> Option<PolicyDecision> {
    for rule in &rules.prohibitions {
        if rule_matches(rule, ctx) {
            let reason = rule
                .reason
                .clone()
                .unwrap_or_else(|| format!("{} on {} is prohibited", ctx.action, ctx.resource));
            let mut decision = PolicyDecision::deny(reason);
            decision.risk_level = RiskLevel::High;
            decision.obligations = rule.obligations.clone();
            return Some(decision);
        }
    }

    for rule in &rules.permissions {
        if rule_matches(rule, ctx) {
            let reason = rule
                .reason
                .clone()
                .unwrap_or_else(|| format!("{} on {} is permitted", ctx.action, ctx.resource));
            let mut decision = PolicyDecision::permit(reason);
            decision.constraints = rule.constraints.clone();
            decision.obligations = rule.obligations.clone();
            return Some(decision);
        }
    }

    None
}

/// All of the rule's action, resource and ordered condition checks hold.
fn rule_matches(rule: &PolicyRule, ctx: &DecisionContext) -> bool {
    if !rule.actions.is_empty() && !rule.actions.contains(&ctx.action) {
        return false;
    }

    if !rule.resource_patterns.is_empty() {
        let any = rule.resource_patterns.iter().any(|p| match compile_pattern(p) {
            Some(re) => re.is_match(&ctx.resource),
            None => {
                tracing::warn!(pattern = %p, "invalid rule resource pattern");
                false
            }
        });
        if !any {
            return false;
        }
    }

    rule.conditions.iter().all(|c| condition_holds(c, ctx))
}

fn condition_holds(condition: &RuleCondition, ctx: &DecisionContext) -> bool {
    match condition {
        RuleCondition::TimeRange {
            start_hour,
            end_hour,
        } => {
            let hour = context_hour(ctx);
            (*start_hour..*end_hour).contains(&hour)
        }
        RuleCondition::AgentType { agent_types } => match &ctx.agent_type {
            Some(t) => agent_types.iter().any(|a| a == t),
            None => false,
        },
        RuleCondition::MinClearance { level } => match context_clearance(ctx) {
            Some(c) => c >= *level,
            None => false,
        },
        RuleCondition::BusinessHours => ctx
            .enrichment("time")
            .and_then(|t| t.get("isBusinessHours"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Action;
    use crate::policy::model::Effect;
    use serde_json::{json, Map, Value};

    fn ctx(action: Action, resource: &str) -> DecisionContext {
        DecisionContext::new("a1", action, resource)
    }

    fn with_time(mut ctx: DecisionContext, hour: u32, business: bool) -> DecisionContext {
        let mut enrichments = Map::new();
        enrichments.insert(
            "time".into(),
            json!({ "hour": hour, "isBusinessHours": business }),
        );
        ctx.environment
            .insert("enrichments".into(), Value::Object(enrichments));
        ctx
    }

    fn permit_rule(actions: Vec<Action>, patterns: Vec<&str>) -> PolicyRule {
        PolicyRule {
            actions,
            resource_patterns: patterns.into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_matching_permission_permits_with_constraints() {
        let mut rule = permit_rule(vec![Action::Read], vec!["^tool:"]);
        rule.constraints = vec!["data-anonymizer".into()];
        rule.obligations = vec!["audit-logger".into()];
        let rules = RuleSet {
            permissions: vec![rule],
            prohibitions: vec![],
        };

        let d = evaluate(&rules, &ctx(Action::Read, "tool:read_file")).unwrap();
        assert_eq!(d.decision, Effect::Permit);
        assert_eq!(d.constraints, vec!["data-anonymizer"]);
        assert_eq!(d.obligations, vec!["audit-logger"]);
        assert!((d.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prohibition_wins_over_permission() {
        let rules = RuleSet {
            permissions: vec![permit_rule(vec![], vec![])],
            prohibitions: vec![PolicyRule {
                resource_patterns: vec!["secret".into()],
                reason: Some("secrets are off limits".into()),
                ..Default::default()
            }],
        };

        let d = evaluate(&rules, &ctx(Action::Read, "/vault/secret/key")).unwrap();
        assert_eq!(d.decision, Effect::Deny);
        assert_eq!(d.reason, "secrets are off limits");
        assert_eq!(d.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_no_match_returns_none() {
        let rules = RuleSet {
            permissions: vec![permit_rule(vec![Action::Read], vec!["^gmail://"])],
            prohibitions: vec![],
        };
        assert!(evaluate(&rules, &ctx(Action::Execute, "tool:shell")).is_none());
    }

    #[test]
    fn test_action_filter() {
        let rules = RuleSet {
            permissions: vec![permit_rule(vec![Action::Read, Action::List], vec![])],
            prohibitions: vec![],
        };
        assert!(evaluate(&rules, &ctx(Action::Read, "x")).is_some());
        assert!(evaluate(&rules, &ctx(Action::List, "x")).is_some());
        assert!(evaluate(&rules, &ctx(Action::Delete, "x")).is_none());
    }

    #[test]
    fn test_time_range_condition() {
        let mut rule = permit_rule(vec![], vec![]);
        rule.conditions = vec![RuleCondition::TimeRange {
            start_hour: 9,
            end_hour: 18,
        }];
        let rules = RuleSet {
            permissions: vec![rule],
            prohibitions: vec![],
        };

        let daytime = with_time(ctx(Action::Read, "x"), 14, true);
        assert!(evaluate(&rules, &daytime).is_some());

        let night = with_time(ctx(Action::Read, "x"), 23, false);
        assert!(evaluate(&rules, &night).is_none());
    }

    #[test]
    fn test_business_hours_condition() {
        let mut rule = permit_rule(vec![], vec![]);
        rule.conditions = vec![RuleCondition::BusinessHours];
        let rules = RuleSet {
            permissions: vec![rule],
            prohibitions: vec![],
        };

        assert!(evaluate(&rules, &with_time(ctx(Action::Read, "x"), 10, true)).is_some());
        assert!(evaluate(&rules, &with_time(ctx(Action::Read, "x"), 10, false)).is_none());
        // No time enrichment at all: the condition cannot hold.
        assert!(evaluate(&rules, &ctx(Action::Read, "x")).is_none());
    }

    #[test]
    fn test_min_clearance_condition() {
        let mut rule = permit_rule(vec![], vec![]);
        rule.conditions = vec![RuleCondition::MinClearance { level: 3 }];
        let rules = RuleSet {
            permissions: vec![rule],
            prohibitions: vec![],
        };

        let mut cleared = ctx(Action::Read, "x");
        cleared.clearance_level = Some(3);
        assert!(evaluate(&rules, &cleared).is_some());

        let mut low = ctx(Action::Read, "x");
        low.clearance_level = Some(2);
        assert!(evaluate(&rules, &low).is_none());

        // Absent clearance never satisfies a minimum.
        assert!(evaluate(&rules, &ctx(Action::Read, "x")).is_none());
    }

    #[test]
    fn test_agent_type_condition() {
        let mut rule = permit_rule(vec![], vec![]);
        rule.conditions = vec![RuleCondition::AgentType {
            agent_types: vec!["assistant".into()],
        }];
        let rules = RuleSet {
            permissions: vec![rule],
            prohibitions: vec![],
        };

        let mut assistant = ctx(Action::Read, "x");
        assistant.agent_type = Some("assistant".into());
        assert!(evaluate(&rules, &assistant).is_some());
        assert!(evaluate(&rules, &ctx(Action::Read, "x")).is_none());
    }

    #[test]
    fn test_all_conditions_must_hold() {
        let mut rule = permit_rule(vec![], vec![]);
        rule.conditions = vec![
            RuleCondition::BusinessHours,
            RuleCondition::MinClearance { level: 2 },
        ];
        let rules = RuleSet {
            permissions: vec![rule],
            prohibitions: vec![],
        };

        let mut good = with_time(ctx(Action::Read, "x"), 10, true);
        good.clearance_level = Some(2);
        assert!(evaluate(&rules, &good).is_some());

        // Business hours hold but clearance is missing.
        let partial = with_time(ctx(Action::Read, "x"), 10, true);
        assert!(evaluate(&rules, &partial).is_none());
    }
}
