//! End-to-end flows through the proxy core with a real child upstream
//! (the `mock-upstream` bin) and the in-memory LLM backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use aegis::audit::{AuditQuery, Outcome};
use aegis::config::{Config, UpstreamSpec};
use aegis::context::Action;
use aegis::errors::AppError;
use aegis::llm::MockLlm;
use aegis::policy::model::{Effect, PolicyBody, PolicyMetadata, PolicyRule, RuleSet};
use aegis::proxy::AppState;
use aegis::transport::Session;
use aegis::upstream::UpstreamTimeouts;

fn mock_upstream(extra_env: &[(&str, &str)]) -> UpstreamSpec {
    let mut env = BTreeMap::new();
    for (k, v) in extra_env {
        env.insert(k.to_string(), v.to_string());
    }
    UpstreamSpec {
        command: env!("CARGO_BIN_EXE_mock-upstream").to_string(),
        args: vec![],
        env,
    }
}

fn fast_timeouts() -> UpstreamTimeouts {
    UpstreamTimeouts {
        init_deadline: Duration::from_secs(3),
        request_timeout: Duration::from_secs(5),
        fanout_timeout: Duration::from_secs(2),
        restart_delay: Duration::from_millis(100),
    }
}

fn base_config(dir: &std::path::Path, servers: BTreeMap<String, UpstreamSpec>) -> Config {
    let mut cfg = Config::default();
    cfg.data_dir = dir.to_path_buf();
    cfg.mcp_servers = servers;
    cfg
}

/// A structured policy permitting everything on `tool`-shaped resources.
fn tool_permit_policy(constraints: Vec<&str>) -> PolicyBody {
    PolicyBody::Rules(RuleSet {
        permissions: vec![PolicyRule {
            actions: vec![],
            resource_patterns: vec!["^tool".into()],
            constraints: constraints.into_iter().map(String::from).collect(),
            ..Default::default()
        }],
        prohibitions: vec![],
    })
}

async fn start_state(
    dir: &std::path::Path,
    servers: BTreeMap<String, UpstreamSpec>,
    mock: Arc<MockLlm>,
) -> Arc<AppState> {
    let state = AppState::new(base_config(dir, servers), mock, fast_timeouts()).unwrap();
    state.start().await;
    for (name, _) in state.supervisor.statuses() {
        state
            .supervisor
            .get(&name)
            .unwrap()
            .wait_connected(Duration::from_secs(3))
            .await
            .unwrap();
    }
    state
}

async fn initialized_session(state: &Arc<AppState>) -> Arc<Session> {
    let session = state
        .sessions
        .create(Some("a1".into()), Some("assistant".into()), None, None);
    state
        .handle(
            "initialize",
            Some(json!({"protocolVersion": "2025-03-26", "capabilities": {}})),
            &session,
            Some(json!(0)),
        )
        .await
        .unwrap();
    session
}

/// Guard against the (rare) case of a test spanning a clock-hour boundary,
/// which would split the decision-cache key.
async fn avoid_hour_boundary() {
    use chrono::Timelike;
    let now = chrono::Utc::now();
    if now.minute() == 59 && now.second() >= 57 {
        tokio::time::sleep(Duration::from_secs(4)).await;
    }
}

#[tokio::test]
async fn test_happy_permit_through_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert("fs".to_string(), mock_upstream(&[("MOCK_TOOLS", "read_file")]));
    let mock = Arc::new(MockLlm::new());
    let state = start_state(dir.path(), servers, mock.clone()).await;

    state
        .admin
        .add(
            None,
            "default-policy",
            tool_permit_policy(vec![]),
            Some(PolicyMetadata::new(1)),
            None,
        )
        .await;

    let session = initialized_session(&state).await;

    // Aggregated listing carries the namespace prefix exactly once.
    let listing = state
        .handle("tools/list", None, &session, Some(json!(1)))
        .await
        .unwrap();
    let names: Vec<&str> = listing["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["fs__read_file"]);

    // The call is forwarded with the prefix stripped and the upstream
    // content returned unchanged.
    let result = state
        .handle(
            "tools/call",
            Some(json!({"name": "fs__read_file", "arguments": {"path": "/tmp/a"}})),
            &session,
            Some(json!(2)),
        )
        .await
        .unwrap();
    assert_eq!(result["echo"]["name"], "read_file");
    assert_eq!(result["echo"]["arguments"]["path"], "/tmp/a");
    assert_eq!(result["content"][0]["text"], "read_file executed");

    // Structured policy: the LLM is never consulted.
    assert_eq!(mock.call_count(), 0);

    // One audit line per request, PERMIT with outcome SUCCESS for the call.
    let entries = state.audit.query(&AuditQuery::default()).await.unwrap();
    let call_entries: Vec<_> = entries
        .iter()
        .filter(|e| e.request.method == "tools/call")
        .collect();
    assert_eq!(call_entries.len(), 1);
    assert_eq!(call_entries[0].outcome, Outcome::Success);
    assert_eq!(
        call_entries[0].decision.as_ref().unwrap().decision,
        Effect::Permit
    );

    state.shutdown().await;
}

#[tokio::test]
async fn test_deny_blocks_forward_and_audits_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert("fs".to_string(), mock_upstream(&[]));
    let mock = Arc::new(MockLlm::new().with_trigger(
        "/customer/db",
        r#"{"decision": "DENY", "reason": "customer-data-policy: requires business hours and clearance 3", "confidence": 0.95, "riskLevel": "HIGH"}"#,
    ));
    let state = start_state(dir.path(), servers, mock.clone()).await;

    state
        .admin
        .add(
            None,
            "customer-data-policy",
            PolicyBody::Text(
                "customer resources require business hours and clearance level 3 or higher".into(),
            ),
            Some(PolicyMetadata::new(100)),
            None,
        )
        .await;

    let session = initialized_session(&state).await;
    let err = state
        .handle(
            "tools/call",
            Some(json!({"name": "fs__read_file", "arguments": {"path": "/customer/db"}})),
            &session,
            Some(json!(1)),
        )
        .await
        .unwrap_err();

    match err {
        AppError::PolicyDenied { policy, reason } => {
            assert_eq!(policy, "customer-data-policy");
            assert!(reason.contains("clearance"));
        }
        other => panic!("expected PolicyDenied, got {other:?}"),
    }

    let entries = state.audit.query(&AuditQuery::default()).await.unwrap();
    let call_entry = entries
        .iter()
        .find(|e| e.request.method == "tools/call")
        .unwrap();
    assert_eq!(call_entry.outcome, Outcome::Failure);
    assert_eq!(
        call_entry.decision.as_ref().unwrap().decision,
        Effect::Deny
    );

    state.shutdown().await;
}

#[tokio::test]
async fn test_cache_hit_issues_one_llm_call() {
    avoid_hour_boundary().await;

    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert("fs".to_string(), mock_upstream(&[]));
    let mock = Arc::new(MockLlm::new().with_default(
        r#"{"decision": "PERMIT", "reason": "reads of local tools are fine", "confidence": 0.9}"#,
    ));
    let state = start_state(dir.path(), servers, mock.clone()).await;

    state
        .admin
        .add(
            None,
            "default-policy",
            PolicyBody::Text("reads of local tool resources are allowed".into()),
            None,
            None,
        )
        .await;

    let session = initialized_session(&state).await;
    let params = json!({"name": "fs__read_file", "arguments": {"path": "/tmp/a"}});

    let first = state
        .handle("tools/call", Some(params.clone()), &session, Some(json!(1)))
        .await
        .unwrap();
    let second = state
        .handle("tools/call", Some(params), &session, Some(json!(2)))
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 1, "second decision must be a cache hit");
    assert_eq!(first["echo"], second["echo"]);

    // Identical decisions in both audit lines, one line per request.
    let entries = state.audit.query(&AuditQuery::default()).await.unwrap();
    let call_entries: Vec<_> = entries
        .iter()
        .filter(|e| e.request.method == "tools/call")
        .collect();
    assert_eq!(call_entries.len(), 2);
    let d1 = call_entries[0].decision.as_ref().unwrap();
    let d2 = call_entries[1].decision.as_ref().unwrap();
    assert_eq!(d1.decision, d2.decision);
    assert_eq!(d1.reason, d2.reason);
    assert_eq!(d1.constraints, d2.constraints);
    assert_eq!(d1.obligations, d2.obligations);

    state.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_constraint_fails_third_call() {
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert("fs".to_string(), mock_upstream(&[]));
    let mock = Arc::new(MockLlm::new());
    let state = start_state(dir.path(), servers, mock).await;

    state
        .admin
        .add(
            None,
            "throttled",
            tool_permit_policy(vec!["rate limit: 2 per second"]),
            Some(PolicyMetadata::new(1)),
            None,
        )
        .await;

    let session = initialized_session(&state).await;
    let params = json!({"name": "fs__read_file", "arguments": {}});

    let mut outcomes = Vec::new();
    for i in 0..3 {
        outcomes.push(
            state
                .handle("tools/call", Some(params.clone()), &session, Some(json!(i)))
                .await,
        );
    }

    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_ok());
    assert!(matches!(
        outcomes[2].as_ref().unwrap_err(),
        AppError::RateLimitExceeded
    ));

    let entries = state.audit.query(&AuditQuery::default()).await.unwrap();
    let call_outcomes: Vec<Outcome> = entries
        .iter()
        .filter(|e| e.request.method == "tools/call")
        .map(|e| e.outcome)
        .collect();
    assert_eq!(
        call_outcomes,
        vec![Outcome::Success, Outcome::Success, Outcome::Failure]
    );

    state.shutdown().await;
}

#[tokio::test]
async fn test_anonymizer_constraint_transforms_response() {
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert("fs".to_string(), mock_upstream(&[]));
    let state = start_state(dir.path(), servers, Arc::new(MockLlm::new())).await;

    state
        .admin
        .add(
            None,
            "anonymized-reads",
            tool_permit_policy(vec!["data-anonymizer"]),
            None,
            None,
        )
        .await;

    let session = initialized_session(&state).await;
    // The mock upstream echoes arguments back; PII in the arguments must
    // come back anonymized.
    let result = state
        .handle(
            "tools/call",
            Some(json!({
                "name": "fs__read_file",
                "arguments": {"name": "Alice Smith", "contact": "alice@example.com"}
            })),
            &session,
            Some(json!(1)),
        )
        .await
        .unwrap();

    assert_eq!(result["echo"]["arguments"]["name"], "[REDACTED]");
    assert_eq!(result["echo"]["arguments"]["contact"], "****@example.com");

    state.shutdown().await;
}

#[tokio::test]
async fn test_list_survives_indeterminate_with_manual_review() {
    // No policies registered: INDETERMINATE. Listing is non-mutating and
    // proceeds; the decision carries the manual-review obligation.
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert("fs".to_string(), mock_upstream(&[("MOCK_TOOLS", "read_file")]));
    let state = start_state(dir.path(), servers, Arc::new(MockLlm::new())).await;

    let session = initialized_session(&state).await;
    let listing = state
        .handle("tools/list", None, &session, Some(json!(1)))
        .await
        .unwrap();
    assert_eq!(listing["tools"].as_array().unwrap().len(), 1);

    let entries = state.audit.query(&AuditQuery::default()).await.unwrap();
    let list_entry = entries
        .iter()
        .find(|e| e.request.method == "tools/list")
        .unwrap();
    let decision = list_entry.decision.as_ref().unwrap();
    assert_eq!(decision.decision, Effect::Indeterminate);
    assert!(decision.obligations.contains(&"manual-review".to_string()));

    state.shutdown().await;
}

#[tokio::test]
async fn test_execute_fails_closed_without_policies() {
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert("fs".to_string(), mock_upstream(&[]));
    let state = start_state(dir.path(), servers, Arc::new(MockLlm::new())).await;

    let session = initialized_session(&state).await;
    let err = state
        .handle(
            "tools/call",
            Some(json!({"name": "fs__read_file", "arguments": {}})),
            &session,
            Some(json!(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PolicyDenied { .. }));

    state.shutdown().await;
}

#[tokio::test]
async fn test_context_action_mapping_matches_methods() {
    assert_eq!(Action::from_method("tools/call"), Action::Execute);
    assert_eq!(Action::from_method("tools/list"), Action::List);
    assert_eq!(Action::from_method("resources/read"), Action::Read);
}

#[tokio::test]
async fn test_resources_read_and_list_through_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    servers.insert(
        "gmail".to_string(),
        mock_upstream(&[("MOCK_SCHEME", "gmail")]),
    );
    let state = start_state(dir.path(), servers, Arc::new(MockLlm::new())).await;

    state
        .admin
        .add(
            None,
            "open-resources",
            PolicyBody::Rules(RuleSet {
                permissions: vec![PolicyRule::default()],
                prohibitions: vec![],
            }),
            None,
            None,
        )
        .await;

    let session = initialized_session(&state).await;

    let listing = state
        .handle("resources/list", None, &session, Some(json!(1)))
        .await
        .unwrap();
    // Resource URIs are already scheme-qualified and stay un-namespaced.
    assert_eq!(listing["resources"][0]["uri"], "gmail://item/1");

    let contents: Value = state
        .handle(
            "resources/read",
            Some(json!({"uri": "gmail://item/1"})),
            &session,
            Some(json!(2)),
        )
        .await
        .unwrap();
    assert_eq!(contents["contents"][0]["text"], "mock resource body");

    state.shutdown().await;
}
