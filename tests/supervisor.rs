//! Supervisor behavior against real child processes: aggregation with
//! partial failure, crash recovery, and scheme-based routing.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;

use aegis::config::UpstreamSpec;
use aegis::upstream::{ServerState, Supervisor, UpstreamTimeouts};

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
        fanout_timeout: Duration::from_millis(800),
        restart_delay: Duration::from_millis(100),
    }
}

async fn wait_all(supervisor: &Supervisor, names: &[&str]) {
    for name in names {
        supervisor
            .get(name)
            .unwrap()
            .wait_connected(Duration::from_secs(3))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_aggregate_with_partial_failure() {
    let mut specs = BTreeMap::new();
    specs.insert("a".to_string(), mock_upstream(&[("MOCK_TOOLS", "t1")]));
    specs.insert("b".to_string(), mock_upstream(&[("MOCK_TOOLS", "t2")]));
    // Connected but slower than the fan-out timeout.
    specs.insert(
        "slow".to_string(),
        mock_upstream(&[("MOCK_TOOLS", "t3"), ("MOCK_SLEEP_MS", "5000")]),
    );

    let supervisor = Supervisor::new(&specs, fast_timeouts());
    supervisor.start_all().await;
    wait_all(&supervisor, &["a", "b", "slow"]).await;

    let result = supervisor.route("tools/list", None).await.unwrap();
    let mut names: Vec<String> = result["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a__t1", "b__t2"], "slow contributes nothing");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_prefixed_call_reaches_exactly_that_server() {
    let mut specs = BTreeMap::new();
    specs.insert("a".to_string(), mock_upstream(&[]));
    specs.insert("b".to_string(), mock_upstream(&[]));

    let supervisor = Supervisor::new(&specs, fast_timeouts());
    supervisor.start_all().await;
    wait_all(&supervisor, &["a", "b"]).await;

    let result = supervisor
        .route(
            "tools/call",
            Some(json!({"name": "b__whoami", "arguments": {"q": 1}})),
        )
        .await
        .unwrap();
    // The prefix is stripped before the request reaches the upstream.
    assert_eq!(result["echo"]["name"], "whoami");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crash_mid_request_then_restart() {
    let mut specs = BTreeMap::new();
    specs.insert("fs".to_string(), mock_upstream(&[]));

    let supervisor = Supervisor::new(&specs, fast_timeouts());
    supervisor.start_all().await;
    wait_all(&supervisor, &["fs"]).await;

    // `crash` makes the child exit before answering: the pending caller
    // gets a retriable error.
    let err = supervisor
        .route(
            "tools/call",
            Some(json!({"name": "fs__crash", "arguments": {}})),
        )
        .await
        .unwrap_err();
    assert!(err.is_retriable(), "expected retriable error, got {err:?}");

    // The supervisor respawns the child; after its ready marker it
    // accepts new requests.
    supervisor
        .get("fs")
        .unwrap()
        .wait_connected(Duration::from_secs(5))
        .await
        .unwrap();
    let result = supervisor
        .route(
            "tools/call",
            Some(json!({"name": "fs__read_file", "arguments": {}})),
        )
        .await
        .unwrap();
    assert_eq!(result["echo"]["name"], "read_file");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_resource_read_routes_by_uri_scheme() {
    let mut specs = BTreeMap::new();
    specs.insert(
        "gmail".to_string(),
        mock_upstream(&[("MOCK_SCHEME", "gmail")]),
    );
    specs.insert("files".to_string(), mock_upstream(&[("MOCK_SCHEME", "files")]));

    let supervisor = Supervisor::new(&specs, fast_timeouts());
    supervisor.start_all().await;
    wait_all(&supervisor, &["gmail", "files"]).await;

    let result = supervisor
        .route(
            "resources/read",
            Some(json!({"uri": "gmail://inbox/42"})),
        )
        .await
        .unwrap();
    assert_eq!(result["contents"][0]["uri"], "gmail://inbox/42");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_terminates_servers() {
    let mut specs = BTreeMap::new();
    specs.insert("fs".to_string(), mock_upstream(&[]));

    let supervisor = Supervisor::new(&specs, fast_timeouts());
    supervisor.start_all().await;
    wait_all(&supervisor, &["fs"]).await;

    supervisor.shutdown().await;
    // Shutdown suppresses restart; the server settles in Terminated.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let (_, state) = supervisor.statuses().into_iter().next().unwrap();
    assert_eq!(state, ServerState::Terminated);
}
