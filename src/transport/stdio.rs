//! Line-delimited JSON-RPC over stdin/stdout.
//!
//! One implicit session for the process. Requests are handled in arrival
//! order; responses are written whole lines through a single writer so
//! partial lines never interleave. Diagnostics go to stderr only (the
//! tracing subscriber is configured there by `main`).

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::proxy::AppState;
use crate::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let session = state.sessions.create(
        std::env::var("AGENT_ID").ok(),
        std::env::var("AGENT_TYPE").ok(),
        std::env::var("AGENT_METADATA").ok(),
        None,
    );
    tracing::info!(session = %session.id, "stdio transport ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
            Err(e) => {
                // Malformed input: parse error to the caller, no audit.
                tracing::debug!(error = %e, "unparsable request line");
                Some(JsonRpcResponse::failure(
                    Value::Null,
                    JsonRpcError::parse_error(),
                ))
            }
            Ok(request) if request.is_notification() => {
                let _ = state
                    .handle(&request.method, request.params, &session, None)
                    .await;
                None
            }
            Ok(request) => {
                let id = request.id.clone().unwrap_or(Value::Null);
                let outcome = state
                    .handle(&request.method, request.params, &session, request.id)
                    .await;
                Some(JsonRpcResponse::from_outcome(id, outcome))
            }
        };

        if let Some(response) = response {
            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    tracing::info!("stdin closed, stdio transport stopping");
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;

    #[test]
    fn test_error_outcome_maps_to_jsonrpc_error() {
        let resp = JsonRpcResponse::from_outcome(
            serde_json::json!(7),
            Err(AppError::PolicyDenied {
                policy: "p".into(),
                reason: "nope".into(),
            }),
        );
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32000);
        assert!(err.message.contains("nope"));
        assert_eq!(resp.id, serde_json::json!(7));
    }

    #[test]
    fn test_success_outcome_maps_to_result() {
        let resp = JsonRpcResponse::from_outcome(
            serde_json::json!("abc"),
            Ok(serde_json::json!({"ok": true})),
        );
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["ok"], true);
    }
}
