//! HTTP listener: the MCP endpoint (POST request / GET event stream /
//! DELETE session), liveness, policy CRUD and the audit query surface.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audit::{AuditQuery, Outcome};
use crate::errors::AppError;
use crate::policy::admin;
use crate::policy::model::{
    Applicability, Effect, PolicyBody, PolicyMetadata, PolicyStatus,
};
use crate::proxy::AppState;
use crate::rpc::{version_requires_streaming, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::transport::session::Session;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/mcp",
            get(mcp_stream).post(mcp_post).delete(mcp_delete),
        )
        .route("/health", get(health))
        .route("/policies", get(list_policies).post(create_policy))
        .route(
            "/policies/:id",
            get(get_policy).patch(update_policy).delete(delete_policy),
        )
        .route("/policies/:id/status", axum::routing::patch(change_status))
        .route("/policies/:id/analysis", get(analyze_policy))
        .route("/audit", get(query_audit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let gc = state.sessions.clone().spawn_gc(Duration::from_secs(60));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "aegis http transport listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    gc.abort();
    Ok(())
}

// ── Sessions from headers ────────────────────────────────────

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// The session named by the `session-id` header, or a fresh one captured
/// from the agent identity headers.
fn resolve_session(state: &AppState, headers: &HeaderMap) -> Arc<Session> {
    if let Some(existing) = header_str(headers, "session-id")
        .and_then(|id| state.sessions.get(&id))
    {
        return existing;
    }
    state.sessions.create(
        header_str(headers, "agent-id"),
        header_str(headers, "agent-type"),
        header_str(headers, "agent-metadata"),
        header_str(headers, "x-forwarded-for"),
    )
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert("session-id", value);
    }
    response
}

// ── MCP endpoint ─────────────────────────────────────────────

async fn mcp_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!(error = %e, "unparsable request body");
            // Malformed JSON: parse error to the caller, no audit.
            return Json(JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::parse_error(),
            ))
            .into_response();
        }
    };

    let session = resolve_session(&state, &headers);

    if request.is_notification() {
        let _ = state
            .handle(&request.method, request.params, &session, None)
            .await;
        return with_session_header(StatusCode::ACCEPTED.into_response(), &session.id);
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    let outcome = state
        .handle(&request.method, request.params, &session, request.id)
        .await;
    let response = JsonRpcResponse::from_outcome(id, outcome);

    let streaming = session
        .protocol_version()
        .map(|v| version_requires_streaming(&v))
        .unwrap_or(false);

    let http_response = if streaming {
        // One data: line carrying the response, then the stream ends.
        let payload = serde_json::to_string(&response).unwrap_or_default();
        let events = stream::once(async move { Ok::<_, Infallible>(Event::default().data(payload)) });
        Sse::new(events).into_response()
    } else {
        Json(response).into_response()
    };
    with_session_header(http_response, &session.id)
}

async fn mcp_stream(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let accepts_sse = header_str(&headers, "accept")
        .map(|a| a.contains("text/event-stream"))
        .unwrap_or(false);
    if !accepts_sse {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "stream attachment requires Accept: text/event-stream",
        )
            .into_response();
    }

    let session = resolve_session(&state, &headers);
    let hello = Event::default()
        .event("session")
        .data(json!({ "sessionId": session.id }).to_string());

    // The session event, then the channel stays open for server-initiated
    // notifications; keep-alives hold the connection.
    let events = stream::once(async move { Ok::<_, Infallible>(hello) })
        .chain(stream::pending());

    let response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    with_session_header(response, &session.id)
}

async fn mcp_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    match header_str(&headers, "session-id") {
        Some(id) if state.sessions.remove(&id) => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

// ── Liveness ─────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let upstreams: serde_json::Map<String, Value> = state
        .supervisor
        .statuses()
        .into_iter()
        .map(|(name, s)| (name, json!(s.as_str())))
        .collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "upstreams": upstreams,
        "sessions": state.sessions.len(),
    }))
}

// ── Policy CRUD ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePolicyRequest {
    name: String,
    body: PolicyBody,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    status: Option<PolicyStatus>,
    #[serde(default)]
    applicability: Option<Applicability>,
}

async fn create_policy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePolicyRequest>,
) -> (StatusCode, Json<Value>) {
    let mut metadata = PolicyMetadata::new(req.priority.unwrap_or(0));
    metadata.tags = req.tags;
    if let Some(status) = req.status {
        metadata.status = status;
    }
    let id = state
        .admin
        .add(req.id, req.name, req.body, Some(metadata), req.applicability)
        .await;
    (StatusCode::CREATED, Json(json!({ "id": id })))
}

async fn list_policies(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "policies": state.admin.list().await }))
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.admin.get(&id).await {
        Some(policy) => Json(policy).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePolicyRequest {
    body: PolicyBody,
    #[serde(default)]
    by: Option<String>,
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdatePolicyRequest>,
) -> Result<StatusCode, AppError> {
    state.admin.update(&id, req.body, req.by.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.admin.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeStatusRequest {
    status: PolicyStatus,
    #[serde(default)]
    by: Option<String>,
}

async fn change_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<StatusCode, AppError> {
    state
        .admin
        .change_status(&id, req.status, req.by.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn analyze_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.admin.get(&id).await {
        Some(policy) => {
            let warnings = admin::analyze(&policy.body.canonical());
            Json(json!({ "warnings": warnings })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ── Audit query ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuditQueryParams {
    from: Option<chrono::NaiveDate>,
    to: Option<chrono::NaiveDate>,
    agent: Option<String>,
    decision: Option<String>,
    outcome: Option<String>,
    limit: Option<usize>,
}

async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<Value>, AppError> {
    let decision = match params.decision.as_deref() {
        None => None,
        Some("PERMIT") => Some(Effect::Permit),
        Some("DENY") => Some(Effect::Deny),
        Some("INDETERMINATE") => Some(Effect::Indeterminate),
        Some(other) => {
            return Err(AppError::Validation(format!(
                "unknown decision filter: {}",
                other
            )))
        }
    };
    let outcome = match params.outcome.as_deref() {
        None => None,
        Some("SUCCESS") => Some(Outcome::Success),
        Some("FAILURE") => Some(Outcome::Failure),
        Some("ERROR") => Some(Outcome::Error),
        Some(other) => {
            return Err(AppError::Validation(format!(
                "unknown outcome filter: {}",
                other
            )))
        }
    };

    let entries = state
        .audit
        .query(&AuditQuery {
            from: params.from,
            to: params.to,
            agent: params.agent,
            decision,
            outcome,
            limit: params.limit,
        })
        .await?;
    Ok(Json(json!({ "entries": entries })))
}

// ── Tests ────────────────────────────────────────────────────
