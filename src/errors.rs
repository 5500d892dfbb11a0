use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("policy denied: {reason}")]
    PolicyDenied { policy: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    /// Upstream failed in a way the caller may retry (crash mid-request,
    /// cancelled in-flight request).
    #[error("upstream unavailable: {0}")]
    UpstreamRetriable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("session not initialized")]
    NotInitialized,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// JSON-RPC 2.0 error code for this error.
    ///
    /// Standard codes where they exist; implementation-defined codes in the
    /// reserved -32000..-32099 range otherwise.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            AppError::Validation(_) => -32600,
            AppError::MethodNotFound(_) => -32601,
            AppError::PolicyDenied { .. } => -32000,
            AppError::RateLimitExceeded => -32001,
            AppError::NotInitialized => -32002,
            AppError::Timeout(_) => -32003,
            AppError::UpstreamRetriable(_) => -32004,
            AppError::Upstream(_) => -32005,
            AppError::Llm(_) => -32006,
            AppError::Configuration(_) => -32007,
            AppError::Network(_) => -32008,
            AppError::Internal(_) => -32603,
        }
    }

    /// True when the caller may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamRetriable(_) | AppError::Timeout(_) | AppError::Network(_)
        )
    }

    /// Convert into a JSON-RPC error object (`code`, `message`, `data`).
    pub fn to_jsonrpc_error(&self) -> serde_json::Value {
        let mut data = json!({ "retriable": self.is_retriable() });
        if let AppError::PolicyDenied { policy, .. } = self {
            data["policy"] = json!(policy);
        }
        json!({
            "code": self.jsonrpc_code(),
            "message": self.to_string(),
            "data": data,
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::PolicyDenied { policy, reason } => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "policy_denied",
                format!("request blocked by policy '{}': {}", policy, reason),
            ),
            AppError::Configuration(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                "bad_configuration",
                e.clone(),
            ),
            AppError::Llm(e) => (
                StatusCode::BAD_GATEWAY,
                "llm_error",
                "llm_failed",
                e.clone(),
            ),
            AppError::Upstream(e) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "upstream_failed",
                e.clone(),
            ),
            AppError::UpstreamRetriable(e) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "upstream_unavailable",
                e.clone(),
            ),
            AppError::Validation(e) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "validation_failed",
                e.clone(),
            ),
            AppError::Timeout(e) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                "deadline_exceeded",
                e.clone(),
            ),
            AppError::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limit_exceeded",
                "rate limit exceeded".to_string(),
            ),
            AppError::NotInitialized => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "not_initialized",
                "initialize must complete before other requests".to_string(),
            ),
            AppError::MethodNotFound(m) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "method_not_found",
                format!("method not found: {}", m),
            ),
            AppError::Network(e) => (
                StatusCode::BAD_GATEWAY,
                "network_error",
                "network_failed",
                e.clone(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        // Rate-limited callers get a hint for when to come back
        if matches!(self, AppError::RateLimitExceeded) {
            response
                .headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("1"));
        }

        response
    }
}

// ── Tests ────────────────────────────────────────────────────
