//! Fleet-level routing and aggregation over the upstream servers.
//!
//! Routing rules:
//! - `tools/call` with a `<server>__<tool>` name is rewritten (prefix
//!   stripped) and routed to that server; names without a known prefix go
//!   to the first connected server.
//! - `resources/read` routes by URI scheme (`gmail://…` → server `gmail`).
//! - `tools/list` / `resources/list` fan out to every connected server
//!   concurrently; failures are logged and contribute nothing.
//! - Everything else goes to the first connected server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::UpstreamSpec;
use crate::errors::AppError;
use crate::rpc::{
    namespaced_tool, split_namespaced, uri_scheme, CallToolParams, ListResourcesResult,
    ListToolsResult, ReadResourceParams,
};

use super::server::{ServerState, UpstreamServer, UpstreamTimeouts};

pub struct Supervisor {
    /// Config order; "first connected" follows this ordering.
    servers: Vec<UpstreamServer>,
    by_name: HashMap<String, UpstreamServer>,
    timeouts: UpstreamTimeouts,
}

impl Supervisor {
    pub fn new(specs: &BTreeMap<String, UpstreamSpec>, timeouts: UpstreamTimeouts) -> Self {
        let mut servers = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        for (name, spec) in specs {
            let server = UpstreamServer::new(name.clone(), spec.clone(), timeouts);
            by_name.insert(name.clone(), server.clone());
            servers.push(server);
        }
        Self {
            servers,
            by_name,
            timeouts,
        }
    }

    /// Spawn every configured server. Individual spawn failures are logged;
    /// the supervisor keeps running with whatever came up.
    pub async fn start_all(&self) {
        for server in &self.servers {
            if let Err(e) = server.start().await {
                tracing::error!(server = %server.name(), error = %e, "upstream failed to start");
            }
        }
    }

    pub async fn shutdown(&self) {
        for server in &self.servers {
            server.shutdown().await;
        }
    }

    pub fn get(&self, name: &str) -> Option<&UpstreamServer> {
        self.by_name.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Server states for the health surface.
    pub fn statuses(&self) -> Vec<(String, ServerState)> {
        self.servers
            .iter()
            .map(|s| (s.name().to_string(), s.state()))
            .collect()
    }

    fn connected(&self) -> Vec<UpstreamServer> {
        self.servers
            .iter()
            .filter(|s| s.is_connected())
            .cloned()
            .collect()
    }

    fn first_connected(&self) -> Result<UpstreamServer, AppError> {
        self.servers
            .iter()
            .find(|s| s.is_connected())
            .cloned()
            .ok_or_else(|| AppError::Upstream("no connected upstream servers".into()))
    }

    /// Route one request to the right upstream(s).
    pub async fn route(&self, method: &str, params: Option<Value>) -> Result<Value, AppError> {
        match method {
            "tools/list" => self.aggregate_tools().await,
            "resources/list" => self.aggregate_resources().await,
            "tools/call" => self.call_tool(params).await,
            "resources/read" => self.read_resource(params).await,
            _ => {
                let server = self.first_connected()?;
                server
                    .request(method, params, self.timeouts.request_timeout)
                    .await
            }
        }
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, AppError> {
        let params =
            params.ok_or_else(|| AppError::Validation("tools/call requires params".into()))?;
        let mut call: CallToolParams = serde_json::from_value(params)
            .map_err(|e| AppError::Validation(format!("invalid tools/call params: {}", e)))?;

        if let Some((server_name, tool)) = split_namespaced(&call.name) {
            if let Some(server) = self.by_name.get(server_name) {
                call.name = tool.to_string();
                let params = serde_json::to_value(&call)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
                return server
                    .request("tools/call", Some(params), self.timeouts.request_timeout)
                    .await;
            }
            // Unknown namespace: documented fallback to the first connected
            // server with the name left untouched.
            tracing::debug!(tool = %call.name, "unknown tool namespace, using first connected server");
        }

        let server = self.first_connected()?;
        let params =
            serde_json::to_value(&call).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        server
            .request("tools/call", Some(params), self.timeouts.request_timeout)
            .await
    }

    async fn read_resource(&self, params: Option<Value>) -> Result<Value, AppError> {
        let params =
            params.ok_or_else(|| AppError::Validation("resources/read requires params".into()))?;
        let read: ReadResourceParams = serde_json::from_value(params.clone())
            .map_err(|e| AppError::Validation(format!("invalid resources/read params: {}", e)))?;

        let server = match uri_scheme(&read.uri).and_then(|s| self.by_name.get(s)) {
            Some(server) if server.is_connected() => server.clone(),
            _ => self.first_connected()?,
        };
        server
            .request("resources/read", Some(params), self.timeouts.request_timeout)
            .await
    }

    /// Fan out `tools/list`, prefix each tool name with its server namespace
    /// exactly once, and return the union. Failed servers contribute nothing.
    async fn aggregate_tools(&self) -> Result<Value, AppError> {
        let servers = self.connected();
        let fanout = self.timeouts.fanout_timeout;
        let calls = servers.iter().map(|server| {
            let server = server.clone();
            async move {
                let outcome = server.request("tools/list", None, fanout).await;
                (server.name().to_string(), outcome)
            }
        });

        let mut tools = Vec::new();
        for (name, outcome) in futures::future::join_all(calls).await {
            match outcome.and_then(|v| {
                serde_json::from_value::<ListToolsResult>(v)
                    .map_err(|e| AppError::Upstream(format!("malformed tools/list: {}", e)))
            }) {
                Ok(listing) => {
                    for mut tool in listing.tools {
                        tool.name = namespaced_tool(&name, &tool.name);
                        tools.push(tool);
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "tools/list fan-out failed");
                }
            }
        }
        Ok(json!({ "tools": tools }))
    }

    /// Fan out `resources/list`. Resource URIs are already scheme-qualified
    /// and are returned as-is.
    async fn aggregate_resources(&self) -> Result<Value, AppError> {
        let servers = self.connected();
        let fanout = self.timeouts.fanout_timeout;
        let calls = servers.iter().map(|server| {
            let server = server.clone();
            async move {
                let outcome = server.request("resources/list", None, fanout).await;
                (server.name().to_string(), outcome)
            }
        });

        let mut resources = Vec::new();
        for (name, outcome) in futures::future::join_all(calls).await {
            match outcome.and_then(|v| {
                serde_json::from_value::<ListResourcesResult>(v)
                    .map_err(|e| AppError::Upstream(format!("malformed resources/list: {}", e)))
            }) {
                Ok(listing) => resources.extend(listing.resources),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "resources/list fan-out failed");
                }
            }
        }
        Ok(json!({ "resources": resources }))
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("servers", &self.servers.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────
