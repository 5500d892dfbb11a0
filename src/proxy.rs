//! The coordinating proxy core.
//!
//! [`AppState`] owns every process-wide component; both transports call
//! [`AppState::handle`], which runs the fixed per-request pipeline:
//! enrich → decide → (PERMIT) forward → constraints → obligations →
//! audit write → respond. The audit write is durable before any response
//! leaves the proxy. DENY surfaces as a policy-violation error citing the
//! policy; INDETERMINATE fails closed for mutating actions and proceeds
//! with a manual-review obligation for list/read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::audit::{AuditEntry, AuditLog, Outcome, RequestMeta};
use crate::config::Config;
use crate::context::{Action, Collector, DecisionContext};
use crate::enforce::{ConstraintRegistry, ObligationRegistry};
use crate::errors::AppError;
use crate::llm::LlmProvider;
use crate::notify::{Notifier, OperationalEvent};
use crate::policy::admin::PolicyAdministrator;
use crate::policy::engine::{EngineConfig, PolicyEngine};
use crate::policy::model::{Effect, PolicyDecision};
use crate::rpc::{InitializeParams, PROTOCOL_VERSION};
use crate::transport::session::{Session, SessionTable, DEFAULT_IDLE_TIMEOUT};
use crate::upstream::{Supervisor, UpstreamTimeouts};

/// Per-stage deadline for the policy decision.
const DECISION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppState {
    pub config: Config,
    pub admin: Arc<PolicyAdministrator>,
    pub engine: PolicyEngine,
    pub collector: Collector,
    pub supervisor: Supervisor,
    pub constraints: ConstraintRegistry,
    pub obligations: Arc<ObligationRegistry>,
    pub audit: Arc<AuditLog>,
    pub sessions: Arc<SessionTable>,
    pub notifier: Notifier,
}

impl AppState {
    /// Wire every component from configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Arc<Self>> {
        let llm = crate::llm::from_config(&config.llm).map_err(|e| anyhow::anyhow!("{}", e))?;
        Self::new(config, llm, UpstreamTimeouts::default())
    }

    /// Wiring with an injected LLM provider and upstream timeouts; the
    /// integration tests use this to substitute the mock provider.
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmProvider>,
        timeouts: UpstreamTimeouts,
    ) -> anyhow::Result<Arc<Self>> {
        let production = std::env::var("AEGIS_ENV").as_deref() == Ok("production");
        let admin = Arc::new(PolicyAdministrator::new());
        let engine = PolicyEngine::new(
            admin.clone(),
            llm,
            EngineConfig {
                ai_threshold: config.ai_threshold,
                cache_enabled: config.cache.enabled,
                cache_capacity: config.cache.max_size,
                cache_ttl: Duration::from_secs(config.cache.ttl),
            },
        );
        let audit = Arc::new(AuditLog::new(&config.data_dir, config.learning_log)?);
        let notifier = Notifier::new(config.webhook_urls.clone());
        let supervisor = Supervisor::new(&config.mcp_servers, timeouts);
        let obligations = Arc::new(ObligationRegistry::with_builtins(
            audit.clone(),
            notifier.clone(),
        ));

        Ok(Arc::new(Self {
            admin,
            engine,
            collector: Collector::with_builtins(production),
            supervisor,
            constraints: ConstraintRegistry::with_builtins(vec![]),
            obligations,
            audit,
            sessions: Arc::new(SessionTable::new(DEFAULT_IDLE_TIMEOUT)),
            notifier,
            config,
        }))
    }

    /// Launch upstream servers.
    pub async fn start(&self) {
        self.supervisor.start_all().await;
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    /// The shared Handle entry point for both transports.
    pub async fn handle(
        &self,
        method: &str,
        params: Option<Value>,
        session: &Arc<Session>,
        request_id: Option<Value>,
    ) -> Result<Value, AppError> {
        let started = Instant::now();
        session.touch();

        match method {
            "initialize" => {
                return self
                    .handle_initialize(params, session, request_id, started)
                    .await
            }
            "ping" => {
                let ctx = self.build_context("ping", &params, session);
                self.write_audit(&ctx, None, Outcome::Success, "ping", session, &request_id, started)
                    .await;
                return Ok(json!({}));
            }
            m if m.starts_with("notifications/") => return Ok(Value::Null),
            _ => {}
        }

        // Ordering guarantee: initialize completes before anything else.
        if !session.is_initialized() {
            let ctx = self.build_context(method, &params, session);
            self.write_audit(&ctx, None, Outcome::Error, method, session, &request_id, started)
                .await;
            return Err(AppError::NotInitialized);
        }

        let ctx = self.build_context(method, &params, session);
        let ctx = self.collector.collect(ctx).await;

        let decision =
            match tokio::time::timeout(DECISION_TIMEOUT, self.engine.decide(&ctx)).await {
                Ok(decision) => decision,
                Err(_) => {
                    let err = AppError::Timeout("policy decision deadline exceeded".into());
                    self.write_audit(&ctx, None, Outcome::Error, method, session, &request_id, started)
                        .await;
                    return Err(err);
                }
            };

        if self.config.learning_log {
            if let Err(e) = self.audit.append_learning(&ctx, &decision).await {
                tracing::warn!(error = %e, "learning snapshot failed");
            }
        }

        match decision.decision {
            Effect::Deny => {
                let policy = policy_name(&decision);
                self.notifier.emit(OperationalEvent::policy_violation(
                    &ctx.agent,
                    &policy,
                    &decision.reason,
                ));
                let err = AppError::PolicyDenied {
                    policy,
                    reason: decision.reason.clone(),
                };
                self.write_audit(
                    &ctx,
                    Some(decision),
                    Outcome::Failure,
                    method,
                    session,
                    &request_id,
                    started,
                )
                .await;
                return Err(err);
            }
            Effect::Indeterminate if ctx.action.is_mutating() => {
                // Fail closed: an unsettled verdict never reaches an
                // upstream for a state-changing action.
                let err = AppError::PolicyDenied {
                    policy: policy_name(&decision),
                    reason: format!("indeterminate decision: {}", decision.reason),
                };
                self.write_audit(
                    &ctx,
                    Some(decision),
                    Outcome::Failure,
                    method,
                    session,
                    &request_id,
                    started,
                )
                .await;
                return Err(err);
            }
            _ => {}
        }

        // Forward to the upstream fleet.
        let result = match self.supervisor.route(method, params).await {
            Ok(result) => result,
            Err(e) => {
                self.write_audit(
                    &ctx,
                    Some(decision),
                    Outcome::Error,
                    method,
                    session,
                    &request_id,
                    started,
                )
                .await;
                return Err(e);
            }
        };

        // Ordered constraint transforms.
        let result = match self
            .constraints
            .apply_all(&decision.constraints, result, &ctx)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, AppError::RateLimitExceeded) {
                    self.notifier.emit(OperationalEvent::rate_limit_exceeded(
                        &ctx.agent,
                        ctx.action.as_str(),
                    ));
                }
                self.write_audit(
                    &ctx,
                    Some(decision),
                    Outcome::Failure,
                    method,
                    session,
                    &request_id,
                    started,
                )
                .await;
                return Err(e);
            }
        };

        // Obligations fire in parallel once the response is assembled. The
        // request-level audit below covers the audit-logger obligation, so
        // it is not dispatched twice.
        let mut obligation_decision = decision.clone();
        obligation_decision
            .obligations
            .retain(|o| !o.to_lowercase().contains("audit"));
        if !obligation_decision.obligations.is_empty() {
            let registry = self.obligations.clone();
            let ctx_for_obligations = ctx.clone();
            tokio::spawn(async move {
                registry
                    .run_all(&ctx_for_obligations, &obligation_decision)
                    .await;
            });
        }

        // Audit durability precedes response emission.
        self.write_audit(
            &ctx,
            Some(decision),
            Outcome::Success,
            method,
            session,
            &request_id,
            started,
        )
        .await;
        Ok(result)
    }

    async fn handle_initialize(
        &self,
        params: Option<Value>,
        session: &Arc<Session>,
        request_id: Option<Value>,
        started: Instant,
    ) -> Result<Value, AppError> {
        let requested = params
            .as_ref()
            .and_then(|p| serde_json::from_value::<InitializeParams>(p.clone()).ok())
            .map(|p| p.protocol_version)
            .unwrap_or_else(|| PROTOCOL_VERSION.to_string());
        session.mark_initialized(&requested);

        let ctx = self.build_context("initialize", &params, session);
        self.write_audit(
            &ctx,
            None,
            Outcome::Success,
            "initialize",
            session,
            &request_id,
            started,
        )
        .await;

        Ok(json!({
            "protocolVersion": requested,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": {},
                "prompts": {},
            },
            "serverInfo": {
                "name": "aegis",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }))
    }

    /// Base context from session identity and the request itself; the
    /// collector decorates it afterwards.
    fn build_context(
        &self,
        method: &str,
        params: &Option<Value>,
        session: &Arc<Session>,
    ) -> DecisionContext {
        let action = Action::from_method(method);
        let resource = match method {
            "tools/call" => params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .map(|name| format!("tool:{}", name))
                .unwrap_or_else(|| "tool:unknown".to_string()),
            "resources/read" => params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
                .unwrap_or("resource:unknown")
                .to_string(),
            other => other.to_string(),
        };

        let mut ctx = DecisionContext::new(
            session.agent_id.clone().unwrap_or_else(|| "anonymous".into()),
            action,
            resource,
        );
        ctx.agent_type = session.agent_type.clone();
        ctx.purpose = params
            .as_ref()
            .and_then(|p| p.get("purpose"))
            .and_then(Value::as_str)
            .map(str::to_string);
        ctx.environment
            .insert("sessionId".into(), json!(session.id));
        ctx.environment.insert("method".into(), json!(method));
        if let Some(meta) = &session.agent_metadata {
            ctx.environment.insert("agentMetadata".into(), json!(meta));
        }
        if let Some(ip) = &session.client_ip {
            ctx.environment.insert("clientIp".into(), json!(ip));
        }
        if method == "tools/call" {
            if let Some(args) = params.as_ref().and_then(|p| p.get("arguments")) {
                ctx.environment.insert("toolArguments".into(), args.clone());
            }
        }
        ctx
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_audit(
        &self,
        ctx: &DecisionContext,
        decision: Option<PolicyDecision>,
        outcome: Outcome,
        method: &str,
        session: &Arc<Session>,
        request_id: &Option<Value>,
        started: Instant,
    ) {
        let entry = AuditEntry::new(
            ctx.clone(),
            decision,
            started.elapsed().as_millis() as u64,
            outcome,
            RequestMeta {
                method: method.to_string(),
                session_id: Some(session.id.clone()),
                request_id: request_id.clone(),
            },
        );
        if let Err(e) = self.audit.append(&entry).await {
            tracing::error!(error = %e, "audit append failed");
        }
    }
}

fn policy_name(decision: &PolicyDecision) -> String {
    decision
        .metadata
        .get("policyUsed")
        .and_then(Value::as_str)
        .unwrap_or("policy")
        .to_string()
}

// ── Tests ────────────────────────────────────────────────────
