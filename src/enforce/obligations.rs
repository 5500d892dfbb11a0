//! Obligation executors: named side-effects fired after a permitted
//! response has been assembled.
//!
//! Executors matching a decision's obligations run in parallel; a failure
//! is logged and never changes the caller's outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;

use crate::audit::{AuditEntry, AuditLog, Outcome, RequestMeta};
use crate::context::DecisionContext;
use crate::notify::{Notifier, OperationalEvent};
use crate::policy::model::PolicyDecision;

#[async_trait]
pub trait ObligationExecutor: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, obligation: &str) -> bool;
    async fn execute(
        &self,
        ctx: &DecisionContext,
        decision: &PolicyDecision,
    ) -> anyhow::Result<()>;
}

pub struct ObligationRegistry {
    executors: Vec<Arc<dyn ObligationExecutor>>,
}

impl ObligationRegistry {
    pub fn new() -> Self {
        Self {
            executors: Vec::new(),
        }
    }

    pub fn with_builtins(audit: Arc<AuditLog>, notifier: Notifier) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AuditObligation::new(audit)));
        registry.register(Arc::new(NotifyObligation::new(notifier)));
        registry.register(Arc::new(DataLifecycle::new()));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn ObligationExecutor>) {
        self.executors.push(executor);
    }

    /// Run every matching executor concurrently. Unknown obligations are
    /// logged; executor failures are logged and swallowed.
    pub async fn run_all(&self, ctx: &DecisionContext, decision: &PolicyDecision) {
        let runs = decision.obligations.iter().filter_map(|obligation| {
            match self
                .executors
                .iter()
                .find(|e| e.can_handle(obligation))
            {
                Some(executor) => {
                    let executor = executor.clone();
                    let obligation = obligation.clone();
                    let ctx = ctx.clone();
                    let decision = decision.clone();
                    Some(async move {
                        if let Err(e) = executor.execute(&ctx, &decision).await {
                            tracing::warn!(
                                obligation = %obligation,
                                executor = %executor.name(),
                                error = %e,
                                "obligation failed"
                            );
                        }
                    })
                }
                None => {
                    tracing::warn!(obligation = %obligation, "no executor registered");
                    None
                }
            }
        });
        futures::future::join_all(runs).await;
    }
}

impl Default for ObligationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── audit-logger ─────────────────────────────────────────────

/// Appends a decision-driven audit entry.
///
/// The request pipeline writes its own per-request entry; it strips the
/// `audit-logger` obligation before dispatching here so each request still
/// produces exactly one line. This executor carries the obligation for
/// standalone registry users.
pub struct AuditObligation {
    audit: Arc<AuditLog>,
}

impl AuditObligation {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl ObligationExecutor for AuditObligation {
    fn name(&self) -> &str {
        "audit-logger"
    }

    fn can_handle(&self, obligation: &str) -> bool {
        obligation.to_lowercase().contains("audit")
    }

    async fn execute(
        &self,
        ctx: &DecisionContext,
        decision: &PolicyDecision,
    ) -> anyhow::Result<()> {
        let entry = AuditEntry::new(
            ctx.clone(),
            Some(decision.clone()),
            0,
            Outcome::Success,
            RequestMeta {
                method: "obligation".into(),
                session_id: None,
                request_id: None,
            },
        );
        self.audit.append(&entry).await?;
        Ok(())
    }
}

// ── notifier ─────────────────────────────────────────────────

/// Emits an operational event carrying the context and decision.
pub struct NotifyObligation {
    notifier: Notifier,
}

impl NotifyObligation {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl ObligationExecutor for NotifyObligation {
    fn name(&self) -> &str {
        "notifier"
    }

    fn can_handle(&self, obligation: &str) -> bool {
        let lowered = obligation.to_lowercase();
        lowered.contains("notify") || lowered.contains("notif") || lowered.contains("review")
    }

    async fn execute(
        &self,
        ctx: &DecisionContext,
        decision: &PolicyDecision,
    ) -> anyhow::Result<()> {
        let details = serde_json::json!({
            "decision": decision.decision,
            "reason": decision.reason,
            "resource": ctx.resource,
            "action": ctx.action,
        });
        self.notifier
            .emit(OperationalEvent::obligation(&ctx.agent, &details));
        Ok(())
    }
}

// ── data-lifecycle ───────────────────────────────────────────

/// Records a deletion/retention marker for the touched resource. The
/// retention period comes from the resource classifier when present.
pub struct DataLifecycle {
    scheduled: DashMap<String, DateTime<Utc>>,
}

impl DataLifecycle {
    pub fn new() -> Self {
        Self {
            scheduled: DashMap::new(),
        }
    }

    /// Scheduled deletion instant for a resource, when one exists.
    pub fn scheduled_for(&self, resource: &str) -> Option<DateTime<Utc>> {
        self.scheduled.get(resource).map(|v| *v)
    }

    fn retention_days(ctx: &DecisionContext) -> i64 {
        ctx.enrichment("resource")
            .and_then(|r| r.get("retentionDays"))
            .and_then(Value::as_u64)
            .map(|d| d as i64)
            .unwrap_or(30)
    }
}

impl Default for DataLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObligationExecutor for DataLifecycle {
    fn name(&self) -> &str {
        "data-lifecycle"
    }

    fn can_handle(&self, obligation: &str) -> bool {
        let lowered = obligation.to_lowercase();
        lowered.contains("lifecycle") || lowered.contains("delet") || lowered.contains("retention")
    }

    async fn execute(
        &self,
        ctx: &DecisionContext,
        _decision: &PolicyDecision,
    ) -> anyhow::Result<()> {
        let delete_at = Utc::now() + Duration::days(Self::retention_days(ctx));
        tracing::info!(
            resource = %ctx.resource,
            delete_at = %delete_at,
            "deletion scheduled"
        );
        self.scheduled.insert(ctx.resource.clone(), delete_at);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::context::Action;
    use serde_json::json;

    fn ctx() -> DecisionContext {
        DecisionContext::new("a1", Action::Execute, "tool:read_file")
    }

    fn decision_with_obligations(obligations: Vec<&str>) -> PolicyDecision {
        let mut d = PolicyDecision::permit("ok");
        d.obligations = obligations.into_iter().map(String::from).collect();
        d
    }

    #[tokio::test]
    async fn test_audit_obligation_appends_entry() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path(), false).unwrap());
        let executor = AuditObligation::new(audit.clone());

        executor
            .execute(&ctx(), &PolicyDecision::permit("ok"))
            .await
            .unwrap();

        let entries = audit.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request.method, "obligation");
    }

    #[tokio::test]
    async fn test_lifecycle_schedules_from_retention_enrichment() {
        let executor = DataLifecycle::new();
        let mut c = ctx();
        let mut enrichments = serde_json::Map::new();
        enrichments.insert("resource".into(), json!({ "retentionDays": 7 }));
        c.environment
            .insert("enrichments".into(), Value::Object(enrichments));

        executor
            .execute(&c, &PolicyDecision::permit("ok"))
            .await
            .unwrap();

        let delete_at = executor.scheduled_for("tool:read_file").unwrap();
        let days = (delete_at - Utc::now()).num_days();
        assert!((6..=7).contains(&days));
    }

    #[tokio::test]
    async fn test_registry_runs_matching_executors() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path(), false).unwrap());
        let registry =
            ObligationRegistry::with_builtins(audit.clone(), Notifier::new(vec![]));

        let d = decision_with_obligations(vec!["audit-logger", "schedule deletion"]);
        registry.run_all(&ctx(), &d).await;

        let entries = audit.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_ignores_unknown_obligation() {
        let registry = ObligationRegistry::new();
        let d = decision_with_obligations(vec!["sacrifice a goat"]);
        // Nothing registered: logged and dropped, no panic.
        registry.run_all(&ctx(), &d).await;
    }

    #[tokio::test]
    async fn test_failing_executor_does_not_propagate() {
        struct Exploding;

        #[async_trait]
        impl ObligationExecutor for Exploding {
            fn name(&self) -> &str {
                "exploding"
            }
            fn can_handle(&self, o: &str) -> bool {
                o == "explode"
            }
            async fn execute(
                &self,
                _ctx: &DecisionContext,
                _decision: &PolicyDecision,
            ) -> anyhow::Result<()> {
                anyhow::bail!("boom")
            }
        }

        let mut registry = ObligationRegistry::new();
        registry.register(Arc::new(Exploding));
        let d = decision_with_obligations(vec!["explode"]);
        registry.run_all(&ctx(), &d).await;
    }

    #[tokio::test]
    async fn test_notify_obligation_handles_manual_review() {
        let executor = NotifyObligation::new(Notifier::new(vec![]));
        assert!(executor.can_handle("manual-review"));
        assert!(executor.can_handle("notify"));
        assert!(!executor.can_handle("audit-logger"));
        executor
            .execute(&ctx(), &PolicyDecision::indeterminate("unsure"))
            .await
            .unwrap();
    }
}
