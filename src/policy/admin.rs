//! In-memory policy catalog.
//!
//! The administrator owns every policy: registration, versioned updates,
//! status changes, removal, and the priority-ordered active view the
//! engine evaluates against. The lexical analysis helper feeds the
//! dashboard; it never affects enforcement.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::context::DecisionContext;
use crate::errors::AppError;
use crate::policy::model::{
    Applicability, Policy, PolicyBody, PolicyMetadata, PolicyRevision, PolicyStatus,
};

pub struct PolicyAdministrator {
    policies: RwLock<HashMap<String, Policy>>,
}

impl PolicyAdministrator {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Register a policy. When `id` is supplied and already present this is
    /// a no-op returning the existing id.
    pub async fn add(
        &self,
        id: Option<String>,
        name: impl Into<String>,
        body: PolicyBody,
        metadata: Option<PolicyMetadata>,
        applicability: Option<Applicability>,
    ) -> String {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut policies = self.policies.write().await;
        if policies.contains_key(&id) {
            return id;
        }
        let policy = Policy {
            id: id.clone(),
            name: name.into(),
            body,
            metadata: metadata.unwrap_or_else(|| PolicyMetadata::new(0)),
            applicability: applicability.unwrap_or_default(),
        };
        tracing::info!(policy = %policy.name, id = %id, "policy registered");
        policies.insert(id.clone(), policy);
        id
    }

    /// Replace the body, bumping the version and recording the revision.
    pub async fn update(
        &self,
        id: &str,
        body: PolicyBody,
        by: Option<&str>,
    ) -> Result<(), AppError> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(id)
            .ok_or_else(|| AppError::Validation(format!("unknown policy: {}", id)))?;
        policy.metadata.history.push(PolicyRevision {
            version: policy.metadata.version,
            updated_at: policy.metadata.updated_at,
            updated_by: policy.metadata.updated_by.clone(),
        });
        policy.body = body;
        policy.metadata.version += 1;
        policy.metadata.updated_at = Utc::now();
        policy.metadata.updated_by = by.map(String::from);
        tracing::info!(policy = %policy.name, version = policy.metadata.version, "policy updated");
        Ok(())
    }

    pub async fn change_status(
        &self,
        id: &str,
        status: PolicyStatus,
        by: Option<&str>,
    ) -> Result<(), AppError> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(id)
            .ok_or_else(|| AppError::Validation(format!("unknown policy: {}", id)))?;
        policy.metadata.status = status;
        policy.metadata.updated_at = Utc::now();
        policy.metadata.updated_by = by.map(String::from);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), AppError> {
        let mut policies = self.policies.write().await;
        policies
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::Validation(format!("unknown policy: {}", id)))
    }

    pub async fn get(&self, id: &str) -> Option<Policy> {
        self.policies.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Policy> {
        let mut all: Vec<Policy> = self.policies.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            b.metadata
                .priority
                .cmp(&a.metadata.priority)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    /// Active policies, priority descending with stable id order.
    pub async fn get_active(&self) -> Vec<Policy> {
        self.list()
            .await
            .into_iter()
            .filter(|p| p.metadata.status == PolicyStatus::Active)
            .collect()
    }

    /// The active policies whose applicability conditions match `ctx`.
    pub async fn applicable(&self, ctx: &DecisionContext) -> Vec<Policy> {
        self.get_active()
            .await
            .into_iter()
            .filter(|p| p.is_applicable(ctx))
            .collect()
    }
}

impl Default for PolicyAdministrator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Lexical analysis ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyWarning {
    pub kind: String,
    pub message: String,
}

const AMBIGUOUS_TERMS: &[&str] = &[
    "appropriate",
    "reasonable",
    "necessary",
    "as needed",
    "timely",
    "relevant",
    "sufficient",
];

const ALLOW_VERBS: &[&str] = &["allow", "allowed", "permit", "permitted", "may"];
const DENY_VERBS: &[&str] = &["deny", "denied", "prohibit", "prohibited", "must not", "never"];

/// Advisory lexical warnings over a natural-language policy body.
pub fn analyze(body: &str) -> Vec<PolicyWarning> {
    let lowered = body.to_lowercase();
    let mut warnings = Vec::new();

    for term in AMBIGUOUS_TERMS {
        if lowered.contains(term) {
            warnings.push(PolicyWarning {
                kind: "ambiguous-term".into(),
                message: format!("ambiguous term \"{}\" weakens enforceability", term),
            });
        }
    }

    // Clause-level contradiction sniffing: a subject word that appears in
    // both an allowing and a denying clause.
    let clauses: Vec<&str> = lowered
        .split(|c| c == '.' || c == ';' || c == '\n')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    let mut allowed_subjects = Vec::new();
    let mut denied_subjects = Vec::new();
    for clause in &clauses {
        let words: Vec<&str> = clause
            .split_whitespace()
            .filter(|w| w.len() > 3 && !ALLOW_VERBS.contains(w) && !DENY_VERBS.contains(w))
            .collect();
        if ALLOW_VERBS.iter().any(|v| clause.contains(v)) {
            allowed_subjects.extend(words.clone());
        }
        if DENY_VERBS.iter().any(|v| clause.contains(v)) {
            denied_subjects.extend(words);
        }
    }
    let mut contradicted: Vec<&str> = allowed_subjects
        .iter()
        .filter(|w| denied_subjects.contains(w))
        .copied()
        .collect();
    contradicted.sort_unstable();
    contradicted.dedup();
    for subject in contradicted {
        warnings.push(PolicyWarning {
            kind: "contradiction".into(),
            message: format!(
                "\"{}\" appears in both allowing and denying clauses",
                subject
            ),
        });
    }

    warnings
}

// ── Tests ────────────────────────────────────────────────────
