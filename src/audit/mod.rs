//! Append-only, day-partitioned audit store.
//!
//! One JSON line per entry in `<data_dir>/audit/audit-YYYY-MM-DD.jsonl`.
//! `append` is durable before it returns: a PERMIT response is never sent
//! before its audit line has been fsynced. The optional learning stream
//! writes decision snapshots next to the audit files. Audit exposes only
//! `append`/`query`; nothing in this module depends on enforcement.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::context::DecisionContext;
use crate::errors::AppError;
use crate::policy::model::{Effect, PolicyDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<serde_json::Value>,
}

/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub context: DecisionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<PolicyDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_used: Option<String>,
    pub processing_ms: u64,
    pub outcome: Outcome,
    pub request: RequestMeta,
}

impl AuditEntry {
    pub fn new(
        context: DecisionContext,
        decision: Option<PolicyDecision>,
        processing_ms: u64,
        outcome: Outcome,
        request: RequestMeta,
    ) -> Self {
        let policy_used = decision
            .as_ref()
            .and_then(|d| d.metadata.get("policyUsed"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            context,
            decision,
            policy_used,
            processing_ms,
            outcome,
            request,
        }
    }
}

// ── Query ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub agent: Option<String>,
    pub decision: Option<Effect>,
    pub outcome: Option<Outcome>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(agent) = &self.agent {
            if &entry.context.agent != agent {
                return false;
            }
        }
        if let Some(effect) = self.decision {
            match &entry.decision {
                Some(d) if d.decision == effect => {}
                _ => return false,
            }
        }
        if let Some(outcome) = self.outcome {
            if entry.outcome != outcome {
                return false;
            }
        }
        true
    }
}

// ── Store ────────────────────────────────────────────────────

pub struct AuditLog {
    audit_dir: PathBuf,
    learning_dir: Option<PathBuf>,
    /// Serializes writers so lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl AuditLog {
    /// `data_dir/audit` for entries; `data_dir/learning` when the learning
    /// stream is enabled.
    pub fn new(data_dir: &Path, learning: bool) -> Result<Self, AppError> {
        let audit_dir = data_dir.join("audit");
        std::fs::create_dir_all(&audit_dir)
            .map_err(|e| AppError::Configuration(format!("cannot create audit dir: {}", e)))?;
        let learning_dir = if learning {
            let dir = data_dir.join("learning");
            std::fs::create_dir_all(&dir).map_err(|e| {
                AppError::Configuration(format!("cannot create learning dir: {}", e))
            })?;
            Some(dir)
        } else {
            None
        };
        Ok(Self {
            audit_dir,
            learning_dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Append one entry and fsync before returning.
    pub async fn append(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("unserializable audit entry: {}", e)))?;
        line.push('\n');
        let path = self
            .audit_dir
            .join(format!("audit-{}.jsonl", entry.timestamp.format("%Y-%m-%d")));
        self.write_line(&path, &line).await
    }

    /// Append one decision snapshot to the learning stream, when enabled.
    pub async fn append_learning(
        &self,
        ctx: &DecisionContext,
        decision: &PolicyDecision,
    ) -> Result<(), AppError> {
        let Some(dir) = &self.learning_dir else {
            return Ok(());
        };
        let snapshot = serde_json::json!({
            "timestamp": Utc::now(),
            "context": ctx,
            "decision": decision,
        });
        let mut line = snapshot.to_string();
        line.push('\n');
        let path = dir.join(format!("learning-{}.jsonl", Utc::now().format("%Y-%m-%d")));
        self.write_line(&path, &line).await
    }

    async fn write_line(&self, path: &Path, line: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("audit open failed: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("audit write failed: {}", e)))?;
        file.sync_data()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("audit sync failed: {}", e)))?;
        Ok(())
    }

    /// Scan the date range, filter, and return up to `limit` entries in
    /// file order. Lines that fail to parse are skipped with a warning.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AppError> {
        let limit = query.limit.unwrap_or(1000);
        let mut out = Vec::new();

        for date in self.partition_dates(query)? {
            let path = self.audit_dir.join(format!("audit-{}.jsonl", date));
            let file = match tokio::fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(AppError::Internal(anyhow::anyhow!(
                        "audit read failed: {}",
                        e
                    )))
                }
            };
            let mut lines = BufReader::new(file).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(&line) {
                    Ok(entry) if query.matches(&entry) => {
                        out.push(entry);
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "skipping malformed audit line");
                    }
                }
            }
        }
        Ok(out)
    }

    /// The dates whose partitions fall inside the query range, ascending.
    fn partition_dates(&self, query: &AuditQuery) -> Result<Vec<NaiveDate>, AppError> {
        let mut dates: Vec<NaiveDate> = std::fs::read_dir(&self.audit_dir)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("audit dir unreadable: {}", e)))?
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().into_string().ok()?;
                let date = name
                    .strip_prefix("audit-")?
                    .strip_suffix(".jsonl")?
                    .parse::<NaiveDate>()
                    .ok()?;
                Some(date)
            })
            .filter(|d| query.from.map_or(true, |from| *d >= from))
            .filter(|d| query.to.map_or(true, |to| *d <= to))
            .collect();
        dates.sort_unstable();
        Ok(dates)
    }
}

// ── Tests ────────────────────────────────────────────────────
