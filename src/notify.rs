//! Operational event notifications.
//!
//! Every event lands in the structured log; configured webhook URLs get a
//! fire-and-forget POST with a short retry ladder. Delivery failures are
//! logged and never surface to the request path.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationalEvent {
    /// e.g. "policy_violation", "rate_limit_exceeded", "obligation".
    pub event_type: String,
    pub timestamp: String,
    pub agent: String,
    pub details: serde_json::Value,
}

impl OperationalEvent {
    fn new(event_type: &str, agent: &str, details: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            agent: agent.to_string(),
            details,
        }
    }

    pub fn policy_violation(agent: &str, policy: &str, reason: &str) -> Self {
        Self::new(
            "policy_violation",
            agent,
            serde_json::json!({ "policy": policy, "reason": reason }),
        )
    }

    pub fn rate_limit_exceeded(agent: &str, action: &str) -> Self {
        Self::new(
            "rate_limit_exceeded",
            agent,
            serde_json::json!({ "action": action }),
        )
    }

    pub fn obligation(agent: &str, decision: &serde_json::Value) -> Self {
        Self::new("obligation", agent, decision.clone())
    }

    pub fn upstream_down(server: &str) -> Self {
        Self::new("upstream_down", "-", serde_json::json!({ "server": server }))
    }
}

/// Dispatches operational events to the log and optional webhook targets.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl Notifier {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("aegis-notifier/0.1")
                .build()
                .expect("failed to build notifier HTTP client"),
            urls,
        }
    }

    /// Log the event and hand it to the webhook targets without waiting.
    pub fn emit(&self, event: OperationalEvent) {
        tracing::info!(
            event_type = %event.event_type,
            agent = %event.agent,
            details = %event.details,
            "operational event"
        );
        if self.urls.is_empty() {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            for url in &notifier.urls {
                if let Err(e) = notifier.send(url, &event).await {
                    tracing::warn!(url, error = %e, "webhook delivery ultimately failed");
                }
            }
        });
    }

    /// Deliver to a single URL with up to 3 retries (1s, 5s back-off).
    async fn send(&self, url: &str, event: &OperationalEvent) -> anyhow::Result<()> {
        let backoff_secs: &[u64] = &[0, 1, 5];
        for (attempt, &delay) in backoff_secs.iter().enumerate() {
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-aegis-event", &event.event_type)
                .json(event)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(url, event_type = %event.event_type, attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::warn!(url, status = %resp.status(), attempt, "webhook non-2xx, will retry");
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, attempt, "webhook request error, will retry");
                }
            }
        }
        anyhow::bail!("webhook delivery failed after retries: {}", url)
    }
}

// ── Tests ────────────────────────────────────────────────────
