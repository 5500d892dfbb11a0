//! Session table.
//!
//! The listener owns sessions: assigned on first contact, correlated via
//! the `session-id` header, garbage-collected after an idle hour. The
//! stdio transport is one implicit session for the process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub agent_id: Option<String>,
    pub agent_type: Option<String>,
    /// Raw `agent-metadata` header (JSON), parsed later by the agent enricher.
    pub agent_metadata: Option<String>,
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    initialized: AtomicBool,
    protocol_version: std::sync::RwLock<Option<String>>,
    last_seen: std::sync::RwLock<Instant>,
}

impl Session {
    fn new(
        agent_id: Option<String>,
        agent_type: Option<String>,
        agent_metadata: Option<String>,
        client_ip: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id,
            agent_type,
            agent_metadata,
            client_ip,
            created_at: Utc::now(),
            initialized: AtomicBool::new(false),
            protocol_version: std::sync::RwLock::new(None),
            last_seen: std::sync::RwLock::new(Instant::now()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Record a completed `initialize` with the negotiated version.
    pub fn mark_initialized(&self, protocol_version: &str) {
        *self
            .protocol_version
            .write()
            .expect("session lock poisoned") = Some(protocol_version.to_string());
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .read()
            .expect("session lock poisoned")
            .clone()
    }

    pub fn touch(&self) {
        *self.last_seen.write().expect("session lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .read()
            .expect("session lock poisoned")
            .elapsed()
    }
}

pub struct SessionTable {
    sessions: DashMap<String, Arc<Session>>,
    idle_timeout: Duration,
}

impl SessionTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    pub fn create(
        &self,
        agent_id: Option<String>,
        agent_type: Option<String>,
        agent_metadata: Option<String>,
        client_ip: Option<String>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(agent_id, agent_type, agent_metadata, client_ip));
        self.sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(session = %session.id, "session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| {
            s.touch();
            s.clone()
        })
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle past the timeout. Returns how many went away.
    pub fn gc(&self) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.sessions.remove(id);
            tracing::debug!(session = %id, "idle session collected");
        }
        stale.len()
    }

    /// Background sweep every `interval` until the handle is aborted.
    pub fn spawn_gc(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let table = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = table.gc();
                if removed > 0 {
                    tracing::info!(removed, "session gc sweep");
                }
            }
        })
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let table = SessionTable::new(DEFAULT_IDLE_TIMEOUT);
        let session = table.create(Some("a1".into()), None, None, None);
        let found = table.get(&session.id).unwrap();
        assert_eq!(found.agent_id.as_deref(), Some("a1"));
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn test_initialize_tracking() {
        let table = SessionTable::new(DEFAULT_IDLE_TIMEOUT);
        let session = table.create(None, None, None, None);
        assert!(!session.is_initialized());
        session.mark_initialized("2025-03-26");
        assert!(session.is_initialized());
        assert_eq!(session.protocol_version().as_deref(), Some("2025-03-26"));
    }

    #[test]
    fn test_remove() {
        let table = SessionTable::new(DEFAULT_IDLE_TIMEOUT);
        let session = table.create(None, None, None, None);
        assert!(table.remove(&session.id));
        assert!(!table.remove(&session.id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_gc_collects_only_idle_sessions() {
        let table = SessionTable::new(Duration::from_millis(20));
        let stale = table.create(None, None, None, None);
        let fresh = table.create(None, None, None, None);

        std::thread::sleep(Duration::from_millis(40));
        fresh.touch();

        assert_eq!(table.gc(), 1);
        assert!(table.get(&fresh.id).is_some());
        assert!(table.sessions.get(&stale.id).is_none());
    }
}
