//! Bounded LRU decision cache with TTL.
//!
//! Keyed by (policy-set fingerprint, normalized-context fingerprint). The
//! context fingerprint covers agent, action, resource, purpose and the
//! hour of day only: minute granularity is deliberately discarded so two
//! requests in the same clock hour share a decision.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Timelike;
use sha2::{Digest, Sha256};

use crate::context::DecisionContext;
use crate::policy::model::{Policy, PolicyDecision};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub policy_fingerprint: String,
    pub context_fingerprint: String,
}

impl CacheKey {
    pub fn new(policies: &[Policy], ctx: &DecisionContext) -> Self {
        Self {
            policy_fingerprint: policy_fingerprint(policies),
            context_fingerprint: context_fingerprint(ctx),
        }
    }
}

/// Stable hash over every policy's canonical body and version, in
/// priority order (the same order evaluation sees).
pub fn policy_fingerprint(policies: &[Policy]) -> String {
    let mut hasher = Sha256::new();
    for policy in policies {
        hasher.update(policy.id.as_bytes());
        hasher.update([0]);
        hasher.update(policy.body.canonical().as_bytes());
        hasher.update(policy.metadata.version.to_le_bytes());
    }
    hex_digest(hasher)
}

/// Stable hash over the normalized context.
pub fn context_fingerprint(ctx: &DecisionContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ctx.agent.as_bytes());
    hasher.update([0]);
    hasher.update(ctx.action.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(ctx.resource.as_bytes());
    hasher.update([0]);
    hasher.update(ctx.purpose.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(ctx.time.hour().to_le_bytes());
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let bytes = hasher.finalize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

struct Entry {
    decision: PolicyDecision,
    inserted: Instant,
    last_used: u64,
}

struct Inner {
    map: HashMap<CacheKey, Entry>,
    /// Monotonic use counter; larger is more recent.
    tick: u64,
}

pub struct DecisionCache {
    inner: std::sync::Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl DecisionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner {
                map: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// TTL is enforced on read; a hit refreshes recency.
    pub fn get(&self, key: &CacheKey) -> Option<PolicyDecision> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired = match inner.map.get(key) {
            Some(entry) => entry.inserted.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            inner.map.remove(key);
            return None;
        }
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.map.get_mut(key).expect("entry just checked");
        entry.last_used = tick;
        Some(entry.decision.clone())
    }

    /// Insert, evicting the least-recently-used entry past capacity.
    pub fn put(&self, key: CacheKey, decision: PolicyDecision) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(
            key,
            Entry {
                decision,
                inserted: Instant::now(),
                last_used: tick,
            },
        );
        while inner.map.len() > self.capacity {
            let lru = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match lru {
                Some(k) => {
                    inner.map.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().expect("cache lock poisoned").map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ────────────────────────────────────────────────────
