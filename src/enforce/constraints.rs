//! Constraint processors: named transformers applied in decision order to
//! the upstream response of a permitted request.
//!
//! Unrecognized constraint strings are skipped with a warning. That
//! fail-open stance is deliberate: a constraint that must hold has to ship
//! a registered processor.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::context::DecisionContext;
use crate::errors::AppError;

#[async_trait]
pub trait ConstraintProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, constraint: &str) -> bool;
    /// Transform the response data or fail the request.
    async fn apply(
        &self,
        data: Value,
        ctx: &DecisionContext,
        constraint: &str,
    ) -> Result<Value, AppError>;
}

/// Applies a decision's constraints in order against registered processors.
pub struct ConstraintRegistry {
    processors: Vec<Arc<dyn ConstraintProcessor>>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    /// The built-in set: anonymizer, rate limiter, geo restrictor.
    pub fn with_builtins(allowed_regions: Vec<String>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DataAnonymizer));
        registry.register(Arc::new(RateLimiter::new()));
        registry.register(Arc::new(GeoRestrictor::new(allowed_regions)));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn ConstraintProcessor>) {
        self.processors.push(processor);
    }

    pub async fn apply_all(
        &self,
        constraints: &[String],
        mut data: Value,
        ctx: &DecisionContext,
    ) -> Result<Value, AppError> {
        for constraint in constraints {
            match self.processors.iter().find(|p| p.can_handle(constraint)) {
                Some(processor) => {
                    data = processor.apply(data, ctx, constraint).await?;
                }
                None => {
                    tracing::warn!(constraint = %constraint, "no processor registered, skipping");
                }
            }
        }
        Ok(data)
    }
}

impl Default for ConstraintRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── data-anonymizer ──────────────────────────────────────────

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[a-z0-9._%+-]+@([a-z0-9.-]+\.[a-z]{2,})\b").unwrap());

/// Fields whose values are replaced wholesale.
const REDACTED_FIELDS: &[&str] = &["name", "phone", "address", "ssn"];

/// Walks the response tree: named PII fields become `[REDACTED]`, email
/// local parts become `****` with the domain preserved. Idempotent.
pub struct DataAnonymizer;

#[async_trait]
impl ConstraintProcessor for DataAnonymizer {
    fn name(&self) -> &str {
        "data-anonymizer"
    }

    fn can_handle(&self, constraint: &str) -> bool {
        constraint.to_lowercase().contains("anonym")
    }

    async fn apply(
        &self,
        mut data: Value,
        _ctx: &DecisionContext,
        _constraint: &str,
    ) -> Result<Value, AppError> {
        anonymize(&mut data);
        Ok(data)
    }
}

fn anonymize(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            for (key, val) in obj.iter_mut() {
                if REDACTED_FIELDS.contains(&key.to_lowercase().as_str()) {
                    *val = Value::String("[REDACTED]".to_string());
                } else {
                    anonymize(val);
                }
            }
        }
        Value::Array(arr) => {
            for item in arr {
                anonymize(item);
            }
        }
        Value::String(s) => {
            if EMAIL_RE.is_match(s) {
                *s = EMAIL_RE.replace_all(s, "****@$1").to_string();
            }
        }
        _ => {}
    }
}

// ── rate-limiter ─────────────────────────────────────────────

static RATE_SPEC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)rate\s*limit\s*:?\s*(\d+)\s*per\s*(second|minute|hour)").unwrap());

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per (agent, action). Window and cap come from the
/// constraint string itself (`rate limit: 3 per second`). At zero tokens
/// the request fails immediately; there is no queueing.
pub struct RateLimiter {
    buckets: DashMap<(String, String), Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    fn parse(constraint: &str) -> Option<(f64, f64)> {
        let caps = RATE_SPEC_RE.captures(constraint)?;
        let cap: f64 = caps[1].parse().ok()?;
        let window_secs = match caps[2].to_lowercase().as_str() {
            "second" => 1.0,
            "minute" => 60.0,
            _ => 3600.0,
        };
        Some((cap, window_secs))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConstraintProcessor for RateLimiter {
    fn name(&self) -> &str {
        "rate-limiter"
    }

    fn can_handle(&self, constraint: &str) -> bool {
        constraint.to_lowercase().contains("rate limit")
    }

    async fn apply(
        &self,
        data: Value,
        ctx: &DecisionContext,
        constraint: &str,
    ) -> Result<Value, AppError> {
        let Some((cap, window_secs)) = Self::parse(constraint) else {
            tracing::warn!(constraint = %constraint, "unparsable rate limit, skipping");
            return Ok(data);
        };

        let key = (ctx.agent.clone(), ctx.action.as_str().to_string());
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: cap,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * cap / window_secs).min(cap);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(data)
        } else {
            Err(AppError::RateLimitExceeded)
        }
    }
}

// ── geo-restrictor ───────────────────────────────────────────

/// Compares the caller's region against an allow-list. The region comes
/// from `environment.clientRegion` when the transport supplied one;
/// otherwise private/loopback client IPs count as `local` and anything
/// else as `unknown`.
pub struct GeoRestrictor {
    allowed_regions: Vec<String>,
}

impl GeoRestrictor {
    pub fn new(allowed_regions: Vec<String>) -> Self {
        Self { allowed_regions }
    }

    fn region_of(ctx: &DecisionContext) -> String {
        if let Some(region) = ctx
            .environment
            .get("clientRegion")
            .and_then(Value::as_str)
        {
            return region.to_string();
        }
        match ctx.environment.get("clientIp").and_then(Value::as_str) {
            Some(ip)
                if ip.starts_with("10.")
                    || ip.starts_with("192.168.")
                    || ip.starts_with("127.")
                    || ip == "::1" =>
            {
                "local".to_string()
            }
            Some(_) => "unknown".to_string(),
            None => "local".to_string(),
        }
    }
}

#[async_trait]
impl ConstraintProcessor for GeoRestrictor {
    fn name(&self) -> &str {
        "geo-restrictor"
    }

    fn can_handle(&self, constraint: &str) -> bool {
        let lowered = constraint.to_lowercase();
        lowered.contains("geo") || lowered.contains("region")
    }

    async fn apply(
        &self,
        data: Value,
        ctx: &DecisionContext,
        _constraint: &str,
    ) -> Result<Value, AppError> {
        if self.allowed_regions.is_empty() {
            return Ok(data);
        }
        let region = Self::region_of(ctx);
        if self.allowed_regions.iter().any(|r| r == &region) {
            Ok(data)
        } else {
            Err(AppError::PolicyDenied {
                policy: "geo-restrictor".into(),
                reason: format!("region \"{}\" is not in the allowed list", region),
            })
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
