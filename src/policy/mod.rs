//! Hybrid policy engine: catalog, structured rules, LLM fallback,
//! conflict resolution, and the decision cache.

pub mod admin;
pub mod cache;
pub mod conflict;
pub mod engine;
pub mod model;
pub mod rules;

pub use admin::{PolicyAdministrator, PolicyWarning};
pub use cache::{CacheKey, DecisionCache};
pub use conflict::Strategy;
pub use engine::{EngineConfig, PolicyEngine};
pub use model::{
    Applicability, Effect, Policy, PolicyBody, PolicyDecision, PolicyMetadata, PolicyStatus,
    RiskLevel, RuleSet,
};
