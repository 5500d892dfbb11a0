//! Enforcement of a PERMIT decision: ordered response-transforming
//! constraints, then fire-and-forget obligations.

pub mod constraints;
pub mod obligations;

pub use constraints::{
    ConstraintProcessor, ConstraintRegistry, DataAnonymizer, GeoRestrictor, RateLimiter,
};
pub use obligations::{
    AuditObligation, DataLifecycle, NotifyObligation, ObligationExecutor, ObligationRegistry,
};
