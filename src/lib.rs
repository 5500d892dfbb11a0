//! Aegis — a policy-enforcing proxy for the MCP JSON-RPC protocol.
//!
//! The proxy sits between agent clients and a fleet of upstream capability
//! servers: every request is enriched into a decision context, judged by
//! the hybrid policy engine (structured rules first, LLM fallback), then
//! blocked or forwarded with constraint transforms and obligations applied
//! to the result.

pub mod audit;
pub mod cli;
pub mod config;
pub mod context;
pub mod enforce;
pub mod errors;
pub mod llm;
pub mod notify;
pub mod policy;
pub mod proxy;
pub mod rpc;
pub mod transport;
pub mod upstream;
