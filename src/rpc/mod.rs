//! JSON-RPC 2.0 envelope and MCP message types shared by the transports
//! and the upstream supervisor.

pub mod types;

pub use types::*;
