//! Upstream MCP server supervision.
//!
//! Each configured capability server runs as a child process speaking
//! line-delimited JSON-RPC over its pipes. [`server::UpstreamServer`] owns
//! one child (spawn, connection detection, request correlation, restart on
//! crash); [`supervisor::Supervisor`] owns the fleet (routing by namespace
//! prefix or URI scheme, aggregate listings with per-server timeouts).

pub mod server;
pub mod supervisor;

pub use server::{ServerState, UpstreamServer, UpstreamTimeouts};
pub use supervisor::Supervisor;
