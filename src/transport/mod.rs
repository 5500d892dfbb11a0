//! Transport listeners: line-delimited JSON-RPC over stdio and the HTTP
//! surface (request endpoint, SSE stream, policy and audit APIs). Both
//! call the same `ProxyCore::handle` entry point.

pub mod http;
pub mod session;
pub mod stdio;

pub use session::{Session, SessionTable};
