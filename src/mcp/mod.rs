//! Model Context Protocol (MCP) message handling
//!
//! Provides the JSON-RPC envelope, error codes, method dispatch and the
//! per-session receive loop.

pub mod dispatcher;
pub mod envelope;
pub mod rpc;
pub mod server;
