//! HTTP surface for the Model Context Protocol
//!
//! Provides the `/mcp` endpoint and the public metadata endpoints.

pub mod handlers;
