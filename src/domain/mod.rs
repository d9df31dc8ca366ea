//! Domain tools exposed over the MCP protocol
//!
//! Greeting, sampling-backed summarization and document search.

pub mod tools;
