//! JSON-RPC error codes and error builders
//!
//! Maps the crate's layered errors onto JSON-RPC error objects.

use serde::Serialize;
use serde_json::{json, Value};

use crate::mcp::envelope::{CorrelationId, RpcError};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Transport-level failures outside the reserved JSON-RPC range.
pub const CONNECTION_CLOSED: i64 = -32000;
pub const SESSION_NOT_FOUND: i64 = -32001;
pub const REQUEST_TIMEOUT: i64 = -32001;
pub const SESSION_NOT_READY: i64 = -32002;

/// Error body written directly to an HTTP response when no envelope can be produced.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub jsonrpc: &'static str,
    pub error: RpcError,
    pub id: Option<CorrelationId>,
}

impl ErrorBody {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            error: RpcError::new(code, message),
            id: None,
        }
    }
}

pub fn method_not_found() -> RpcError {
    RpcError::new(METHOD_NOT_FOUND, "Method not found")
}

pub fn invalid_params(detail: impl Into<String>) -> RpcError {
    RpcError::new(INVALID_PARAMS, "Invalid params").with_data(json!({
        "detail": detail.into(),
    }))
}

pub fn internal_error() -> RpcError {
    RpcError::new(INTERNAL_ERROR, "Internal error")
}

pub fn tool_not_found(name: &str) -> RpcError {
    method_not_found().with_data(json!({
        "code": "tool_not_found",
        "message": "unknown tool name",
        "details": {
            "name": name,
        },
    }))
}

pub fn serialize_result<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| {
        tracing::error!(error = %err, "result serialization failed");
        internal_error()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_keeps_field_order_and_null_id() {
        let body = ErrorBody::new(-32000, "Bad Request: No valid session ID provided");
        assert_eq!(
            serde_json::to_string(&body).expect("serialize"),
            r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"Bad Request: No valid session ID provided"},"id":null}"#
        );
    }

    #[test]
    fn tool_not_found_carries_tool_name() {
        let error = tool_not_found("nope");
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(error.data.expect("data")["details"]["name"], "nope");
    }
}
