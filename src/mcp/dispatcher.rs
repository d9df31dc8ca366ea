//! Method routing for client requests
//!
//! Runs the handshake gate, answers the protocol methods (`initialize`,
//! `ping`, `tools/list`, `logging/setLevel`) and routes `tools/call` to the
//! registered [`ToolHandler`] with a [`SessionContext`] bound to the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    CallToolRequestParams, CallToolResult, Implementation, InitializeResult, ListToolsResult,
    ServerCapabilities, ServerCapabilitiesTools, Tool,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::mcp::envelope::{CorrelationId, Request, Response, RpcError, INITIALIZE_METHOD};
use crate::mcp::rpc::{
    internal_error, invalid_params, method_not_found, serialize_result, tool_not_found,
    INVALID_PARAMS,
};
use crate::search::CollaboratorError;
use crate::session::{
    ClientInfo, CorrelationError, LogLevel, Session, SessionContext, SessionRegistry,
};
use crate::transport::TransportError;

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// A caller-facing precondition, such as a missing client capability.
    #[error("{0}")]
    Precondition(String),
    #[error(transparent)]
    Nested(#[from] CorrelationError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ToolError> for RpcError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidArguments(detail) => invalid_params(detail),
            ToolError::Precondition(message) => RpcError::new(INVALID_PARAMS, message),
            ToolError::Nested(err) => err.into(),
            ToolError::Collaborator(_) | ToolError::Transport(_) | ToolError::Internal(_) => {
                error!(error = %err, "tool failed");
                internal_error()
            }
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        arguments: Map<String, Value>,
        context: SessionContext,
    ) -> Result<CallToolResult, ToolError>;
}

struct RegisteredTool {
    descriptor: Tool,
    handler: Arc<dyn ToolHandler>,
}

pub struct ToolDispatcher {
    tools: Vec<RegisteredTool>,
    registry: SessionRegistry,
    nested_call_timeout: Option<Duration>,
}

impl ToolDispatcher {
    pub fn new(registry: SessionRegistry, nested_call_timeout: Option<Duration>) -> Self {
        Self {
            tools: Vec::new(),
            registry,
            nested_call_timeout,
        }
    }

    /// Registers a tool; a later registration under the same name replaces the earlier one.
    pub fn register(&mut self, descriptor: Tool, handler: Arc<dyn ToolHandler>) {
        let tool = RegisteredTool {
            descriptor,
            handler,
        };
        match self
            .tools
            .iter_mut()
            .find(|existing| existing.descriptor.name == tool.descriptor.name)
        {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.tools.iter().map(|tool| tool.descriptor.clone()).collect()
    }

    pub async fn dispatch(&self, session: &Arc<Session>, request: Request) -> Response {
        let Request { id, method, params } = request;
        let audit_params = redact_audit_params(params.as_ref());

        let outcome = match session.gate().admit(&method).await {
            Ok(()) => self.route(session, &id, &method, params).await,
            Err(err) => Err(err.into()),
        };

        info!(
            session_id = %session.id(),
            method = %method,
            params = %audit_params,
            outcome = if outcome.is_ok() { "success" } else { "failure" },
            "mcp action audited"
        );

        Response { id, outcome }
    }

    async fn route(
        &self,
        session: &Arc<Session>,
        id: &CorrelationId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            INITIALIZE_METHOD => self.initialize(session, params).await,
            "ping" => Ok(json!({})),
            "tools/list" => serialize_result(ListToolsResult {
                meta: None,
                next_cursor: None,
                tools: self.tools(),
            }),
            "tools/call" => self.call_tool(session, id, params).await,
            "logging/setLevel" => set_log_level(session, params).await,
            _ => Err(method_not_found()),
        }
    }

    async fn initialize(
        &self,
        session: &Arc<Session>,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let protocol_version = negotiate_protocol_version(params.as_ref())?;
        let params = params.unwrap_or(Value::Null);

        session
            .set_client(ClientInfo {
                protocol_version: protocol_version.to_string(),
                name: params["clientInfo"]["name"].as_str().map(str::to_string),
                capabilities: params
                    .get("capabilities")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            })
            .await;
        session.gate().activate().await?;
        // Published before the reply is queued so a follow-up request can find it.
        self.registry.on_session_initialized(session).await;

        let initialize_result = InitializeResult {
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                description: None,
                icons: vec![],
                website_url: None,
            },
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            protocol_version: protocol_version.to_string(),
            instructions: None,
            meta: None,
        };

        let mut result = serialize_result(initialize_result)?;
        result["capabilities"]["logging"] = json!({});
        Ok(result)
    }

    async fn call_tool(
        &self,
        session: &Arc<Session>,
        id: &CorrelationId,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let Some(raw_params) = params else {
            return Err(invalid_params("missing params"));
        };
        let tool_call: CallToolRequestParams =
            serde_json::from_value(raw_params).map_err(|err| invalid_params(err.to_string()))?;

        let Some(tool) = self
            .tools
            .iter()
            .find(|tool| tool.descriptor.name == tool_call.name)
        else {
            return Err(tool_not_found(&tool_call.name));
        };

        let context = SessionContext::new(session.clone(), id.clone(), self.nested_call_timeout);
        let result = tool
            .handler
            .call(tool_call.arguments.unwrap_or_default(), context)
            .await?;
        serialize_result(result)
    }
}

#[derive(Debug, Deserialize)]
struct SetLevelParams {
    level: LogLevel,
}

async fn set_log_level(session: &Session, params: Option<Value>) -> Result<Value, RpcError> {
    let SetLevelParams { level } = params
        .ok_or_else(|| invalid_params("missing params"))
        .and_then(|value| {
            serde_json::from_value(value).map_err(|err| invalid_params(err.to_string()))
        })?;

    session.set_log_level(level).await;
    Ok(json!({}))
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, RpcError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| invalid_params("initialize params.protocolVersion is required"))?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|supported| **supported == offered_version)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION))
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    ["token", "secret", "password", "credential", "authorization", "api_key", "apikey"]
        .iter()
        .any(|marker| normalized.contains(marker))
}
