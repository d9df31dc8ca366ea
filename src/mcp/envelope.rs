//! JSON-RPC 2.0 message envelopes
//!
//! Every protocol unit exchanged with a client is one of three shapes: a request
//! that expects an answer, a response that answers one, or a fire-and-forget
//! notification. The wire form is parsed through [`WireMessage`] and classified
//! into an [`Envelope`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";
pub const INITIALIZE_METHOD: &str = "initialize";

/// Identifier pairing a request with its eventual response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(i64),
    String(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: CorrelationId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: CorrelationId,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: CorrelationId, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Envelope {
    pub fn is_initialize_request(&self) -> bool {
        matches!(self, Self::Request(request) if request.method == INITIALIZE_METHOD)
    }

    pub fn request_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Request(request) => Some(&request.id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unsupported jsonrpc version")]
    InvalidVersion,
    #[error("method must not be empty")]
    EmptyMethod,
    #[error("response carries both result and error")]
    AmbiguousResponse,
    #[error("message is neither a request, a response nor a notification")]
    Unclassifiable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl TryFrom<WireMessage> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        if wire.jsonrpc != JSONRPC_VERSION {
            return Err(EnvelopeError::InvalidVersion);
        }

        match (wire.method, wire.id) {
            (Some(method), _) if method.trim().is_empty() => Err(EnvelopeError::EmptyMethod),
            (Some(method), Some(id)) => Ok(Self::Request(Request {
                id,
                method,
                params: wire.params,
            })),
            (Some(method), None) => Ok(Self::Notification(Notification {
                method,
                params: wire.params,
            })),
            (None, Some(id)) => match (wire.result, wire.error) {
                (Some(_), Some(_)) => Err(EnvelopeError::AmbiguousResponse),
                (_, Some(error)) => Ok(Self::Response(Response::failure(id, error))),
                // `"result": null` deserializes to `None`
                (result, None) => Ok(Self::Response(Response::success(
                    id,
                    result.unwrap_or(Value::Null),
                ))),
            },
            (None, None) => Err(EnvelopeError::Unclassifiable),
        }
    }
}

impl From<Envelope> for WireMessage {
    fn from(envelope: Envelope) -> Self {
        let mut wire = WireMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };

        match envelope {
            Envelope::Request(request) => {
                wire.id = Some(request.id);
                wire.method = Some(request.method);
                wire.params = request.params;
            }
            Envelope::Response(response) => {
                wire.id = Some(response.id);
                match response.outcome {
                    Ok(result) => wire.result = Some(result),
                    Err(error) => wire.error = Some(error),
                }
            }
            Envelope::Notification(notification) => {
                wire.method = Some(notification.method);
                wire.params = notification.params;
            }
        }

        wire
    }
}

/// Body of one POST: a single envelope or a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub envelopes: Vec<Envelope>,
    pub batch: bool,
}

#[derive(Debug, Error)]
pub enum IncomingError {
    #[error("body is not valid json")]
    Parse(#[source] serde_json::Error),
    #[error("invalid request: {0}")]
    Invalid(String),
}

pub fn parse_incoming(body: &[u8]) -> Result<Incoming, IncomingError> {
    let payload: Value = serde_json::from_slice(body).map_err(IncomingError::Parse)?;

    let (items, batch) = match payload {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(IncomingError::Invalid("empty batch".to_string()));
            }
            (items, true)
        }
        Value::Object(_) => (vec![payload], false),
        _ => {
            return Err(IncomingError::Invalid(
                "body must be an object or an array".to_string(),
            ))
        }
    };

    let envelopes = items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<Envelope>(item)
                .map_err(|err| IncomingError::Invalid(err.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Incoming { envelopes, batch })
}
