//! Capabilities handed to a tool handler for the duration of one request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{CorrelationError, Session};
use crate::mcp::envelope::{CorrelationId, Envelope, Notification};
use crate::transport::{Transport, TransportError, TransportMode};

pub const LOG_NOTIFICATION_METHOD: &str = "notifications/message";
pub const CREATE_MESSAGE_METHOD: &str = "sampling/createMessage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        };
        f.write_str(text)
    }
}

#[derive(Clone)]
pub struct SessionContext {
    session: Arc<Session>,
    request_id: CorrelationId,
    nested_call_timeout: Option<Duration>,
}

impl SessionContext {
    pub fn new(
        session: Arc<Session>,
        request_id: CorrelationId,
        nested_call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            request_id,
            nested_call_timeout,
        }
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn request_id(&self) -> &CorrelationId {
        &self.request_id
    }

    pub fn mode(&self) -> TransportMode {
        self.session.mode()
    }

    pub async fn supports_sampling(&self) -> bool {
        self.session
            .client()
            .await
            .is_some_and(|client| client.supports_sampling())
    }

    /// Pushes a notification alongside the current request.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.session
            .transport()
            .send(
                Envelope::Notification(Notification::new(method, params)),
                Some(&self.request_id),
            )
            .await
    }

    /// Sends a log message unless the session asked for a higher minimum level.
    pub async fn log(&self, level: LogLevel, data: impl Into<Value>) -> Result<(), TransportError> {
        if !self.session.accepts_log_level(level).await {
            return Ok(());
        }

        self.notify(
            LOG_NOTIFICATION_METHOD,
            Some(json!({
                "level": level,
                "data": data.into(),
            })),
        )
        .await
    }

    /// Issues a request to the client and waits for its answer.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CorrelationError> {
        self.session
            .correlator()
            .call(
                self.session.transport(),
                &self.request_id,
                method,
                params,
                self.nested_call_timeout,
            )
            .await
    }

    pub async fn create_message(&self, params: Value) -> Result<Value, CorrelationError> {
        self.call(CREATE_MESSAGE_METHOD, Some(params)).await
    }
}
