use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::debug;

use crate::mcp::envelope::IncomingError;
use crate::mcp::rpc::{
    ErrorBody, CONNECTION_CLOSED, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR, SESSION_NOT_FOUND,
};
use crate::session::SessionError;
use crate::transport::TransportError;

/// Failures answered at the HTTP layer, before or instead of a JSON-RPC response.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest { code: i64, message: String },
    #[error("not found: {message}")]
    NotFound { code: i64, message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: &'static str },
    #[error("internal error")]
    Internal { message: String },
}

impl AppError {
    pub fn bad_request(code: i64, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn session_not_found() -> Self {
        Self::NotFound {
            code: SESSION_NOT_FOUND,
            message: "Session not found".to_string(),
        }
    }

    pub fn unauthorized(message: &'static str) -> Self {
        Self::Unauthorized { message }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::MissingSession => Self::bad_request(
                CONNECTION_CLOSED,
                "Bad Request: No valid session ID provided",
            ),
            SessionError::BatchedInitialize => Self::bad_request(
                INVALID_REQUEST,
                "Invalid Request: Only one initialization request is allowed",
            ),
            SessionError::UnknownSession(_) | SessionError::SessionClosed(_) => {
                Self::session_not_found()
            }
        }
    }
}

impl From<IncomingError> for AppError {
    fn from(err: IncomingError) -> Self {
        match err {
            IncomingError::Parse(_) => Self::bad_request(PARSE_ERROR, "Parse error: Invalid JSON"),
            IncomingError::Invalid(detail) => {
                debug!(detail = %detail, "rejected malformed JSON-RPC message");
                Self::bad_request(INVALID_REQUEST, "Invalid Request")
            }
        }
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::Disconnected => Self::session_not_found(),
            TransportError::DuplicateRequestId(id) => Self::bad_request(
                INVALID_REQUEST,
                format!("Invalid Request: request id {id} is already in flight"),
            ),
            TransportError::NestedCallsUnsupported | TransportError::ReceiveTaken => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, ErrorBody::new(code, message))
            }
            Self::NotFound { code, message } => {
                (StatusCode::NOT_FOUND, ErrorBody::new(code, message))
            }
            Self::Unauthorized { message } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody::new(CONNECTION_CLOSED, format!("Unauthorized: {message}")),
            ),
            Self::Internal { message } => {
                tracing::error!(error = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new(INTERNAL_ERROR, "Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
