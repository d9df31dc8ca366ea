//! Axum HTTP handlers for the web server
//!
//! Provides the Model Context Protocol endpoint (POST, GET and DELETE on
//! `/mcp`) and general metadata endpoints.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::{future, StreamExt};
use serde::Serialize;
use tracing::warn;

use crate::errors::AppError;
use crate::mcp::envelope::{parse_incoming, CorrelationId, Envelope, Incoming};
use crate::session::SessionError;
use crate::transport::{
    single::collect_responses, streaming::exchange_envelopes, Transport, TransportMode,
};
use crate::AppState;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: "/mcp",
    })
}

pub async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let Incoming { envelopes, batch } = parse_incoming(&body)?;

    let mode = if accepts_event_stream(&headers) {
        state.response_mode
    } else {
        TransportMode::SingleExchange
    };
    let session = state
        .server
        .open_session(session_header(&headers), &envelopes, mode)
        .await?;
    session.touch().await;

    let request_ids = envelopes
        .iter()
        .filter_map(Envelope::request_id)
        .cloned()
        .collect::<Vec<CorrelationId>>();
    let exchange = if request_ids.is_empty() {
        None
    } else {
        Some(session.transport().open_exchange(&request_ids).await?)
    };

    for envelope in envelopes {
        session.transport().deliver(envelope).await?;
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        HeaderName::from_static(SESSION_ID_HEADER),
        HeaderValue::from_str(session.id()).map_err(|err| AppError::internal(err.to_string()))?,
    );

    let Some(exchange) = exchange else {
        return Ok((StatusCode::ACCEPTED, response_headers).into_response());
    };

    match session.mode() {
        TransportMode::Streaming => {
            let events = exchange_envelopes(exchange).filter_map(|envelope| {
                future::ready(
                    match Event::default().event("message").json_data(&envelope) {
                        Ok(event) => Some(Ok::<_, Infallible>(event)),
                        Err(err) => {
                            warn!(error = %err, "failed to encode event, dropped");
                            None
                        }
                    },
                )
            });

            Ok((
                response_headers,
                Sse::new(events).keep_alive(KeepAlive::default()),
            )
                .into_response())
        }
        TransportMode::SingleExchange => {
            let mut responses = collect_responses(exchange)
                .await
                .into_iter()
                .map(Envelope::Response)
                .collect::<Vec<_>>();

            if batch {
                return Ok((StatusCode::OK, response_headers, Json(responses)).into_response());
            }
            match responses.pop() {
                Some(response) => {
                    Ok((StatusCode::OK, response_headers, Json(response)).into_response())
                }
                None => Err(AppError::internal(
                    "exchange closed before a response was produced",
                )),
            }
        }
    }
}

/// Server-initiated streams are not offered; clients only POST.
pub async fn mcp_get() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        "Method Not Allowed",
    )
}

pub async fn mcp_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let Some(session_id) = session_header(&headers) else {
        return Err(SessionError::MissingSession.into());
    };

    if state.server.registry().remove(session_id).await {
        Ok(StatusCode::OK)
    } else {
        Err(SessionError::UnknownSession(session_id.to_string()).into())
    }
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(EVENT_STREAM))
}
