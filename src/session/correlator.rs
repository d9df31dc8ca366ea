//! Server-originated calls toward the client.
//!
//! A handler sends a request over the session's transport and parks on a
//! oneshot slot keyed by the request's correlation id. The session's receive
//! loop resolves the slot when the matching response arrives. Each slot is
//! resolved at most once: by its response, by its timeout, or by session close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::mcp::envelope::{CorrelationId, Envelope, Request, Response, RpcError};
use crate::mcp::rpc::{CONNECTION_CLOSED, REQUEST_TIMEOUT};
use crate::transport::Transport;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrelationError {
    #[error("nested call rejected: {0}")]
    Rejected(String),
    #[error("nested call timed out after {0:?}")]
    Timeout(Duration),
    #[error("client answered with error {}: {}", .0.code, .0.message)]
    Remote(RpcError),
}

impl From<CorrelationError> for RpcError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Rejected(reason) => {
                RpcError::new(CONNECTION_CLOSED, format!("Nested call rejected: {reason}"))
            }
            CorrelationError::Timeout(_) => RpcError::new(REQUEST_TIMEOUT, "Request timed out"),
            CorrelationError::Remote(error) => error,
        }
    }
}

type CallOutcome = Result<Value, CorrelationError>;

#[derive(Debug)]
struct PendingCall {
    method: String,
    created_at: Instant,
    deadline: Option<Instant>,
    slot: oneshot::Sender<CallOutcome>,
}

#[derive(Debug, Default)]
struct PendingTable {
    calls: HashMap<CorrelationId, PendingCall>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Correlator {
    next_id: AtomicI64,
    pending: Mutex<PendingTable>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `method` to the client on the exchange of `related` and waits for the answer.
    pub async fn call(
        &self,
        transport: &dyn Transport,
        related: &CorrelationId,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CorrelationError> {
        let (slot, outcome) = oneshot::channel();
        let id = self.register(method, timeout, slot).await?;

        let request = Envelope::Request(Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        if let Err(err) = transport.send(request, Some(related)).await {
            self.forget(&id).await;
            return Err(CorrelationError::Rejected(err.to_string()));
        }
        debug!(id = %id, method, related = %related, "nested call sent");

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, outcome).await {
                Ok(received) => received,
                Err(_) => {
                    self.forget(&id).await;
                    return Err(CorrelationError::Timeout(limit));
                }
            },
            None => outcome.await,
        };

        outcome.unwrap_or_else(|_| Err(CorrelationError::Rejected("call abandoned".to_string())))
    }

    async fn register(
        &self,
        method: &str,
        timeout: Option<Duration>,
        slot: oneshot::Sender<CallOutcome>,
    ) -> Result<CorrelationId, CorrelationError> {
        let mut table = self.pending.lock().await;
        if table.closed {
            return Err(CorrelationError::Rejected("session closed".to_string()));
        }

        let id = loop {
            let candidate = CorrelationId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !table.calls.contains_key(&candidate) {
                break candidate;
            }
        };

        let created_at = Instant::now();
        table.calls.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                created_at,
                deadline: timeout.map(|limit| created_at + limit),
                slot,
            },
        );

        Ok(id)
    }

    async fn forget(&self, id: &CorrelationId) {
        self.pending.lock().await.calls.remove(id);
    }

    /// Hands a client response to the call waiting on its id.
    ///
    /// Returns `false` when no call is waiting; the table is left untouched.
    pub async fn resolve(&self, response: Response) -> bool {
        let Some(call) = self.pending.lock().await.calls.remove(&response.id) else {
            return false;
        };

        debug!(
            id = %response.id,
            method = %call.method,
            elapsed_ms = call.created_at.elapsed().as_millis(),
            overdue = call.deadline.is_some_and(|deadline| Instant::now() > deadline),
            "nested call resolved"
        );
        let outcome = response.outcome.map_err(CorrelationError::Remote);
        // The waiting handler may already be gone.
        let _ = call.slot.send(outcome);
        true
    }

    /// Rejects every outstanding call and refuses new ones. Returns how many were rejected.
    pub async fn reject_all(&self, reason: &str) -> usize {
        let drained = {
            let mut table = self.pending.lock().await;
            table.closed = true;
            table.calls.drain().collect::<Vec<_>>()
        };

        let rejected = drained.len();
        for (_, call) in drained {
            let _ = call.slot.send(Err(CorrelationError::Rejected(reason.to_string())));
        }
        rejected
    }

    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::transport::{
        streaming::exchange_envelopes, Exchange, SessionTransport, TransportMode,
    };

    async fn streaming_with_exchange(related: &CorrelationId) -> (Arc<SessionTransport>, Exchange) {
        let transport = Arc::new(SessionTransport::new(TransportMode::Streaming));
        let exchange = transport
            .open_exchange(std::slice::from_ref(related))
            .await
            .expect("open exchange");
        (transport, exchange)
    }

    async fn next_request_id(exchange: &mut Exchange) -> CorrelationId {
        match exchange.next().await.map(|outbound| outbound.envelope) {
            Some(Envelope::Request(request)) => request.id,
            other => panic!("expected nested request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn matching_response_resolves_the_call() {
        let correlator = Arc::new(Correlator::new());
        let related = CorrelationId::Number(10);
        let (transport, mut exchange) = streaming_with_exchange(&related).await;

        let call = {
            let correlator = correlator.clone();
            let transport = transport.clone();
            let related = related.clone();
            tokio::spawn(async move {
                correlator
                    .call(transport.as_ref(), &related, "sampling/createMessage", None, None)
                    .await
            })
        };

        let id = next_request_id(&mut exchange).await;
        assert_eq!(correlator.outstanding().await, 1);
        assert!(
            correlator
                .resolve(Response::success(id, json!({"text": "ok"})))
                .await
        );

        let outcome = call.await.expect("join");
        assert_eq!(outcome, Ok(json!({"text": "ok"})));
        assert_eq!(correlator.outstanding().await, 0);
    }

    #[tokio::test]
    async fn remote_errors_are_surfaced() {
        let correlator = Arc::new(Correlator::new());
        let related = CorrelationId::Number(1);
        let (transport, mut exchange) = streaming_with_exchange(&related).await;

        let call = {
            let correlator = correlator.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                correlator
                    .call(transport.as_ref(), &related, "sampling/createMessage", None, None)
                    .await
            })
        };

        let id = next_request_id(&mut exchange).await;
        let declined = RpcError::new(-1, "User rejected sampling request");
        correlator
            .resolve(Response::failure(id, declined.clone()))
            .await;

        assert_eq!(
            call.await.expect("join"),
            Err(CorrelationError::Remote(declined))
        );
    }

    #[tokio::test]
    async fn unknown_response_id_is_a_no_op() {
        let correlator = Arc::new(Correlator::new());
        let related = CorrelationId::Number(1);
        let (transport, mut exchange) = streaming_with_exchange(&related).await;

        let call = {
            let correlator = correlator.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                correlator
                    .call(transport.as_ref(), &related, "sampling/createMessage", None, None)
                    .await
            })
        };
        let id = next_request_id(&mut exchange).await;

        assert!(
            !correlator
                .resolve(Response::success(CorrelationId::from("stray"), json!({})))
                .await
        );
        assert_eq!(correlator.outstanding().await, 1);

        assert!(correlator.resolve(Response::success(id, json!(1))).await);
        assert_eq!(call.await.expect("join"), Ok(json!(1)));
    }

    #[tokio::test]
    async fn timeout_removes_the_pending_call() {
        let correlator = Correlator::new();
        let related = CorrelationId::Number(1);
        let (transport, _exchange) = streaming_with_exchange(&related).await;

        let outcome = correlator
            .call(
                transport.as_ref(),
                &related,
                "sampling/createMessage",
                None,
                Some(Duration::from_millis(20)),
            )
            .await;

        assert_eq!(
            outcome,
            Err(CorrelationError::Timeout(Duration::from_millis(20)))
        );
        assert_eq!(correlator.outstanding().await, 0);
    }

    #[tokio::test]
    async fn reject_all_resolves_every_call_once_and_refuses_new_ones() {
        let correlator = Arc::new(Correlator::new());
        let related = CorrelationId::Number(1);
        let (transport, mut exchange) = streaming_with_exchange(&related).await;

        let calls = (0..2)
            .map(|_| {
                let correlator = correlator.clone();
                let transport = transport.clone();
                let related = related.clone();
                tokio::spawn(async move {
                    correlator
                        .call(transport.as_ref(), &related, "sampling/createMessage", None, None)
                        .await
                })
            })
            .collect::<Vec<_>>();
        let first = next_request_id(&mut exchange).await;
        let _second = next_request_id(&mut exchange).await;

        assert_eq!(correlator.reject_all("session closed").await, 2);
        for call in calls {
            assert!(matches!(
                call.await.expect("join"),
                Err(CorrelationError::Rejected(_))
            ));
        }

        assert!(!correlator.resolve(Response::success(first, json!({}))).await);
        let refused = correlator
            .call(transport.as_ref(), &related, "ping", None, None)
            .await;
        assert!(matches!(refused, Err(CorrelationError::Rejected(_))));
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently_in_any_order() {
        let correlator = Arc::new(Correlator::new());
        let transport = Arc::new(SessionTransport::new(TransportMode::Streaming));
        let first_related = CorrelationId::Number(1);
        let second_related = CorrelationId::Number(2);
        let first_exchange = transport
            .open_exchange(std::slice::from_ref(&first_related))
            .await
            .expect("open");
        let second_exchange = transport
            .open_exchange(std::slice::from_ref(&second_related))
            .await
            .expect("open");

        let spawn_call = |related: CorrelationId, label: &'static str| {
            let correlator = correlator.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                correlator
                    .call(
                        transport.as_ref(),
                        &related,
                        "sampling/createMessage",
                        Some(json!({ "label": label })),
                        None,
                    )
                    .await
            })
        };
        let first_call = spawn_call(first_related, "first");
        let second_call = spawn_call(second_related, "second");

        let mut first_stream = exchange_envelopes(first_exchange);
        let mut second_stream = exchange_envelopes(second_exchange);
        let Some(Envelope::Request(first_request)) = first_stream.next().await else {
            panic!("first nested request");
        };
        let Some(Envelope::Request(second_request)) = second_stream.next().await else {
            panic!("second nested request");
        };
        assert_ne!(first_request.id, second_request.id);

        correlator
            .resolve(Response::success(second_request.id, json!("second answer")))
            .await;
        correlator
            .resolve(Response::success(first_request.id, json!("first answer")))
            .await;

        assert_eq!(first_call.await.expect("join"), Ok(json!("first answer")));
        assert_eq!(second_call.await.expect("join"), Ok(json!("second answer")));
    }

    #[tokio::test]
    async fn single_exchange_transport_rejects_nested_calls() {
        let correlator = Correlator::new();
        let transport = SessionTransport::new(TransportMode::SingleExchange);
        let related = CorrelationId::Number(1);
        let _exchange = transport
            .open_exchange(std::slice::from_ref(&related))
            .await
            .expect("open");

        let outcome = correlator
            .call(&transport, &related, "sampling/createMessage", None, None)
            .await;

        assert!(matches!(outcome, Err(CorrelationError::Rejected(_))));
        assert_eq!(correlator.outstanding().await, 0);
    }
}
