//! The central Model Context Protocol engine
//!
//! Owns the session registry and the dispatcher, and runs one receive loop
//! per session: client requests are dispatched on their own tasks, client
//! responses resolve nested calls, and notifications are logged.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::mcp::dispatcher::ToolDispatcher;
use crate::mcp::envelope::{Envelope, Notification, Request, Response, INITIALIZE_METHOD};
use crate::mcp::rpc::internal_error;
use crate::session::{HandshakeState, Session, SessionError, SessionRegistry};
use crate::transport::{Transport, TransportMode};

#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    registry: SessionRegistry,
    dispatcher: ToolDispatcher,
}

impl McpServer {
    pub fn new(registry: SessionRegistry, dispatcher: ToolDispatcher) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry,
                dispatcher,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.inner.dispatcher
    }

    /// Resolves the session for an incoming POST and starts its receive loop when it is new.
    pub async fn open_session(
        &self,
        session_id: Option<&str>,
        messages: &[Envelope],
        mode: TransportMode,
    ) -> Result<Arc<Session>, SessionError> {
        let (session, is_new) = self
            .inner
            .registry
            .get_or_create(session_id, messages, mode)
            .await?;

        if is_new {
            self.attach(session.clone()).await;
        }
        Ok(session)
    }

    async fn attach(&self, session: Arc<Session>) {
        let mut inbound = match session.transport().receive().await {
            Ok(inbound) => inbound,
            Err(err) => {
                error!(session_id = %session.id(), error = %err, "failed to attach receive loop");
                session.close().await;
                return;
            }
        };

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbound.next().await {
                match envelope {
                    Envelope::Request(request) => server.spawn_dispatch(session.clone(), request),
                    Envelope::Response(response) => handle_response(&session, response).await,
                    Envelope::Notification(notification) => {
                        handle_notification(&session, notification)
                    }
                }
            }

            server.inner.registry.remove(session.id()).await;
            session.close().await;
            debug!(session_id = %session.id(), "receive loop ended");
        });
    }

    fn spawn_dispatch(&self, session: Arc<Session>, request: Request) {
        let server = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = session.inflight().acquire_owned().await else {
                debug!(session_id = %session.id(), id = %request.id, "session closed before dispatch");
                return;
            };

            let id = request.id.clone();
            let is_initialize = request.method == INITIALIZE_METHOD;

            // Handler panics surface as a JoinError on the inner task.
            let handler = {
                let server = server.clone();
                let session = session.clone();
                tokio::spawn(async move { server.inner.dispatcher.dispatch(&session, request).await })
            };
            let response = match handler.await {
                Ok(response) => response,
                Err(err) => {
                    error!(session_id = %session.id(), id = %id, error = %err, "request handler panicked");
                    Response::failure(id, internal_error())
                }
            };

            if let Err(err) = session
                .transport()
                .send(Envelope::Response(response), None)
                .await
            {
                warn!(session_id = %session.id(), error = %err, "failed to deliver response");
            }

            if is_initialize && session.state().await == HandshakeState::Uninitialized {
                info!(session_id = %session.id(), "handshake failed; discarding session");
                session.close().await;
            }
        });
    }
}

async fn handle_response(session: &Session, response: Response) {
    let id = response.id.clone();
    if !session.correlator().resolve(response).await {
        warn!(
            session_id = %session.id(),
            id = %id,
            "response does not match an outstanding call; discarded"
        );
    }
}

fn handle_notification(session: &Session, notification: Notification) {
    match notification.method.as_str() {
        "notifications/initialized" => {
            debug!(session_id = %session.id(), "client finished initialization");
        }
        "notifications/cancelled" => {
            let request_id = notification
                .params
                .as_ref()
                .and_then(|params| params.get("requestId"))
                .cloned()
                .unwrap_or_default();
            info!(
                session_id = %session.id(),
                request_id = %request_id,
                "client cancelled a request; the handler runs to completion"
            );
        }
        method => {
            debug!(session_id = %session.id(), method = %method, "notification ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_mcp_sdk::schema::{CallToolResult, Tool};
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::mcp::dispatcher::{ToolError, ToolHandler, LATEST_PROTOCOL_VERSION};
    use crate::mcp::envelope::CorrelationId;
    use crate::mcp::rpc::{INTERNAL_ERROR, SESSION_NOT_READY};
    use crate::session::SessionContext;
    use crate::transport::{Exchange, Outbound};

    struct PanickingHandler;

    #[async_trait]
    impl ToolHandler for PanickingHandler {
        async fn call(
            &self,
            _arguments: Map<String, Value>,
            _context: SessionContext,
        ) -> Result<CallToolResult, ToolError> {
            panic!("handler bug");
        }
    }

    struct SamplingHandler;

    #[async_trait]
    impl ToolHandler for SamplingHandler {
        async fn call(
            &self,
            _arguments: Map<String, Value>,
            context: SessionContext,
        ) -> Result<CallToolResult, ToolError> {
            let reply = context.create_message(json!({"messages": []})).await?;
            Ok(CallToolResult {
                content: vec![],
                is_error: None,
                meta: None,
                structured_content: Some(Map::from_iter([("reply".to_string(), reply)])),
            })
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(
            &self,
            arguments: Map<String, Value>,
            _context: SessionContext,
        ) -> Result<CallToolResult, ToolError> {
            Ok(CallToolResult {
                content: vec![],
                is_error: None,
                meta: None,
                structured_content: Some(arguments),
            })
        }
    }

    fn tool(name: &str) -> Tool {
        serde_json::from_value(json!({
            "name": name,
            "inputSchema": {"type": "object", "properties": {}}
        }))
        .expect("tool descriptor")
    }

    fn server_with_inflight(max_inflight: usize) -> McpServer {
        let registry = SessionRegistry::new(max_inflight);
        let mut dispatcher = ToolDispatcher::new(registry.clone(), Some(Duration::from_secs(5)));
        dispatcher.register(tool("explode"), Arc::new(PanickingHandler));
        dispatcher.register(tool("sample"), Arc::new(SamplingHandler));
        dispatcher.register(tool("echo"), Arc::new(EchoHandler));
        McpServer::new(registry, dispatcher)
    }

    fn server() -> McpServer {
        server_with_inflight(4)
    }

    fn request(id: i64, method: &str, params: Value) -> Envelope {
        Envelope::Request(Request {
            id: id.into(),
            method: method.to_string(),
            params: Some(params),
        })
    }

    async fn post(session: &Session, envelope: Envelope) -> Exchange {
        let ids = envelope.request_id().cloned().into_iter().collect::<Vec<_>>();
        let exchange = session
            .transport()
            .open_exchange(&ids)
            .await
            .expect("open exchange");
        session.transport().deliver(envelope).await.expect("deliver");
        exchange
    }

    async fn initialized(server: &McpServer) -> Arc<Session> {
        let init = request(
            0,
            "initialize",
            json!({"protocolVersion": LATEST_PROTOCOL_VERSION, "capabilities": {"sampling": {}}}),
        );
        let session = server
            .open_session(None, std::slice::from_ref(&init), TransportMode::Streaming)
            .await
            .expect("session");
        let mut exchange = post(&session, init).await;
        let Some(Outbound {
            envelope: Envelope::Response(response),
            ..
        }) = exchange.next().await
        else {
            panic!("expected initialize response");
        };
        assert!(!response.is_error());
        session
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let server = server();
        let session = initialized(&server).await;

        let mut exchange = post(
            &session,
            request(1, "tools/call", json!({"name": "explode", "arguments": {}})),
        )
        .await;

        let Some(Outbound {
            envelope: Envelope::Response(response),
            ..
        }) = exchange.next().await
        else {
            panic!("expected response");
        };
        assert_eq!(response.outcome.expect_err("panic").code, INTERNAL_ERROR);
        assert_eq!(session.state().await, HandshakeState::Active);
    }

    #[tokio::test]
    async fn client_response_resumes_the_suspended_handler() {
        let server = server();
        let session = initialized(&server).await;

        let mut exchange = post(
            &session,
            request(7, "tools/call", json!({"name": "sample", "arguments": {}})),
        )
        .await;

        let Some(Outbound {
            related,
            envelope: Envelope::Request(nested),
        }) = exchange.next().await
        else {
            panic!("expected nested request");
        };
        assert_eq!(related, Some(CorrelationId::Number(7)));
        assert_eq!(nested.method, "sampling/createMessage");

        let answer = Envelope::Response(Response::success(nested.id, json!({"ok": true})));
        let mut ack = post(&session, answer).await;

        let Some(Outbound {
            envelope: Envelope::Response(response),
            ..
        }) = exchange.next().await
        else {
            panic!("expected tool response");
        };
        assert_eq!(response.id, CorrelationId::Number(7));
        assert_eq!(
            response.outcome.expect("result")["structuredContent"]["reply"],
            json!({"ok": true})
        );
        assert!(ack.next().await.is_none());
    }

    #[tokio::test]
    async fn inflight_limit_queues_requests_without_blocking_nested_replies() {
        let server = server_with_inflight(1);
        let session = initialized(&server).await;

        let mut first = post(
            &session,
            request(1, "tools/call", json!({"name": "sample", "arguments": {}})),
        )
        .await;
        let Some(Outbound {
            envelope: Envelope::Request(nested),
            ..
        }) = first.next().await
        else {
            panic!("expected nested request");
        };

        let mut second = post(
            &session,
            request(2, "tools/call", json!({"name": "echo", "arguments": {"n": 2}})),
        )
        .await;
        assert!(
            tokio::time::timeout(Duration::from_millis(100), second.next())
                .await
                .is_err(),
            "second call must wait for the only permit"
        );
        assert_eq!(session.inflight().available_permits(), 0);

        // The reply is consumed by the receive loop, not by a permit holder.
        let _ack = post(
            &session,
            Envelope::Response(Response::success(nested.id, json!({"ok": true}))),
        )
        .await;

        let Some(Outbound {
            envelope: Envelope::Response(response),
            ..
        }) = first.next().await
        else {
            panic!("expected first tool response");
        };
        assert_eq!(response.id, CorrelationId::Number(1));
        assert!(!response.is_error());

        let Some(Outbound {
            envelope: Envelope::Response(response),
            ..
        }) = tokio::time::timeout(Duration::from_secs(1), second.next())
            .await
            .expect("second call runs once the permit is free")
        else {
            panic!("expected second tool response");
        };
        assert_eq!(response.id, CorrelationId::Number(2));
        assert_eq!(
            response.outcome.expect("result")["structuredContent"],
            json!({"n": 2})
        );
    }

    #[tokio::test]
    async fn failed_handshake_discards_the_session() {
        let server = server();
        let init = request(0, "initialize", json!({}));
        let session = server
            .open_session(None, std::slice::from_ref(&init), TransportMode::Streaming)
            .await
            .expect("session");

        let mut exchange = post(&session, init).await;
        let Some(Outbound {
            envelope: Envelope::Response(response),
            ..
        }) = exchange.next().await
        else {
            panic!("expected response");
        };
        assert!(response.is_error());

        tokio::time::timeout(Duration::from_secs(1), async {
            while session.state().await != HandshakeState::Closed {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session closed");
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn requests_before_initialize_are_refused() {
        let server = server();
        let init = request(0, "initialize", json!({"protocolVersion": "2025-06-18"}));
        let session = server
            .open_session(None, std::slice::from_ref(&init), TransportMode::Streaming)
            .await
            .expect("session");

        let mut exchange = post(&session, request(1, "tools/list", json!({}))).await;
        let Some(Outbound {
            envelope: Envelope::Response(response),
            ..
        }) = exchange.next().await
        else {
            panic!("expected response");
        };
        assert_eq!(response.outcome.expect_err("not ready").code, SESSION_NOT_READY);
    }
}
