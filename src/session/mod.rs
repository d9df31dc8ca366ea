//! Client sessions
//!
//! A session survives across HTTP calls. It owns exactly one transport, the
//! handshake gate, and the table of nested calls it has outstanding.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::info;

use crate::transport::{Transport, TransportMode};

pub mod context;
pub mod correlator;
pub mod gate;
pub mod registry;

pub use context::{LogLevel, SessionContext};
pub use correlator::{CorrelationError, Correlator};
pub use gate::{GateError, HandshakeGate, HandshakeState};
pub use registry::SessionRegistry;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no session id was provided and the message is not an initialize request")]
    MissingSession,
    #[error("initialize must be the only message of its request")]
    BatchedInitialize,
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
}

/// What the client declared about itself during initialize.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub protocol_version: String,
    pub name: Option<String>,
    pub capabilities: Value,
}

impl ClientInfo {
    pub fn supports_sampling(&self) -> bool {
        self.capabilities
            .get("sampling")
            .is_some_and(|sampling| !sampling.is_null())
    }
}

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    gate: HandshakeGate,
    transport: Arc<dyn Transport>,
    correlator: Correlator,
    client: RwLock<Option<ClientInfo>>,
    log_level: RwLock<Option<LogLevel>>,
    inflight: Arc<Semaphore>,
}

impl Session {
    pub fn new(id: String, transport: Arc<dyn Transport>, max_inflight: usize) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            gate: HandshakeGate::new(),
            transport,
            correlator: Correlator::new(),
            client: RwLock::new(None),
            log_level: RwLock::new(None),
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn gate(&self) -> &HandshakeGate {
        &self.gate
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn inflight(&self) -> Arc<Semaphore> {
        self.inflight.clone()
    }

    pub async fn state(&self) -> HandshakeState {
        self.gate.state().await
    }

    pub async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_seen.lock().await.elapsed()
    }

    pub async fn set_client(&self, client: ClientInfo) {
        *self.client.write().await = Some(client);
    }

    pub async fn client(&self) -> Option<ClientInfo> {
        self.client.read().await.clone()
    }

    pub async fn set_log_level(&self, level: LogLevel) {
        *self.log_level.write().await = Some(level);
    }

    /// Without an explicit level every message is delivered.
    pub async fn accepts_log_level(&self, level: LogLevel) -> bool {
        self.log_level
            .read()
            .await
            .map_or(true, |minimum| level >= minimum)
    }

    /// Marks the session closed, rejects its nested calls and shuts its transport.
    ///
    /// Idempotent; handlers still running observe `Rejected` on their next nested call.
    pub async fn close(&self) {
        if !self.gate.close().await {
            return;
        }

        self.inflight.close();
        let rejected = self.correlator.reject_all("session closed").await;
        self.transport.close().await;

        info!(
            session_id = %self.id,
            rejected_calls = rejected,
            "session closed"
        );
    }
}
