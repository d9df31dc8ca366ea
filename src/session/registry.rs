//! Process-wide session table.
//!
//! A session is created for a lone initialize request but only becomes
//! reachable by id once [`SessionRegistry::on_session_initialized`] publishes
//! it, which the initialize handler does before its reply is queued.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::{HandshakeState, Session, SessionError};
use crate::mcp::envelope::Envelope;
use crate::transport::{SessionTransport, Transport, TransportMode};

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Every id ever handed out, so a closed session's id is never issued again.
    issued: Mutex<HashSet<String>>,
    max_inflight: usize,
}

impl SessionRegistry {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                issued: Mutex::new(HashSet::new()),
                max_inflight,
            }),
        }
    }

    /// Resolves the session a POST belongs to, creating one for a lone initialize request.
    pub async fn get_or_create(
        &self,
        session_id: Option<&str>,
        messages: &[Envelope],
        mode: TransportMode,
    ) -> Result<(Arc<Session>, bool), SessionError> {
        if let Some(id) = session_id {
            return self.lookup(id).await.map(|session| (session, false));
        }

        match messages {
            [first] if first.is_initialize_request() => Ok((self.create(mode).await, true)),
            _ if messages.iter().any(Envelope::is_initialize_request) => {
                Err(SessionError::BatchedInitialize)
            }
            _ => Err(SessionError::MissingSession),
        }
    }

    async fn create(&self, mode: TransportMode) -> Arc<Session> {
        let id = self.allocate_id().await;
        let transport: Arc<dyn Transport> = Arc::new(SessionTransport::new(mode));

        debug!(session_id = %id, mode = %mode, "session created");
        Arc::new(Session::new(id, transport, self.inner.max_inflight))
    }

    async fn allocate_id(&self) -> String {
        let mut issued = self.inner.issued.lock().await;
        loop {
            let candidate = Uuid::new_v4().to_string();
            if issued.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    pub async fn lookup(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        if session.state().await == HandshakeState::Closed {
            return Err(SessionError::SessionClosed(session_id.to_string()));
        }
        Ok(session)
    }

    /// Session-initialized hook: makes the session reachable by its id.
    pub async fn on_session_initialized(&self, session: &Arc<Session>) {
        self.inner
            .sessions
            .write()
            .await
            .insert(session.id().to_string(), session.clone());

        info!(
            session_id = %session.id(),
            mode = %session.mode(),
            created_at = %session.created_at().to_rfc3339(),
            "session initialized"
        );
    }

    /// Unpublishes and closes a session. Returns `false` if it was not registered.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.inner.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let sessions = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut evicted = 0;
        for session in sessions {
            if session.idle_for().await > max_idle && self.remove(session.id()).await {
                info!(session_id = %session.id(), "idle session evicted");
                evicted += 1;
            }
        }
        evicted
    }

    pub fn spawn_eviction_task(&self, max_idle: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let period = (max_idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                registry.evict_idle(max_idle).await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
