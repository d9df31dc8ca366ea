//! Handshake ordering for a session.

use std::fmt;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::mcp::envelope::{RpcError, INITIALIZE_METHOD};
use crate::mcp::rpc::{CONNECTION_CLOSED, INVALID_REQUEST, SESSION_NOT_READY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Uninitialized,
    Active,
    Closed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Active => "active",
            Self::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("session is not initialized")]
    SessionNotReady,
    #[error("session is already initialized")]
    AlreadyInitialized,
    #[error("session is closed")]
    SessionClosed,
}

impl From<GateError> for RpcError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::SessionNotReady => RpcError::new(
                SESSION_NOT_READY,
                "Bad Request: Server not initialized",
            ),
            GateError::AlreadyInitialized => RpcError::new(
                INVALID_REQUEST,
                "Invalid Request: Server already initialized",
            ),
            GateError::SessionClosed => RpcError::new(CONNECTION_CLOSED, "Session closed"),
        }
    }
}

#[derive(Debug)]
pub struct HandshakeGate {
    state: Mutex<HandshakeState>,
}

impl HandshakeGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandshakeState::Uninitialized),
        }
    }

    pub async fn state(&self) -> HandshakeState {
        *self.state.lock().await
    }

    /// Checks whether a request for `method` may run in the current state.
    pub async fn admit(&self, method: &str) -> Result<(), GateError> {
        let is_initialize = method == INITIALIZE_METHOD;
        match (*self.state.lock().await, is_initialize) {
            (HandshakeState::Closed, _) => Err(GateError::SessionClosed),
            (HandshakeState::Uninitialized, true) => Ok(()),
            (HandshakeState::Uninitialized, false) => Err(GateError::SessionNotReady),
            (HandshakeState::Active, true) => Err(GateError::AlreadyInitialized),
            (HandshakeState::Active, false) => Ok(()),
        }
    }

    /// `Uninitialized -> Active`, once the initialize request has been validated.
    pub async fn activate(&self) -> Result<(), GateError> {
        let mut state = self.state.lock().await;
        match *state {
            HandshakeState::Uninitialized => {
                *state = HandshakeState::Active;
                Ok(())
            }
            HandshakeState::Active => Err(GateError::AlreadyInitialized),
            HandshakeState::Closed => Err(GateError::SessionClosed),
        }
    }

    /// Returns `false` if the gate was already closed.
    pub async fn close(&self) -> bool {
        let mut state = self.state.lock().await;
        let was_open = *state != HandshakeState::Closed;
        *state = HandshakeState::Closed;
        was_open
    }
}

impl Default for HandshakeGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_initialize_is_admitted_before_activation() {
        let gate = HandshakeGate::new();

        assert_eq!(gate.admit("tools/call").await, Err(GateError::SessionNotReady));
        assert_eq!(gate.admit("ping").await, Err(GateError::SessionNotReady));
        assert_eq!(gate.admit("initialize").await, Ok(()));
        assert_eq!(gate.state().await, HandshakeState::Uninitialized);
    }

    #[tokio::test]
    async fn initialize_is_accepted_once() {
        let gate = HandshakeGate::new();
        gate.activate().await.expect("first activation");

        assert_eq!(gate.state().await, HandshakeState::Active);
        assert_eq!(gate.admit("initialize").await, Err(GateError::AlreadyInitialized));
        assert_eq!(gate.activate().await, Err(GateError::AlreadyInitialized));
        assert_eq!(gate.admit("tools/list").await, Ok(()));
    }

    #[tokio::test]
    async fn closed_gate_refuses_everything() {
        let gate = HandshakeGate::new();
        gate.activate().await.expect("activation");

        assert!(gate.close().await);
        assert!(!gate.close().await);
        assert_eq!(gate.admit("tools/list").await, Err(GateError::SessionClosed));
        assert_eq!(gate.admit("initialize").await, Err(GateError::SessionClosed));
        assert_eq!(gate.activate().await, Err(GateError::SessionClosed));
    }
}
