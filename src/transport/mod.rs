//! Session transports
//!
//! A transport is the one live connection a session owns. Inbound envelopes are
//! queued with [`Transport::deliver`] and consumed once through
//! [`Transport::receive`]; outbound envelopes are routed by [`Transport::send`]
//! to the HTTP exchange that carried the client request they relate to.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::mcp::envelope::{CorrelationId, Envelope};

mod router;
pub mod single;
pub mod streaming;

use router::ExchangeRouter;

pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// One POST in, one JSON body out.
    SingleExchange,
    /// POST answered with an event stream that stays open until every request is answered.
    Streaming,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleExchange => "json",
            Self::Streaming => "stream",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "single" => Ok(Self::SingleExchange),
            "stream" | "sse" | "streaming" => Ok(Self::Streaming),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("client disconnected")]
    Disconnected,
    #[error("nested requests cannot be sent over a single-exchange transport")]
    NestedCallsUnsupported,
    #[error("request id {0} is already in flight for this session")]
    DuplicateRequestId(CorrelationId),
    #[error("receive stream was already taken")]
    ReceiveTaken,
}

/// One envelope queued on an exchange, tagged with the client request it answers or accompanies.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub related: Option<CorrelationId>,
    pub envelope: Envelope,
}

/// Outbound side of one HTTP exchange. Ends once every request it carried is answered.
///
/// Dropping an exchange that still has unanswered requests means the client
/// went away; the owning transport is shut down on the spot, which ends the
/// session's receive loop and rejects its nested calls.
#[derive(Debug)]
pub struct Exchange {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    disconnect: CancellationToken,
}

impl Exchange {
    pub(crate) fn new(
        outbound: mpsc::UnboundedReceiver<Outbound>,
        disconnect: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            disconnect,
        }
    }

    pub async fn next(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }
}

impl Stream for Exchange {
    type Item = Outbound;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Outbound>> {
        self.outbound.poll_recv(cx)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        // Every sender gone means every request was answered.
        loop {
            match self.outbound.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => break,
            }
        }

        if !self.disconnect.is_cancelled() {
            warn!("exchange dropped with requests still pending, closing transport");
            self.disconnect.cancel();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    fn is_closed(&self) -> bool;

    /// Opens an exchange that will receive the responses for `request_ids`.
    async fn open_exchange(&self, request_ids: &[CorrelationId])
        -> Result<Exchange, TransportError>;

    /// Queues an envelope received from the client.
    async fn deliver(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Takes the inbound stream. Only the first call gets it; the stream ends on close.
    async fn receive(&self) -> Result<EnvelopeStream, TransportError>;

    async fn send(
        &self,
        envelope: Envelope,
        related: Option<&CorrelationId>,
    ) -> Result<(), TransportError>;

    async fn close(&self);
}

/// The transport a session owns. Both modes share the routing table; only
/// single-exchange refuses to push requests toward the client.
pub struct SessionTransport {
    mode: TransportMode,
    router: ExchangeRouter,
}

impl SessionTransport {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            router: ExchangeRouter::new(),
        }
    }
}

#[async_trait]
impl Transport for SessionTransport {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    fn is_closed(&self) -> bool {
        self.router.is_closed()
    }

    async fn open_exchange(
        &self,
        request_ids: &[CorrelationId],
    ) -> Result<Exchange, TransportError> {
        self.router.open_exchange(request_ids).await
    }

    async fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.router.deliver(envelope)
    }

    async fn receive(&self) -> Result<EnvelopeStream, TransportError> {
        self.router.receive().await
    }

    async fn send(
        &self,
        envelope: Envelope,
        related: Option<&CorrelationId>,
    ) -> Result<(), TransportError> {
        if self.mode == TransportMode::SingleExchange && matches!(envelope, Envelope::Request(_)) {
            return Err(TransportError::NestedCallsUnsupported);
        }
        self.router.route(envelope, related).await
    }

    async fn close(&self) {
        self.router.close().await;
    }
}
