use std::collections::{HashMap, HashSet};

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EnvelopeStream, Exchange, Outbound, TransportError};
use crate::mcp::envelope::{CorrelationId, Envelope};

/// Routing table shared by both transport flavors.
///
/// Each open exchange is reachable through one entry per client request id it
/// carries. A response removes its entry; once the last entry of an exchange is
/// gone its sender is dropped and the exchange stream ends.
pub(crate) struct ExchangeRouter {
    routes: Mutex<HashMap<CorrelationId, mpsc::UnboundedSender<Outbound>>>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    shutdown: CancellationToken,
}

impl ExchangeRouter {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            routes: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) async fn open_exchange(
        &self,
        request_ids: &[CorrelationId],
    ) -> Result<Exchange, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut routes = self.routes.lock().await;
        let mut seen = HashSet::with_capacity(request_ids.len());
        for id in request_ids {
            if routes.contains_key(id) || !seen.insert(id) {
                return Err(TransportError::DuplicateRequestId(id.clone()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for id in request_ids {
            routes.insert(id.clone(), tx.clone());
        }

        Ok(Exchange::new(rx, self.shutdown.clone()))
    }

    pub(crate) fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        self.inbound_tx
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) async fn receive(&self) -> Result<EnvelopeStream, TransportError> {
        let receiver = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::ReceiveTaken)?;

        Ok(UnboundedReceiverStream::new(receiver)
            .take_until(self.shutdown.clone().cancelled_owned())
            .boxed())
    }

    pub(crate) async fn route(
        &self,
        envelope: Envelope,
        related: Option<&CorrelationId>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let key = match &envelope {
            Envelope::Response(response) => Some(response.id.clone()),
            _ => related.cloned(),
        };
        let Some(key) = key else {
            debug!(kind = envelope.kind(), "no exchange for unrelated envelope, dropped");
            return Ok(());
        };

        let sender = {
            let mut routes = self.routes.lock().await;
            if matches!(envelope, Envelope::Response(_)) {
                routes.remove(&key)
            } else {
                routes.get(&key).cloned()
            }
        };
        let Some(sender) = sender else {
            debug!(
                kind = envelope.kind(),
                related = %key,
                "exchange already completed, envelope dropped"
            );
            return Ok(());
        };

        let outbound = Outbound {
            related: Some(key),
            envelope,
        };
        if sender.send(outbound).is_err() {
            warn!("exchange receiver went away, closing transport");
            self.close().await;
            return Err(TransportError::Disconnected);
        }

        Ok(())
    }

    pub(crate) async fn close(&self) {
        self.shutdown.cancel();
        self.routes.lock().await.clear();
    }
}
