//! Streaming delivery: a POST is answered with an event stream.
//!
//! Notifications and nested requests are pushed as they are produced, followed
//! by the responses, all on the exchange that carried the triggering request.

use futures_util::{Stream, StreamExt};

use super::Exchange;
use crate::mcp::envelope::Envelope;

/// Envelopes of an exchange in push order.
pub fn exchange_envelopes(exchange: Exchange) -> impl Stream<Item = Envelope> + Send {
    exchange.map(|outbound| outbound.envelope)
}
