//! Single-exchange delivery: every POST is answered with one JSON body.
//!
//! There is no channel for pushing anything ahead of the answer, so
//! notifications produced while a request is handled are folded into that
//! request's result under `_meta.notifications`, in the order they were sent.
//! They are dropped when the response is an error or the result is not an
//! object.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use super::Exchange;
use crate::mcp::envelope::{CorrelationId, Envelope, Notification, Response};

/// Drains an exchange into its responses, in the order they completed.
pub async fn collect_responses(mut exchange: Exchange) -> Vec<Response> {
    let mut held: HashMap<CorrelationId, Vec<Notification>> = HashMap::new();
    let mut responses = Vec::new();

    while let Some(outbound) = exchange.next().await {
        match outbound.envelope {
            Envelope::Notification(notification) => match outbound.related {
                Some(related) => held.entry(related).or_default().push(notification),
                None => debug!(method = %notification.method, "unrelated notification dropped"),
            },
            Envelope::Response(response) => {
                let notifications = held.remove(&response.id).unwrap_or_default();
                responses.push(fold_notifications(response, notifications));
            }
            Envelope::Request(request) => {
                debug!(method = %request.method, "nested request on single exchange dropped");
            }
        }
    }

    responses
}

fn fold_notifications(mut response: Response, notifications: Vec<Notification>) -> Response {
    if notifications.is_empty() {
        return response;
    }

    if !matches!(response.outcome, Ok(Value::Object(_))) {
        debug!(
            id = %response.id,
            dropped = notifications.len(),
            "notifications dropped, response has no object result"
        );
        return response;
    }

    let folded = notifications
        .into_iter()
        .filter_map(|notification| serde_json::to_value(Envelope::Notification(notification)).ok())
        .collect::<Vec<_>>();

    if let Ok(Value::Object(result)) = &mut response.outcome {
        let meta = result.entry("_meta").or_insert(Value::Null);
        if meta.is_null() {
            *meta = Value::Object(Map::new());
        }
        if let Value::Object(meta) = meta {
            meta.insert("notifications".to_string(), Value::Array(folded));
        }
    }

    response
}
