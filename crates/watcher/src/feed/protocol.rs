//! JSON-RPC framing for the `logsSubscribe` pubsub feed.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

/// One `logsNotification` delivered for a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogNotification {
    pub subscription: u64,
    pub signature: String,
    pub slot: u64,
    pub logs: Vec<String>,
    /// The transaction itself failed on-chain.
    pub failed: bool,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Reply to one of our requests, keyed by request id.
    Response {
        id: u64,
        result: Result<Value, String>,
    },
    Notification(LogNotification),
    Other,
}

#[derive(Deserialize)]
struct Envelope {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcError>,
    method: Option<String>,
    params: Option<NotificationParams>,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct NotificationParams {
    subscription: u64,
    result: NotificationResult,
}

#[derive(Deserialize)]
struct NotificationResult {
    #[serde(default)]
    context: Option<NotificationContext>,
    value: NotificationValue,
}

#[derive(Deserialize)]
struct NotificationContext {
    #[serde(default)]
    slot: u64,
}

#[derive(Deserialize)]
struct NotificationValue {
    signature: String,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    logs: Option<Vec<String>>,
}

pub fn subscribe_request(id: u64, addresses: &BTreeSet<String>, commitment: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "logsSubscribe",
        "params": [
            { "mentions": addresses },
            { "commitment": commitment }
        ]
    })
    .to_string()
}

pub fn unsubscribe_request(id: u64, subscription: u64) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "logsUnsubscribe",
        "params": [subscription]
    })
    .to_string()
}

pub fn parse_message(text: &str) -> FeedMessage {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "skipping unparseable feed frame");
            return FeedMessage::Other;
        }
    };

    if let Some(id) = envelope.id {
        if let Some(err) = envelope.error {
            return FeedMessage::Response {
                id,
                result: Err(format!("{} (code {})", err.message, err.code)),
            };
        }
        if let Some(result) = envelope.result {
            return FeedMessage::Response {
                id,
                result: Ok(result),
            };
        }
        return FeedMessage::Other;
    }

    match (envelope.method.as_deref(), envelope.params) {
        (Some("logsNotification"), Some(params)) => {
            let value = params.result.value;
            FeedMessage::Notification(LogNotification {
                subscription: params.subscription,
                signature: value.signature,
                slot: params.result.context.map_or(0, |c| c.slot),
                logs: value.logs.unwrap_or_default(),
                failed: value.err.is_some_and(|e| !e.is_null()),
            })
        }
        _ => FeedMessage::Other,
    }
}
