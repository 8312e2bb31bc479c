//! Canned responses of the client-server API.

use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};

/// An empty sync response, with the `next_batch` token `"t_empty"`.
pub static EMPTY_SYNC: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "next_batch": "t_empty",
        "rooms": { "join": {}, "invite": {}, "leave": {} },
    })
});

/// `M_UNKNOWN_TOKEN`, as returned with a `401` status.
pub static UNKNOWN_TOKEN: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "errcode": "M_UNKNOWN_TOKEN",
        "error": "Invalid macaroon passed.",
        "soft_logout": false,
    })
});

/// `M_FORBIDDEN`, as returned with a `403` status.
pub static FORBIDDEN: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "errcode": "M_FORBIDDEN",
        "error": "You are not allowed to send events in this room.",
    })
});

/// `M_UNKNOWN`, as returned with a `500` status.
pub static INTERNAL_ERROR: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "errcode": "M_UNKNOWN",
        "error": "Internal server error",
    })
});

/// `M_LIMIT_EXCEEDED`, as returned with a `429` status, asking to wait
/// `retry_after_ms` milliseconds.
pub fn limit_exceeded(retry_after_ms: u64) -> JsonValue {
    json!({
        "errcode": "M_LIMIT_EXCEEDED",
        "error": "Too many requests",
        "retry_after_ms": retry_after_ms,
    })
}

/// The response to `PUT /rooms/{roomId}/send/{eventType}/{txnId}`.
pub fn event_id_response(event_id: &str) -> JsonValue {
    json!({ "event_id": event_id })
}

/// The response to `GET /rooms/{roomId}/messages?dir=b`.
///
/// `chunk` is in reverse chronological order, as the server sends it. A
/// missing `end` means the start of the room was reached.
pub fn messages_response(start: &str, end: Option<&str>, chunk: Vec<JsonValue>) -> JsonValue {
    let mut response = json!({
        "start": start,
        "chunk": chunk,
        "state": [],
    });

    if let Some(end) = end {
        response["end"] = end.into();
    }

    response
}
