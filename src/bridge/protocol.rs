// Duplex-channel wire format: one JSON document per text frame

use crate::config::StreamingMode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

pub const EVENT_REQUEST: &str = "request";
pub const EVENT_CANCEL: &str = "cancel_request";
pub const EVENT_SET_LOG_LEVEL: &str = "set_log_level";
pub const EVENT_HANDSHAKE: &str = "handshake";

fn default_event_type() -> String {
    EVENT_REQUEST.to_string()
}

/// The unit of work shipped to the egress worker.
///
/// `body` carries UTF-8 JSON for generative requests; `body_b64` carries
/// arbitrary bytes for non-generative uploads. The two are mutually
/// exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub request_id: String,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    #[serde(default)]
    pub is_generative: bool,
    pub streaming_mode: StreamingMode,
}

/// Messages flowing back from the worker, keyed by `request_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    ResponseHeaders { status: u16, headers: HashMap<String, String> },
    Chunk { data: String },
    StreamClose,
    Error { status: u16, message: String },
}

/// Parse a frame received from the worker. Returns the target request id and
/// the decoded event; `None` for frames without one (handshake, junk).
pub fn parse_upstream_frame(text: &str) -> Option<(String, UpstreamEvent)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let request_id = value.get("request_id")?.as_str()?.to_string();
    let event_type = value.get("event_type").and_then(|v| v.as_str())?;

    let event = match event_type {
        "response_headers" => UpstreamEvent::ResponseHeaders {
            status: value.get("status").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
            headers: value
                .get("headers")
                .and_then(|v| v.as_object())
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
        },
        "chunk" => UpstreamEvent::Chunk {
            data: value.get("data").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        },
        "stream_close" => UpstreamEvent::StreamClose,
        "error" => UpstreamEvent::Error {
            status: value.get("status").and_then(|v| v.as_u64()).unwrap_or(502) as u16,
            message: value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("upstream error")
                .to_string(),
        },
        _ => return None,
    };

    Some((request_id, event))
}

pub fn is_handshake_frame(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("event_type").and_then(|e| e.as_str()).map(|e| e == EVENT_HANDSHAKE))
        .unwrap_or(false)
}

pub fn handshake_frame() -> String {
    json!({ "event_type": EVENT_HANDSHAKE }).to_string()
}

pub fn cancel_frame(request_id: &str) -> String {
    json!({ "request_id": request_id, "event_type": EVENT_CANCEL }).to_string()
}

pub fn set_log_level_frame(level: &str) -> String {
    json!({ "event_type": EVENT_SET_LOG_LEVEL, "level": level }).to_string()
}

pub fn headers_frame(request_id: &str, status: u16, headers: &HashMap<String, String>) -> String {
    json!({
        "request_id": request_id,
        "event_type": "response_headers",
        "status": status,
        "headers": headers
    })
    .to_string()
}

pub fn chunk_frame(request_id: &str, data: &str) -> String {
    json!({ "request_id": request_id, "event_type": "chunk", "data": data }).to_string()
}

pub fn stream_close_frame(request_id: &str) -> String {
    json!({ "request_id": request_id, "event_type": "stream_close" }).to_string()
}

pub fn error_frame(request_id: &str, status: u16, message: &str) -> String {
    json!({
        "request_id": request_id,
        "event_type": "error",
        "status": status,
        "message": message
    })
    .to_string()
}
