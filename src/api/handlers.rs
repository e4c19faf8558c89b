// HTTP request handlers

use crate::api::mappers::gemini::{
    diagnostic_chunk, gemini_to_openai_nonstream, gemini_to_openai_stream,
    sanitize_gemini_request, StreamState,
};
use crate::api::mappers::openai::openai_to_gemini;
use crate::api::streaming::{SseLineBuffer, SSE_DONE};
use crate::api::AppState;
use crate::bridge::protocol::UpstreamEvent;
use crate::config::{self, StreamingMode};
use crate::error::ProxyError;
use crate::proxy::{DispatchRequest, DispatchSuccess};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;

const GENERATE_OPS: [&str; 3] = ["generateContent", "streamGenerateContent", "countTokens"];

// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "AI Studio Proxy",
        "endpoints": [
            "POST /v1/chat/completions",
            "GET /v1/models",
            "GET /health",
            "GET /{version}/models",
            "POST /{version}/models/{model}:generateContent",
            "POST /{version}/models/{model}:streamGenerateContent"
        ]
    }))
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

fn known_models() -> Vec<(&'static str, i64)> {
    vec![
        ("gemini-2.5-pro", 1750118400),
        ("gemini-2.5-flash", 1750118400),
        ("gemini-2.5-flash-lite", 1753142400),
        ("gemini-2.5-flash-image", 1756339200),
        ("gemini-2.5-flash-preview-tts", 1747958400),
        ("gemini-embedding-001", 1742169600),
        ("gemini-3-pro-preview", 1737158400),
        ("gemini-3-flash-preview", 1765929600),
    ]
}

pub async fn openai_models(State(_state): State<AppState>) -> Json<ModelsResponse> {
    let data = known_models()
        .into_iter()
        .map(|(id, created)| ModelInfo {
            id: id.to_string(),
            object: "model".to_string(),
            created,
            owned_by: "google".to_string(),
        })
        .collect();
    Json(ModelsResponse { object: "list".to_string(), data })
}

pub async fn gemini_models() -> Json<Value> {
    let models: Vec<Value> = known_models()
        .into_iter()
        .map(|(id, _)| {
            json!({
                "name": format!("models/{id}"),
                "displayName": id,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent", "countTokens"]
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "browserConnected": state.dispatcher.bridge().connected(),
        "inflight": state.dispatcher.bridge().inflight_count()
    }))
}

fn error_response(status: u16, body: Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(body)).into_response()
}

fn openai_error(err: &ProxyError) -> Response {
    error_response(err.status_code(), err.openai_body())
}

fn gemini_error(err: &ProxyError) -> Response {
    error_response(err.status_code(), err.gemini_body())
}

/// OpenAI-compatible chat completions, streaming and non-streaming.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let Some(model) = body.get("model").and_then(|v| v.as_str()).map(str::to_string) else {
        return openai_error(&ProxyError::BadRequest("missing model".into()));
    };
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let gemini_body = match openai_to_gemini(&body).await {
        Ok(converted) => converted,
        Err(e) => return openai_error(&e),
    };

    let mut request = DispatchRequest::generative(
        String::new(),
        gemini_body.to_string(),
        model.clone(),
    );
    if stream {
        request.path = format!("v1beta/models/{model}:streamGenerateContent");
        request.query_params.insert("alt".to_string(), "sse".to_string());
    } else {
        request.path = format!("v1beta/models/{model}:generateContent");
    }

    let dispatched = match state.dispatcher.dispatch(request).await {
        Ok(dispatched) => dispatched,
        Err(e) => return openai_error(&e),
    };

    if stream {
        stream_openai_response(dispatched, model)
    } else {
        match collect_body(dispatched).await {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(parsed) => Json(gemini_to_openai_nonstream(&parsed, &model)).into_response(),
                Err(e) => {
                    openai_error(&ProxyError::Format(format!("upstream body parse: {e}")))
                }
            },
            Err(e) => openai_error(&e),
        }
    }
}

/// Drain a dispatched event stream into one body string.
async fn collect_body(mut dispatched: DispatchSuccess) -> Result<String, ProxyError> {
    let mut collected = String::new();
    loop {
        match dispatched.events.next_event().await? {
            UpstreamEvent::Chunk { data } => collected.push_str(&data),
            UpstreamEvent::StreamClose => return Ok(collected),
            UpstreamEvent::Error { status, message } => {
                return Err(ProxyError::UpstreamStatus { status, message });
            }
            UpstreamEvent::ResponseHeaders { .. } => {}
        }
    }
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Pipe upstream Gemini SSE through the stream translator. In fake mode the
/// whole upstream body arrives as one chunk and is replayed as a single
/// converted frame sequence.
fn stream_openai_response(mut dispatched: DispatchSuccess, model: String) -> Response {
    let fake = dispatched.mode == StreamingMode::Fake;

    let stream = async_stream::stream! {
        let mut state = StreamState::new();
        let mut lines = SseLineBuffer::new();
        let mut collected = String::new();

        loop {
            match dispatched.events.next_event().await {
                Ok(UpstreamEvent::Chunk { data }) => {
                    if fake {
                        collected.push_str(&data);
                        continue;
                    }
                    for payload in lines.push(&data) {
                        if let Ok(parsed) = serde_json::from_str::<Value>(&payload) {
                            let converted = gemini_to_openai_stream(&parsed, &model, &mut state);
                            if !converted.is_empty() {
                                yield Ok::<Bytes, Infallible>(Bytes::from(converted));
                            }
                        }
                    }
                }
                Ok(UpstreamEvent::StreamClose) => {
                    if fake {
                        for parsed in parse_buffered(&collected) {
                            let converted = gemini_to_openai_stream(&parsed, &model, &mut state);
                            if !converted.is_empty() {
                                yield Ok(Bytes::from(converted));
                            }
                        }
                    } else if let Some(payload) = lines.residual() {
                        if let Ok(parsed) = serde_json::from_str::<Value>(&payload) {
                            let converted = gemini_to_openai_stream(&parsed, &model, &mut state);
                            if !converted.is_empty() {
                                yield Ok(Bytes::from(converted));
                            }
                        }
                    }
                    yield Ok(Bytes::from(SSE_DONE));
                    break;
                }
                Ok(UpstreamEvent::Error { status, message }) => {
                    tracing::warn!("upstream error mid-stream ({}): {}", status, message);
                    yield Ok(Bytes::from(diagnostic_chunk(&mut state, &model, &message)));
                    yield Ok(Bytes::from(SSE_DONE));
                    break;
                }
                Ok(UpstreamEvent::ResponseHeaders { .. }) => {}
                Err(e) => {
                    tracing::warn!("stream aborted: {}", e);
                    yield Ok(Bytes::from(diagnostic_chunk(&mut state, &model, &e.to_string())));
                    yield Ok(Bytes::from(SSE_DONE));
                    break;
                }
            }
        }
    };

    sse_response(Body::from_stream(stream))
}

/// A buffered upstream body is either one response object or a JSON array of
/// stream chunks.
fn parse_buffered(raw: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Array(chunks)) => chunks,
        Ok(single) => vec![single],
        Err(_) => Vec::new(),
    }
}

/// Gemini-native generate/stream/countTokens. The upstream response is piped
/// back untouched.
pub async fn gemini_generate(
    State(state): State<AppState>,
    uri: axum::http::Uri,
    Path(action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(mut body): Json<Value>,
) -> Response {
    let version = uri
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("v1beta")
        .to_string();
    let Some((model, op)) = action.split_once(':') else {
        return gemini_error(&ProxyError::BadRequest(format!("malformed action {action}")));
    };
    if !GENERATE_OPS.contains(&op) {
        return gemini_error(&ProxyError::BadRequest(format!("unsupported operation {op}")));
    }

    if op != "countTokens" {
        sanitize_gemini_request(&mut body);
    }

    let mut request = DispatchRequest::generative(
        format!("{version}/models/{model}:{op}"),
        body.to_string(),
        model.to_string(),
    );
    for (key, value) in query {
        // Client-side API keys never travel upstream; auth rides on the
        // worker's session cookies.
        if key == "key" {
            continue;
        }
        request.query_params.insert(key, value);
    }

    let dispatched = match state.dispatcher.dispatch(request).await {
        Ok(dispatched) => dispatched,
        Err(e) => return gemini_error(&e),
    };

    let status = StatusCode::from_u16(dispatched.status).unwrap_or(StatusCode::OK);
    let content_type = dispatched
        .headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| "application/json".to_string());

    let mut events = dispatched.events;
    let stream = async_stream::stream! {
        loop {
            match events.next_event().await {
                Ok(UpstreamEvent::Chunk { data }) => {
                    yield Ok::<Bytes, Infallible>(Bytes::from(data));
                }
                Ok(UpstreamEvent::StreamClose) => break,
                Ok(UpstreamEvent::ResponseHeaders { .. }) => {}
                Ok(UpstreamEvent::Error { status, message }) => {
                    tracing::warn!("upstream error mid-stream ({}): {}", status, message);
                    break;
                }
                Err(e) => {
                    tracing::warn!("stream aborted: {}", e);
                    break;
                }
            }
        }
    };

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// Management surface: runtime knobs and identity control.

#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub streaming_mode: String,
    pub force_thinking: bool,
    pub force_web_search: bool,
    pub force_url_context: bool,
    /// Write-only: forwarded to the worker as a `set_log_level` frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_log_level: Option<String>,
}

pub async fn get_settings() -> Json<Settings> {
    Json(Settings {
        streaming_mode: config::streaming_mode().as_str().to_string(),
        force_thinking: config::force_thinking(),
        force_web_search: config::force_web_search(),
        force_url_context: config::force_url_context(),
        worker_log_level: None,
    })
}

pub async fn put_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Json<Settings> {
    config::set_streaming_mode(match settings.streaming_mode.as_str() {
        "fake" => StreamingMode::Fake,
        _ => StreamingMode::Real,
    });
    config::set_force_thinking(settings.force_thinking);
    config::set_force_web_search(settings.force_web_search);
    config::set_force_url_context(settings.force_url_context);
    if let Some(level) = settings.worker_log_level.as_deref() {
        state.dispatcher.bridge().set_log_level(level);
    }
    get_settings().await
}

pub async fn list_accounts(State(state): State<AppState>) -> Json<Value> {
    let status = state.dispatcher.status().await;
    let accounts: Vec<Value> = state
        .dispatcher
        .registry_snapshot()
        .into_iter()
        .map(|identity| {
            json!({
                "index": identity.index,
                "name": identity.display_name(),
                "active": status.active_index == Some(identity.index)
            })
        })
        .collect();
    Json(json!({ "accounts": accounts, "status": status }))
}

pub async fn reload_accounts(State(state): State<AppState>) -> Json<Value> {
    state.dispatcher.reload_registry();
    Json(json!({ "count": state.dispatcher.registry_snapshot().len() }))
}

#[derive(Debug, Deserialize)]
pub struct SwitchBody {
    pub index: Option<usize>,
}

pub async fn switch_account(
    State(state): State<AppState>,
    body: Option<Json<SwitchBody>>,
) -> Response {
    let target = body.and_then(|Json(b)| b.index);
    let result = match target {
        Some(index) => state.dispatcher.switch_to(index).await,
        None => state.dispatcher.switch_to_next().await,
    };
    match result {
        Ok(index) => Json(json!({ "active": index })).into_response(),
        Err(e) => gemini_error(&e),
    }
}
