// End-to-end pipeline scenarios against a scripted upstream.
//
// One proxy server, one in-process worker, and one fake upstream are shared
// by every test; tests serialize on a lock because identity switches are
// process-global.

use aistudio_proxy::api::{build_router, AppState};
use aistudio_proxy::auth::IdentityRegistry;
use aistudio_proxy::bridge::launcher::WorkerLauncher;
use aistudio_proxy::config::{self, AppConfig};
use aistudio_proxy::proxy::Dispatcher;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const API_KEY: &str = "test-key";

#[derive(Debug, Clone)]
struct Hit {
    model: String,
    op: String,
    cookie: String,
    body: Value,
}

#[derive(Default)]
struct UpstreamState {
    hits: Mutex<Vec<Hit>>,
    flaky_calls: AtomicUsize,
}

impl UpstreamState {
    fn hits_for(&self, model: &str) -> Vec<Hit> {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|hit| hit.model == model)
            .cloned()
            .collect()
    }
}

fn sse_body(frames: &[Value]) -> String {
    frames.iter().map(|frame| format!("data: {frame}\n\n")).collect()
}

fn text_chunk(text: &str) -> Value {
    json!({ "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }] })
}

fn final_chunk() -> Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [] },
            "finishReason": "STOP"
        }],
        "usageMetadata": { "promptTokenCount": 2, "candidatesTokenCount": 5 }
    })
}

fn nonstream_response(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": "STOP"
        }],
        "usageMetadata": { "promptTokenCount": 2, "candidatesTokenCount": 5 }
    })
}

async fn upstream_handler(
    State(state): State<Arc<UpstreamState>>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (model, op) = action.split_once(':').unwrap_or((action.as_str(), ""));
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.hits.lock().unwrap().push(Hit {
        model: model.to_string(),
        op: op.to_string(),
        cookie,
        body: parsed,
    });

    match model {
        "gemini-flaky" => {
            if state.flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return (StatusCode::TOO_MANY_REQUESTS, "quota exhausted").into_response();
            }
            axum::Json(nonstream_response("recovered")).into_response()
        }
        "gemini-tools" => {
            let frames = vec![
                json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": [{
                            "functionCall": { "name": "get_weather", "args": { "city": "Tokyo" } }
                        }]}
                    }]
                }),
                json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": [] },
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": { "promptTokenCount": 9, "candidatesTokenCount": 3 }
                }),
            ];
            sse_response(sse_body(&frames))
        }
        "gemini-slow" => {
            let first = sse_body(&[text_chunk("slow-start")]);
            let rest = sse_body(&[final_chunk()]);
            let stream = async_stream_body(first, rest);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(stream)
                .unwrap()
        }
        _ if op == "streamGenerateContent" => {
            let frames = vec![text_chunk("Hel"), text_chunk("lo"), final_chunk()];
            sse_response(sse_body(&frames))
        }
        _ => axum::Json(nonstream_response("Hello from upstream")).into_response(),
    }
}

fn sse_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

/// First frame immediately, the rest after a long stall; used to test
/// cancellation mid-stream.
fn async_stream_body(first: String, rest: String) -> Body {
    let stream = async_stream::stream! {
        yield Ok::<Bytes, Infallible>(Bytes::from(first));
        tokio::time::sleep(Duration::from_secs(30)).await;
        yield Ok(Bytes::from(rest));
    };
    Body::from_stream(stream)
}

struct TestEnv {
    rt: tokio::runtime::Runtime,
    base_url: String,
    upstream: Arc<UpstreamState>,
    dispatcher: Arc<Dispatcher>,
    lock: Mutex<()>,
    _auth_dir: tempfile::TempDir,
}

impl TestEnv {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

static ENV: Lazy<TestEnv> = Lazy::new(|| {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("test runtime");

    let auth_dir = tempfile::tempdir().expect("auth dir");
    for index in 0..2 {
        let file = json!({
            "cookies": [{
                "name": "SID",
                "value": format!("acct{index}"),
                "domain": ".google.com",
                "path": "/"
            }],
            "origins": [],
            "accountName": format!("account-{index}")
        });
        std::fs::write(
            auth_dir.path().join(format!("auth-{index}.json")),
            file.to_string(),
        )
        .expect("identity file");
    }

    let (base_url, upstream, dispatcher) = rt.block_on(async {
        let upstream = Arc::new(UpstreamState::default());
        let upstream_app = Router::new()
            .route("/v1beta/models/*action", post(upstream_handler))
            .with_state(upstream.clone());
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(upstream_listener, upstream_app).await.ok();
        });

        config::init(AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_keys: vec![API_KEY.to_string()],
            auth_dir: auth_dir.path().to_string_lossy().to_string(),
            upstream_host: format!("http://{upstream_addr}"),
            public_base_url: "http://127.0.0.1:2048".to_string(),
            max_retries: 3,
            retry_delay_ms: 50,
            switch_on_uses: 0,
            failure_threshold: 0,
            immediate_switch_status_codes: vec![429, 503],
        });

        let registry = IdentityRegistry::scan(auth_dir.path().to_path_buf());
        let launcher = WorkerLauncher::InProcess(Arc::new(|ws_url: String, path| {
            tokio::spawn(async move {
                if let Err(e) = aistudio_proxy::agent::run_worker(ws_url, path).await {
                    eprintln!("worker exited: {e:#}");
                }
            })
        }));
        let dispatcher = Dispatcher::new(registry, launcher);

        let app = build_router(AppState { dispatcher: dispatcher.clone() });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (format!("http://{addr}"), upstream, dispatcher)
    });

    TestEnv { rt, base_url, upstream, dispatcher, lock: Mutex::new(()), _auth_dir: auth_dir }
});

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn sse_payloads(raw: &str) -> Vec<Value> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|payload| *payload != "[DONE]")
        .map(|payload| serde_json::from_str(payload).expect("sse payload"))
        .collect()
}

#[test]
fn test_simple_chat_nonstream() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .post(format!("{}/v1/chat/completions", ENV.base_url))
            .bearer_auth(API_KEY)
            .json(&json!({
                "model": "gemini-2.5-flash-lite",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.expect("json body");
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello from upstream");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body["usage"]["prompt_tokens"].as_i64().unwrap() >= 1);
    });
}

#[test]
fn test_real_streaming() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .post(format!("{}/v1/chat/completions", ENV.base_url))
            .bearer_auth(API_KEY)
            .json(&json!({
                "model": "gemini-2.5-flash-lite",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .starts_with("text/event-stream"));

        let raw = response.text().await.expect("body");
        assert!(raw.trim_end().ends_with("data: [DONE]"));
        let frames = sse_payloads(&raw);

        let content_frames: Vec<&Value> = frames
            .iter()
            .filter(|f| f["choices"][0]["delta"].get("content").is_some())
            .collect();
        assert_eq!(content_frames[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(content_frames[0]["choices"][0]["delta"]["content"], "Hel");
        assert!(content_frames[1]["choices"][0]["delta"].get("role").is_none());
        assert_eq!(content_frames[1]["choices"][0]["delta"]["content"], "lo");

        let final_frame = frames
            .iter()
            .find(|f| f["choices"][0]["finish_reason"] == "stop")
            .expect("final frame");
        assert!(final_frame["usage"]["total_tokens"].as_i64().unwrap() > 0);

        // The upstream actually saw the streaming operation.
        let hits = ENV.upstream.hits_for("gemini-2.5-flash-lite");
        assert!(hits.iter().any(|hit| hit.op == "streamGenerateContent"));
    });
}

#[test]
fn test_tool_calling_stream() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .post(format!("{}/v1/chat/completions", ENV.base_url))
            .bearer_auth(API_KEY)
            .json(&json!({
                "model": "gemini-tools",
                "messages": [{"role": "user", "content": "weather in tokyo?"}],
                "tools": [{"type": "function", "function": {
                    "name": "get_weather",
                    "parameters": {
                        "type": "object",
                        "properties": {"city": {"type": "string"}},
                        "required": ["city"]
                    }
                }}],
                "tool_choice": "required",
                "stream": true
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let raw = response.text().await.expect("body");
        let frames = sse_payloads(&raw);

        let call_frame = frames
            .iter()
            .find(|f| f["choices"][0]["delta"].get("tool_calls").is_some())
            .expect("tool call frame");
        let call = &call_frame["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert_eq!(call["function"]["name"], "get_weather");
        assert_eq!(call["function"]["arguments"], "{\"city\":\"Tokyo\"}");

        let final_frame = frames
            .iter()
            .find(|f| !f["choices"][0]["finish_reason"].is_null())
            .expect("final frame");
        assert_eq!(final_frame["choices"][0]["finish_reason"], "tool_calls");

        // The upstream saw the sanitized tool schema and the required mode.
        let hit = ENV.upstream.hits_for("gemini-tools").pop().expect("upstream hit");
        assert_eq!(
            hit.body["toolConfig"]["functionCallingConfig"]["mode"],
            "ANY"
        );
        let params = &hit.body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert_eq!(params["type"], "OBJECT");
    });
}

#[test]
fn test_immediate_switch_on_429() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .post(format!("{}/v1/chat/completions", ENV.base_url))
            .bearer_auth(API_KEY)
            .json(&json!({
                "model": "gemini-flaky",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            }))
            .send()
            .await
            .expect("request");

        // The client sees exactly one successful response.
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["choices"][0]["message"]["content"], "recovered");

        // Two upstream calls under different identities: the 429 rotated the
        // cursor.
        let hits = ENV.upstream.hits_for("gemini-flaky");
        assert_eq!(hits.len(), 2);
        assert_ne!(hits[0].cookie, hits[1].cookie);
    });
}

#[test]
fn test_cancellation_releases_request() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        use futures::StreamExt;

        let response = client()
            .post(format!("{}/v1/chat/completions", ENV.base_url))
            .bearer_auth(API_KEY)
            .json(&json!({
                "model": "gemini-slow",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);

        let mut body = response.bytes_stream();
        let first = body.next().await.expect("first chunk").expect("chunk bytes");
        assert!(String::from_utf8_lossy(&first).contains("slow-start"));

        // Disconnect mid-stream.
        drop(body);

        let mut drained = false;
        for _ in 0..50 {
            if ENV.dispatcher.bridge().inflight_count() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(drained, "request id still registered after disconnect");
    });
}

#[test]
fn test_tts_model_sanitization() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .post(format!("{}/v1/chat/completions", ENV.base_url))
            .bearer_auth(API_KEY)
            .json(&json!({
                "model": "gemini-2.5-flash-preview-tts",
                "messages": [{"role": "user", "content": "say hi"}],
                "tools": [{"type": "function", "function": {
                    "name": "noop",
                    "parameters": {"type": "object", "properties": {}}
                }}],
                "thinking_config": {"includeThoughts": true},
                "stream": false
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);

        let hit = ENV
            .upstream
            .hits_for("gemini-2.5-flash-preview-tts")
            .pop()
            .expect("upstream hit");
        assert!(hit.body.get("tools").is_none());
        assert!(hit.body["generationConfig"].get("thinkingConfig").is_none());
        assert_eq!(hit.body["generationConfig"]["responseModalities"], json!(["AUDIO"]));
    });
}

#[test]
fn test_gemini_native_stream_passthrough() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .post(format!(
                "{}/v1beta/models/gemini-2.5-flash-lite:streamGenerateContent?alt=sse",
                ENV.base_url
            ))
            .header("x-goog-api-key", API_KEY)
            .json(&json!({
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let raw = response.text().await.expect("body");

        // Untouched Gemini frames, not OpenAI chunks.
        let frames: Vec<Value> = raw
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|payload| serde_json::from_str(payload).expect("payload"))
            .collect();
        assert!(frames[0]["candidates"][0]["content"]["parts"][0]["text"].is_string());
        assert!(frames.iter().any(|f| f["candidates"][0]["finishReason"] == "STOP"));
    });
}

#[test]
fn test_missing_api_key_rejected() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .post(format!("{}/v1/chat/completions", ENV.base_url))
            .json(&json!({
                "model": "gemini-2.5-flash-lite",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 401);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["error"]["type"], "authentication_error");
    });
}

#[test]
fn test_health_reports_worker_state() {
    let _guard = ENV.lock();
    ENV.rt.block_on(async {
        let response = client()
            .get(format!("{}/health", ENV.base_url))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["status"], "ok");
        assert!(body.get("browserConnected").is_some());
    });
}
