// Worker-side execution of one request descriptor

use crate::agent::filters::apply_model_filters;
use crate::bridge::protocol::{
    chunk_frame, error_frame, headers_frame, stream_close_frame, RequestDescriptor,
};
use crate::config::{self, StreamingMode};
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// Idle timeout armed at dispatch and disarmed by the first received byte.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const ERROR_BODY_LIMIT: usize = 2048;

pub const PROXY_HOST_PARAM: &str = "__proxy_host__";

// Redirects are surfaced to the client (rewritten to come back through the
// proxy), never followed here.
static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("worker http client")
});

const BLOCKED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "origin",
    "referer",
    "user-agent",
];

#[derive(Debug)]
pub struct PreparedRequest {
    pub origin: String,
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

pub fn model_from_path(path: &str) -> Option<String> {
    let after = path.split("models/").nth(1)?;
    let model = after.split([':', '/', '?']).next()?;
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

fn is_generate_path(path: &str) -> bool {
    path.contains(":generateContent") || path.contains(":streamGenerateContent")
}

fn is_upload_path(path: &str) -> bool {
    let mut segments = path.trim_start_matches('/').split('/');
    segments.next().is_some() && segments.next() == Some("files")
}

fn build_query(params: &HashMap<String, String>) -> String {
    if params.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(&String, &String)> = params.iter().collect();
    pairs.sort();
    let encoded: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    format!("?{}", encoded.join("&"))
}

/// Resolve the target URL, sanitize headers, and assemble the body for a
/// descriptor. `upstream_origin` is the configured default host; a
/// `__proxy_host__` query parameter overrides it and is stripped before the
/// fetch goes out.
pub fn prepare(
    descriptor: &RequestDescriptor,
    cookie_header: &str,
    upstream_origin: &str,
) -> Result<PreparedRequest, String> {
    let mut query = descriptor.query_params.clone();
    let mut path = descriptor.path.trim_start_matches('/').to_string();

    // Query pairs may also ride on the path when a rewritten URL came back
    // through the HTTP surface.
    if let Some(pos) = path.find('?') {
        let trailing = path.split_off(pos);
        for pair in trailing.trim_start_matches('?').split('&') {
            let mut kv = pair.splitn(2, '=');
            if let (Some(k), v) = (kv.next(), kv.next().unwrap_or("")) {
                if !k.is_empty() {
                    let key = urlencoding::decode(k).map_err(|e| e.to_string())?.into_owned();
                    let value = urlencoding::decode(v).map_err(|e| e.to_string())?.into_owned();
                    query.insert(key, value);
                }
            }
        }
    }

    let origin = match query.remove(PROXY_HOST_PARAM) {
        Some(host) => config::normalize_origin(&host),
        None => upstream_origin.to_string(),
    };

    if origin == upstream_origin
        && descriptor.method.eq_ignore_ascii_case("post")
        && is_upload_path(&path)
        && !path.starts_with("upload/")
    {
        path = format!("upload/{path}");
    }

    if descriptor.streaming_mode == StreamingMode::Fake {
        if query.get("alt").map(|v| v == "sse").unwrap_or(false) {
            query.remove("alt");
        }
        path = path.replace(":streamGenerateContent", ":generateContent");
    }

    let mut headers: Vec<(String, String)> = descriptor
        .headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !BLOCKED_HEADERS.contains(&lower.as_str()) && !lower.starts_with("sec-fetch-")
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if !cookie_header.is_empty() {
        headers.push(("cookie".to_string(), cookie_header.to_string()));
    }

    let body = if !descriptor.is_generative && descriptor.body_b64.is_some() {
        let raw = descriptor.body_b64.as_deref().unwrap_or_default();
        Some(STANDARD.decode(raw).map_err(|e| format!("body_b64 decode: {e}"))?)
    } else if let Some(body) = descriptor.body.as_deref() {
        if descriptor.is_generative && is_generate_path(&path) {
            let mut value: Value =
                serde_json::from_str(body).map_err(|e| format!("body parse: {e}"))?;
            if let Some(model) = model_from_path(&path) {
                apply_model_filters(&model, &mut value);
            }
            Some(value.to_string().into_bytes())
        } else {
            Some(body.as_bytes().to_vec())
        }
    } else {
        None
    };

    let url = match descriptor.url.as_deref() {
        Some(explicit) => format!("{explicit}{}", build_query(&query)),
        None => format!("{origin}/{path}{}", build_query(&query)),
    };

    Ok(PreparedRequest {
        origin,
        url,
        method: descriptor.method.to_ascii_uppercase(),
        headers,
        body,
    })
}

/// Rewrite an upstream redirect/upload URL so the client's follow-up request
/// comes back through the proxy, carrying the original host along.
pub fn rewrite_upstream_url(value: &str, origin: &str, public_base: &str) -> String {
    let Some(rest) = value.strip_prefix(origin) else {
        return value.to_string();
    };
    let rest = if rest.starts_with('/') { rest.to_string() } else { format!("/{rest}") };
    let sep = if rest.contains('?') { '&' } else { '?' };
    format!("{public_base}{rest}{sep}{PROXY_HOST_PARAM}={}", urlencoding::encode(origin))
}

fn emit(out: &mpsc::UnboundedSender<Message>, frame: String) {
    let _ = out.send(Message::Text(frame));
}

/// Execute one descriptor end to end, reporting progress as frames on `out`.
/// Always finishes with a terminal frame: `stream_close` on success or
/// abort, `error` on failure (504 when the idle timeout fires).
pub async fn run_request(
    descriptor: RequestDescriptor,
    cookie_header: String,
    out: mpsc::UnboundedSender<Message>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let id = descriptor.request_id.clone();
    let app = config::get();

    let prepared = match prepare(&descriptor, &cookie_header, &app.upstream_host) {
        Ok(prepared) => prepared,
        Err(message) => {
            emit(&out, error_frame(&id, 400, &message));
            return;
        }
    };

    tracing::debug!("[{}] {} {}", id, prepared.method, prepared.url);

    let method = match reqwest::Method::from_bytes(prepared.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            emit(&out, error_frame(&id, 400, "invalid method"));
            return;
        }
    };

    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in &prepared.headers {
        let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = reqwest::header::HeaderValue::from_str(value) else {
            continue;
        };
        header_map.insert(name, value);
    }

    let mut request = CLIENT.request(method, &prepared.url).headers(header_map);
    if let Some(body) = prepared.body {
        request = request.body(body);
    }

    let response = tokio::select! {
        _ = &mut cancel_rx => {
            emit(&out, stream_close_frame(&id));
            return;
        }
        sent = tokio::time::timeout(IDLE_TIMEOUT, request.send()) => match sent {
            Err(_) => {
                emit(&out, error_frame(&id, 504, "upstream idle timeout"));
                return;
            }
            Ok(Err(e)) => {
                emit(&out, error_frame(&id, 502, &format!("upstream fetch failed: {e}")));
                return;
            }
            Ok(Ok(response)) => response,
        }
    };

    let status = response.status().as_u16();

    if !(200..300).contains(&status) {
        let body = tokio::time::timeout(Duration::from_secs(30), response.text())
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        let mut message = body.trim().to_string();
        message.truncate(ERROR_BODY_LIMIT);
        if message.is_empty() {
            message = format!("upstream status {status}");
        }
        emit(&out, error_frame(&id, status, &message));
        return;
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else { continue };
        let lower = name.as_str().to_ascii_lowercase();
        let value = if (lower == "location" || lower == "x-goog-upload-url")
            && value.starts_with(&prepared.origin)
        {
            rewrite_upstream_url(value, &prepared.origin, &app.public_base_url)
        } else {
            value.to_string()
        };
        headers.insert(lower, value);
    }
    emit(&out, headers_frame(&id, status, &headers));

    let fake = descriptor.streaming_mode == StreamingMode::Fake;
    let mut body_stream = response.bytes_stream();
    let mut collected = String::new();
    let mut first = true;

    loop {
        let next = tokio::select! {
            _ = &mut cancel_rx => {
                emit(&out, stream_close_frame(&id));
                return;
            }
            next = async {
                // The idle timer is disarmed once the first byte arrives.
                if first {
                    tokio::time::timeout(IDLE_TIMEOUT, body_stream.next()).await
                } else {
                    Ok(body_stream.next().await)
                }
            } => next,
        };

        let item = match next {
            Err(_) => {
                emit(&out, error_frame(&id, 504, "upstream idle timeout"));
                return;
            }
            Ok(item) => item,
        };

        match item {
            Some(Ok(bytes)) => {
                first = false;
                let text = String::from_utf8_lossy(&bytes);
                if fake {
                    collected.push_str(&text);
                } else {
                    emit(&out, chunk_frame(&id, &text));
                }
            }
            Some(Err(e)) => {
                emit(&out, error_frame(&id, 502, &format!("upstream body error: {e}")));
                return;
            }
            None => break,
        }
    }

    if fake && !collected.is_empty() {
        emit(&out, chunk_frame(&id, &collected));
    }
    emit(&out, stream_close_frame(&id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::EVENT_REQUEST;

    fn descriptor(path: &str, mode: StreamingMode) -> RequestDescriptor {
        RequestDescriptor {
            request_id: "r1".into(),
            event_type: EVENT_REQUEST.into(),
            method: "POST".into(),
            path: path.into(),
            url: None,
            query_params: HashMap::new(),
            headers: HashMap::new(),
            body: Some("{\"contents\":[]}".into()),
            body_b64: None,
            is_generative: true,
            streaming_mode: mode,
        }
    }

    #[test]
    fn test_proxy_host_override_stripped() {
        let mut d = descriptor("resumable/upload?x=1", StreamingMode::Real);
        d.query_params
            .insert(PROXY_HOST_PARAM.to_string(), "http://other.example:9000".to_string());
        let prepared = prepare(&d, "", "https://default.example").unwrap();
        assert_eq!(prepared.origin, "http://other.example:9000");
        assert!(prepared.url.starts_with("http://other.example:9000/resumable/upload"));
        assert!(!prepared.url.contains(PROXY_HOST_PARAM));
        assert!(prepared.url.contains("x=1"));
    }

    #[test]
    fn test_upload_path_normalized_on_default_host() {
        let d = descriptor("v1beta/files", StreamingMode::Real);
        let prepared = prepare(&d, "", "https://default.example").unwrap();
        assert!(prepared.url.starts_with("https://default.example/upload/v1beta/files"));
    }

    #[test]
    fn test_fake_mode_rewrites_stream_path() {
        let mut d = descriptor(
            "v1beta/models/gemini-2.5-flash:streamGenerateContent",
            StreamingMode::Fake,
        );
        d.query_params.insert("alt".into(), "sse".into());
        let prepared = prepare(&d, "", "https://default.example").unwrap();
        assert!(prepared.url.contains(":generateContent"));
        assert!(!prepared.url.contains("alt="));
    }

    #[test]
    fn test_header_sanitization_keeps_cookie() {
        let mut d = descriptor("v1beta/models/m:generateContent", StreamingMode::Real);
        d.headers.insert("Host".into(), "evil".into());
        d.headers.insert("User-Agent".into(), "curl".into());
        d.headers.insert("Sec-Fetch-Mode".into(), "cors".into());
        d.headers.insert("content-type".into(), "application/json".into());
        let prepared = prepare(&d, "SID=abc", "https://default.example").unwrap();
        let names: Vec<&str> = prepared.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"cookie"));
        assert!(!names.iter().any(|n| n.eq_ignore_ascii_case("host")));
        assert!(!names.iter().any(|n| n.eq_ignore_ascii_case("user-agent")));
        assert!(!names.iter().any(|n| n.to_ascii_lowercase().starts_with("sec-fetch-")));
    }

    #[test]
    fn test_body_b64_decoding_for_non_generative() {
        let mut d = descriptor("v1beta/files", StreamingMode::Real);
        d.is_generative = false;
        d.body = None;
        d.body_b64 = Some(STANDARD.encode(b"raw-bytes"));
        let prepared = prepare(&d, "", "https://default.example").unwrap();
        assert_eq!(prepared.body.as_deref(), Some(&b"raw-bytes"[..]));
    }

    #[test]
    fn test_rewrite_upstream_url() {
        let rewritten = rewrite_upstream_url(
            "https://default.example/upload/v1beta/files?upload_id=42",
            "https://default.example",
            "http://127.0.0.1:2048",
        );
        assert!(rewritten.starts_with("http://127.0.0.1:2048/upload/v1beta/files?upload_id=42&"));
        assert!(rewritten.contains("__proxy_host__=https%3A%2F%2Fdefault.example"));

        // Foreign origins pass through untouched.
        let other = rewrite_upstream_url(
            "https://elsewhere.example/x",
            "https://default.example",
            "http://127.0.0.1:2048",
        );
        assert_eq!(other, "https://elsewhere.example/x");
    }

    #[test]
    fn test_model_from_path() {
        assert_eq!(
            model_from_path("v1beta/models/gemini-2.5-pro:generateContent").as_deref(),
            Some("gemini-2.5-pro")
        );
        assert_eq!(model_from_path("v1beta/files"), None);
    }
}
