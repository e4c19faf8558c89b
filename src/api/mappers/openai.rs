// OpenAI Chat Completions → Gemini generateContent translation

use crate::config;
use crate::error::ProxyError;
use base64::{engine::general_purpose::STANDARD, Engine};
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

/// Some models refuse a `functionCall` part without a thought signature; this
/// placeholder satisfies the validator. Kept in one place in case a future
/// model starts rejecting it.
pub const THOUGHT_SIGNATURE_PLACEHOLDER: &str = "skip-thought-signature-check";

static IMAGE_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

fn safety_settings() -> Value {
    Value::Array(
        SAFETY_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
            .collect(),
    )
}

/// Translate a full OpenAI chat request body into a Gemini request body.
/// Async because `image_url` entries with remote URLs are fetched and
/// inlined.
pub async fn openai_to_gemini(body: &Value) -> Result<Value, ProxyError> {
    let messages = body
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProxyError::BadRequest("messages must be an array".into()))?;

    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    // Consecutive tool messages coalesce into one user entry of
    // functionResponse parts; Gemini requires alternating roles.
    let mut pending_tool_parts: Vec<Value> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        match role {
            "system" => {
                let text = plain_text(message.get("content").unwrap_or(&Value::Null));
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            "tool" => {
                pending_tool_parts.push(tool_response_part(message));
            }
            "assistant" => {
                flush_tool_parts(&mut contents, &mut pending_tool_parts);
                contents.push(assistant_entry(message).await);
            }
            _ => {
                flush_tool_parts(&mut contents, &mut pending_tool_parts);
                let parts = content_to_parts(message.get("content").unwrap_or(&Value::Null)).await;
                contents.push(json!({ "role": "user", "parts": parts }));
            }
        }
    }
    flush_tool_parts(&mut contents, &mut pending_tool_parts);

    let mut request = Map::new();
    request.insert("contents".to_string(), Value::Array(contents));

    if !system_texts.is_empty() {
        request.insert(
            "systemInstruction".to_string(),
            json!({ "role": "user", "parts": [{ "text": system_texts.join("\n") }] }),
        );
    }

    let mut tools: Vec<Value> = Vec::new();
    if let Some(declared) = body.get("tools").and_then(|v| v.as_array()) {
        let declarations: Vec<Value> = declared
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                let mut decl = Map::new();
                if let Some(name) = function.get("name") {
                    decl.insert("name".to_string(), name.clone());
                }
                if let Some(description) = function.get("description") {
                    decl.insert("description".to_string(), description.clone());
                }
                if let Some(parameters) = function.get("parameters") {
                    decl.insert("parameters".to_string(), scrub_schema(parameters));
                }
                Value::Object(decl)
            })
            .collect();
        if !declarations.is_empty() {
            tools.push(json!({ "functionDeclarations": declarations }));
        }
    }
    if config::force_web_search() && !tools.iter().any(|t| t.get("googleSearch").is_some()) {
        tools.push(json!({ "googleSearch": {} }));
    }
    if config::force_url_context() && !tools.iter().any(|t| t.get("urlContext").is_some()) {
        tools.push(json!({ "urlContext": {} }));
    }
    if !tools.is_empty() {
        request.insert("tools".to_string(), Value::Array(tools));
    }

    if let Some(tool_config) = tool_choice_config(body.get("tool_choice")) {
        request.insert("toolConfig".to_string(), tool_config);
    }

    request.insert("generationConfig".to_string(), generation_config(body));
    request.insert("safetySettings".to_string(), safety_settings());

    Ok(Value::Object(request))
}

fn flush_tool_parts(contents: &mut Vec<Value>, pending: &mut Vec<Value>) {
    if pending.is_empty() {
        return;
    }
    let parts = std::mem::take(pending);
    contents.push(json!({ "role": "user", "parts": parts }));
}

fn tool_response_part(message: &Value) -> Value {
    let name = message
        .get("name")
        .and_then(|v| v.as_str())
        .or_else(|| message.get("tool_call_id").and_then(|v| v.as_str()))
        .unwrap_or("tool");
    let content = message.get("content").cloned().unwrap_or(Value::Null);
    let response = match &content {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .ok()
            .filter(|v| v.is_object())
            .unwrap_or_else(|| json!({ "result": raw })),
        other => json!({ "result": other }),
    };
    json!({ "functionResponse": { "name": name, "response": response } })
}

async fn assistant_entry(message: &Value) -> Value {
    let mut parts = content_to_parts(message.get("content").unwrap_or(&Value::Null)).await;

    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        let mut first_call = true;
        for call in calls {
            let Some(function) = call.get("function") else { continue };
            let name = function.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let args = match function.get("arguments") {
                Some(Value::String(raw)) => {
                    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!({}))
                }
                Some(other) => other.clone(),
                None => json!({}),
            };
            let mut part = json!({ "functionCall": { "name": name, "args": args } });
            if first_call {
                part["thoughtSignature"] = json!(THOUGHT_SIGNATURE_PLACEHOLDER);
                first_call = false;
            }
            parts.push(part);
        }
    }

    json!({ "role": "model", "parts": parts })
}

fn plain_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

async fn content_to_parts(content: &Value) -> Vec<Value> {
    match content {
        Value::String(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({ "text": text })]
            }
        }
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match item_type {
                    "text" => {
                        let text = item.get("text").and_then(|v| v.as_str()).unwrap_or("");
                        parts.push(json!({ "text": text }));
                    }
                    "image_url" => {
                        let url = item
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        parts.push(image_part(url).await);
                    }
                    _ => {}
                }
            }
            parts
        }
        _ => Vec::new(),
    }
}

async fn image_part(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        let mut halves = rest.splitn(2, ",");
        let meta = halves.next().unwrap_or("");
        let data = halves.next().unwrap_or("");
        let mime = meta.split(';').next().filter(|m| !m.is_empty()).unwrap_or("image/jpeg");
        return json!({ "inlineData": { "mimeType": mime, "data": data } });
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        match fetch_image(url).await {
            Ok((mime, data)) => {
                return json!({ "inlineData": { "mimeType": mime, "data": data } });
            }
            Err(e) => {
                tracing::warn!("image fetch failed for {}: {}", url, e);
                return json!({
                    "text": format!("[System Note: Failed to load image {url}: {e}]")
                });
            }
        }
    }

    json!({ "text": format!("[System Note: Failed to load image {url}: unsupported scheme]") })
}

async fn fetch_image(url: &str) -> Result<(String, String), String> {
    let response = IMAGE_CLIENT.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| v.starts_with("image/"))
        .or_else(|| mime_guess::from_path(url).first().map(|m| m.essence_str().to_string()))
        .unwrap_or_else(|| "image/jpeg".to_string());
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    Ok((mime, STANDARD.encode(&bytes)))
}

/// Rewrite an OpenAI JSON-schema for Gemini: `$schema` and
/// `additionalProperties` stripped, types uppercased, `["T","null"]` unions
/// folded to nullable, empty unions defaulting to STRING.
pub fn scrub_schema(schema: &Value) -> Value {
    scrub_schema_inner(schema, false)
}

// Keys inside a `properties` map are field names, not schema keywords.
fn scrub_schema_inner(schema: &Value, in_properties: bool) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            let mut nullable = false;
            for (key, value) in map {
                if in_properties {
                    out.insert(key.clone(), scrub_schema_inner(value, false));
                    continue;
                }
                match key.as_str() {
                    "$schema" | "additionalProperties" => continue,
                    "type" => match value {
                        Value::String(t) => {
                            out.insert("type".to_string(), json!(t.to_ascii_uppercase()));
                        }
                        Value::Array(types) => {
                            let non_null: Vec<&str> = types
                                .iter()
                                .filter_map(|t| t.as_str())
                                .filter(|t| !t.eq_ignore_ascii_case("null"))
                                .collect();
                            if non_null.len() < types.len() {
                                nullable = true;
                            }
                            let chosen = non_null.first().copied().unwrap_or("string");
                            out.insert("type".to_string(), json!(chosen.to_ascii_uppercase()));
                        }
                        other => {
                            out.insert("type".to_string(), other.clone());
                        }
                    },
                    "properties" => {
                        out.insert(key.clone(), scrub_schema_inner(value, true));
                    }
                    _ => {
                        out.insert(key.clone(), scrub_schema_inner(value, false));
                    }
                }
            }
            if nullable {
                out.insert("nullable".to_string(), json!(true));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| scrub_schema_inner(item, false)).collect())
        }
        other => other.clone(),
    }
}

fn tool_choice_config(choice: Option<&Value>) -> Option<Value> {
    let choice = choice?;
    let config = match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => json!({ "functionCallingConfig": { "mode": "AUTO" } }),
            "none" => json!({ "functionCallingConfig": { "mode": "NONE" } }),
            "required" => json!({ "functionCallingConfig": { "mode": "ANY" } }),
            _ => return None,
        },
        Value::Object(_) => {
            let name = choice
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())?;
            json!({
                "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [name] }
            })
        }
        _ => return None,
    };
    Some(config)
}

fn generation_config(body: &Value) -> Value {
    let mut config = Map::new();
    if let Some(v) = body.get("temperature").filter(|v| !v.is_null()) {
        config.insert("temperature".to_string(), v.clone());
    }
    if let Some(v) = body.get("top_p").filter(|v| !v.is_null()) {
        config.insert("topP".to_string(), v.clone());
    }
    if let Some(v) = body.get("top_k").filter(|v| !v.is_null()) {
        config.insert("topK".to_string(), v.clone());
    }
    if let Some(v) = body.get("max_tokens").filter(|v| !v.is_null()) {
        config.insert("maxOutputTokens".to_string(), v.clone());
    }
    match body.get("stop") {
        Some(Value::String(stop)) => {
            config.insert("stopSequences".to_string(), json!([stop]));
        }
        Some(Value::Array(stops)) => {
            config.insert("stopSequences".to_string(), Value::Array(stops.clone()));
        }
        _ => {}
    }

    if let Some(thinking) = thinking_config(body) {
        config.insert("thinkingConfig".to_string(), thinking);
    }

    Value::Object(config)
}

/// Thinking configuration hides under several client-specific aliases; the
/// first one present wins and is normalized to `{includeThoughts}`.
fn thinking_config(body: &Value) -> Option<Value> {
    let aliases = [
        body.get("extra_body").and_then(|v| v.get("google")).and_then(|v| v.get("thinking_config")),
        body.get("extra_body").and_then(|v| v.get("thinkingConfig")),
        body.get("thinking_config"),
        body.get("thinkingConfig"),
    ];
    for alias in aliases.into_iter().flatten() {
        let include = alias
            .get("includeThoughts")
            .or_else(|| alias.get("include_thoughts"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        return Some(json!({ "includeThoughts": include }));
    }
    if body.get("reasoning_effort").map(|v| !v.is_null()).unwrap_or(false) {
        return Some(json!({ "includeThoughts": true }));
    }
    if config::force_thinking() {
        return Some(json!({ "includeThoughts": true }));
    }
    None
}
