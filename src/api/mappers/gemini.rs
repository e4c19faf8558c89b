// Gemini generateContent → OpenAI Chat Completions translation

use crate::api::mappers::openai::{scrub_schema, THOUGHT_SIGNATURE_PLACEHOLDER};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const BLOCKED_MESSAGE: &str =
    "[ProxySystem Error] Request blocked due to safety settings. Adjust the prompt and retry.";

/// Per-stream translation state. Thread-confined to one request; the id and
/// timestamp stay stable across every chunk of the stream.
#[derive(Debug)]
pub struct StreamState {
    id: String,
    created: i64,
    role_sent: bool,
    tool_index: u64,
    has_function_call: bool,
    usage: Option<Value>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            tool_index: 0,
            has_function_call: false,
            usage: None,
        }
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

fn map_finish_reason(reason: &str, has_function_call: bool) -> &'static str {
    if has_function_call {
        return "tool_calls";
    }
    match reason.to_ascii_lowercase().as_str() {
        "stop" => "stop",
        "max_tokens" => "length",
        "safety" => "content_filter",
        "recitation" | "other" => "stop",
        _ => "stop",
    }
}

/// Token accounting: tool-use prompt tokens fold into the prompt side,
/// thought tokens into the completion side.
pub fn map_usage(meta: &Value) -> Value {
    let count = |key: &str| meta.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
    let prompt = count("promptTokenCount") + count("toolUsePromptTokenCount");
    let thoughts = count("thoughtsTokenCount");
    let completion = count("candidatesTokenCount") + thoughts;

    let mut usage = Map::new();
    usage.insert("prompt_tokens".to_string(), json!(prompt));
    usage.insert("completion_tokens".to_string(), json!(completion));
    usage.insert("total_tokens".to_string(), json!(prompt + completion));

    if thoughts > 0 {
        usage.insert(
            "completion_tokens_details".to_string(),
            json!({ "reasoning_tokens": thoughts }),
        );
    }
    if let Some(details) = modality_details(meta.get("promptTokensDetails")) {
        usage.insert("prompt_tokens_details".to_string(), details);
    }

    Value::Object(usage)
}

fn modality_details(breakdown: Option<&Value>) -> Option<Value> {
    let entries = breakdown?.as_array()?;
    let mut details = Map::new();
    for entry in entries {
        let Some(modality) = entry.get("modality").and_then(|v| v.as_str()) else {
            continue;
        };
        let tokens = entry.get("tokenCount").and_then(|v| v.as_i64()).unwrap_or(0);
        match modality {
            "TEXT" => {
                details.insert("text_tokens".to_string(), json!(tokens));
            }
            "IMAGE" => {
                details.insert("image_tokens".to_string(), json!(tokens));
            }
            _ => {}
        }
    }
    if details.is_empty() {
        None
    } else {
        Some(Value::Object(details))
    }
}

fn chunk_template(state: &StreamState, model: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": state.id,
        "object": "chat.completion.chunk",
        "created": state.created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish
        }]
    })
}

fn sse_line(value: &Value) -> String {
    format!("data: {value}\n\n")
}

/// Convert one upstream streaming chunk. Returns zero or more `data:` lines;
/// the final line (carrying `finish_reason` and usage) is appended when the
/// chunk reports a finish reason. The assistant role rides on the first
/// non-empty delta only.
pub fn gemini_to_openai_stream(chunk: &Value, model: &str, state: &mut StreamState) -> String {
    let mut out = String::new();

    let candidate = chunk.get("candidates").and_then(|v| v.get(0));

    if candidate.is_none() && chunk.get("promptFeedback").is_some() {
        let mut delta = json!({ "content": BLOCKED_MESSAGE });
        if !state.role_sent {
            delta["role"] = json!("assistant");
            state.role_sent = true;
        }
        out.push_str(&sse_line(&chunk_template(state, model, delta, Some("stop"))));
        return out;
    }

    if let Some(meta) = chunk.get("usageMetadata") {
        state.usage = Some(map_usage(meta));
    }

    if let Some(parts) = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            let Some(mut delta) = part_delta(part, state) else {
                continue;
            };
            if !state.role_sent {
                delta["role"] = json!("assistant");
                state.role_sent = true;
            }
            out.push_str(&sse_line(&chunk_template(state, model, delta, None)));
        }
    }

    if let Some(reason) = candidate.and_then(|c| c.get("finishReason")).and_then(|v| v.as_str()) {
        let finish = map_finish_reason(reason, state.has_function_call);
        let mut frame = chunk_template(state, model, json!({}), Some(finish));
        if let Some(usage) = &state.usage {
            frame["usage"] = usage.clone();
        }
        out.push_str(&sse_line(&frame));
    }

    out
}

fn part_delta(part: &Value, state: &mut StreamState) -> Option<Value> {
    if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
        if text.is_empty() {
            return None;
        }
        if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Some(json!({ "reasoning_content": text }));
        }
        return Some(json!({ "content": text }));
    }

    if let Some(inline) = part.get("inlineData") {
        let mime = inline.get("mimeType").and_then(|v| v.as_str()).unwrap_or("image/png");
        let data = inline.get("data").and_then(|v| v.as_str()).unwrap_or("");
        if data.is_empty() {
            return None;
        }
        return Some(json!({ "content": format!("![image](data:{mime};base64,{data})") }));
    }

    if let Some(call) = part.get("functionCall") {
        let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
        let index = state.tool_index;
        state.tool_index += 1;
        state.has_function_call = true;
        return Some(json!({
            "tool_calls": [{
                "index": index,
                "id": format!("call_{}_{}", name, index),
                "type": "function",
                "function": { "name": name, "arguments": args.to_string() }
            }]
        }));
    }

    None
}

/// One OpenAI-shaped chunk carrying an inline diagnostic, used when the
/// upstream fails after the stream already started.
pub fn diagnostic_chunk(state: &mut StreamState, model: &str, message: &str) -> String {
    let mut delta = json!({ "content": format!("[ProxySystem Error] {message}") });
    if !state.role_sent {
        delta["role"] = json!("assistant");
        state.role_sent = true;
    }
    sse_line(&chunk_template(state, model, delta, Some("stop")))
}

/// Convert a complete (non-streaming) Gemini response.
pub fn gemini_to_openai_nonstream(body: &Value, model: &str) -> Value {
    if let Some(error) = body.get("error") {
        return json!({
            "error": {
                "message": error.get("message").and_then(|v| v.as_str()).unwrap_or("upstream error"),
                "type": "api_error",
                "code": error.get("code").cloned().unwrap_or(json!(502))
            }
        });
    }

    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();

    let candidate = body.get("candidates").and_then(|v| v.get(0));

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    if candidate.is_none() && body.get("promptFeedback").is_some() {
        content.push_str(BLOCKED_MESSAGE);
    }

    if let Some(parts) = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                    reasoning.push_str(text);
                } else {
                    content.push_str(text);
                }
                continue;
            }
            if let Some(inline) = part.get("inlineData") {
                let mime =
                    inline.get("mimeType").and_then(|v| v.as_str()).unwrap_or("image/png");
                let data = inline.get("data").and_then(|v| v.as_str()).unwrap_or("");
                if !data.is_empty() {
                    content.push_str(&format!("![image](data:{mime};base64,{data})"));
                }
                continue;
            }
            if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                let index = tool_calls.len();
                tool_calls.push(json!({
                    "index": index,
                    "id": format!("call_{}_{}", name, index),
                    "type": "function",
                    "function": { "name": name, "arguments": args.to_string() }
                }));
            }
        }
    }

    let finish = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str())
        .map(|reason| map_finish_reason(reason, !tool_calls.is_empty()))
        .unwrap_or(if tool_calls.is_empty() { "stop" } else { "tool_calls" });

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), json!(content));
    if !reasoning.is_empty() {
        message.insert("reasoning_content".to_string(), json!(reasoning));
    }
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    let usage = body
        .get("usageMetadata")
        .map(map_usage)
        .unwrap_or_else(|| json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 }));

    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish
        }],
        "usage": usage
    })
}

/// Sanitize a native Gemini request before dispatch: tool parameter schemas
/// are scrubbed, empty tool lists dropped, and every `functionCall` part is
/// given a thought signature if the client omitted one.
pub fn sanitize_gemini_request(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    let drop_tools = match obj.get_mut("tools").and_then(|v| v.as_array_mut()) {
        Some(tools) => {
            for tool in tools.iter_mut() {
                if let Some(declarations) =
                    tool.get_mut("functionDeclarations").and_then(|v| v.as_array_mut())
                {
                    for declaration in declarations {
                        if let Some(parameters) = declaration.get_mut("parameters") {
                            *parameters = scrub_schema(parameters);
                        }
                    }
                }
            }
            tools.is_empty()
        }
        None => false,
    };
    if drop_tools {
        obj.remove("tools");
    }

    if let Some(contents) = obj.get_mut("contents").and_then(|v| v.as_array_mut()) {
        for entry in contents {
            let Some(parts) = entry.get_mut("parts").and_then(|v| v.as_array_mut()) else {
                continue;
            };
            for part in parts {
                let Some(part_obj) = part.as_object_mut() else { continue };
                if part_obj.contains_key("functionCall")
                    && !part_obj.contains_key("thoughtSignature")
                {
                    part_obj.insert(
                        "thoughtSignature".to_string(),
                        json!(THOUGHT_SIGNATURE_PLACEHOLDER),
                    );
                }
            }
        }
    }
}
