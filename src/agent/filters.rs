// Model-family request filters applied just before the upstream fetch

use serde_json::{json, Value};

fn family(model: &str) -> ModelFamily {
    let m = model.to_ascii_lowercase();
    if m.contains("tts") {
        ModelFamily::Tts
    } else if m.contains("embedding") {
        ModelFamily::Embedding
    } else if m.contains("image") || m.starts_with("imagen") {
        ModelFamily::Image
    } else if m.contains("computer-use") {
        ModelFamily::ComputerUse
    } else if m.contains("robotics") {
        ModelFamily::Robotics
    } else {
        ModelFamily::Text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFamily {
    Text,
    Image,
    Embedding,
    Tts,
    ComputerUse,
    Robotics,
}

/// Strip request fields the target model family rejects, then normalize the
/// thinking level and response modalities. Mirrors what the upstream web app
/// sends for each family.
pub fn apply_model_filters(model: &str, body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    match family(model) {
        ModelFamily::Image | ModelFamily::Embedding | ModelFamily::Tts => {
            obj.remove("tools");
            obj.remove("toolConfig");
            obj.remove("toolChoice");
            obj.remove("systemInstruction");
            if let Some(config) = obj.get_mut("generationConfig").and_then(|v| v.as_object_mut()) {
                config.remove("thinkingConfig");
                let mime_keys: Vec<String> = config
                    .keys()
                    .filter(|k| k.eq_ignore_ascii_case("responsemimetype"))
                    .cloned()
                    .collect();
                for key in mime_keys {
                    config.remove(&key);
                }
            }
        }
        ModelFamily::ComputerUse => {
            obj.remove("tools");
        }
        ModelFamily::Robotics => {
            let drop_tools = match obj.get_mut("tools").and_then(|v| v.as_array_mut()) {
                Some(tools) => {
                    tools.retain(|entry| {
                        !entry
                            .as_object()
                            .map(|t| t.contains_key("googleSearch") || t.contains_key("urlContext"))
                            .unwrap_or(false)
                    });
                    tools.is_empty()
                }
                None => false,
            };
            if drop_tools {
                obj.remove("tools");
            }
        }
        ModelFamily::Text => {}
    }

    match family(model) {
        ModelFamily::Tts => {
            let config = obj
                .entry("generationConfig".to_string())
                .or_insert_with(|| json!({}));
            config["responseModalities"] = json!(["AUDIO"]);
        }
        ModelFamily::Embedding | ModelFamily::ComputerUse | ModelFamily::Robotics => {
            obj.remove("responseModalities");
            if let Some(config) = obj.get_mut("generationConfig").and_then(|v| v.as_object_mut()) {
                config.remove("responseModalities");
            }
        }
        _ => {}
    }

    if let Some(config) = obj.get_mut("generationConfig").and_then(|v| v.as_object_mut()) {
        if let Some(level) = config
            .get_mut("thinkingConfig")
            .and_then(|v| v.get_mut("thinkingLevel"))
        {
            if let Some(s) = level.as_str() {
                *level = json!(s.to_ascii_uppercase());
            }
        }
        normalize_modalities(config);
    }
    normalize_modalities(obj);
}

/// Wrap a bare string in an array and uppercase every element. Idempotent.
fn normalize_modalities(obj: &mut serde_json::Map<String, Value>) {
    let Some(modalities) = obj.get_mut("responseModalities") else {
        return;
    };
    if let Some(single) = modalities.as_str() {
        *modalities = json!([single.to_ascii_uppercase()]);
        return;
    }
    if let Some(entries) = modalities.as_array_mut() {
        for entry in entries {
            if let Some(s) = entry.as_str() {
                *entry = json!(s.to_ascii_uppercase());
            }
        }
    }
}
