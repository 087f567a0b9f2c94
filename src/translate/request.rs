use crate::config::{ModelMap, ProxyConfig};
use serde_json::{json, Map, Value};

const MAX_SCHEMA_DEPTH: u32 = 64;

/// Rewrite a native Messages request into an OpenAI chat-completions request
/// body for the translated upstream.
pub fn build_chat_request(body: &Value, config: &ProxyConfig) -> Result<Value, String> {
    let obj = body
        .as_object()
        .ok_or_else(|| "messages request must be an object".to_string())?;

    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = obj.get("system") {
        push_system_messages(system, &mut messages);
    }

    for raw_msg in obj
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "missing messages".to_string())?
    {
        let Some(msg_obj) = raw_msg.as_object() else {
            continue;
        };
        let role = msg_obj
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("user");
        let content = msg_obj.get("content").cloned().unwrap_or(Value::Null);

        let mut tool_calls: Vec<Value> = Vec::new();
        let mut tool_messages: Vec<Value> = Vec::new();
        if let Some(blocks) = content.as_array() {
            for block in blocks {
                let Some(bobj) = block.as_object() else {
                    continue;
                };
                match bobj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "tool_use" => tool_calls.push(tool_use_to_call(bobj)),
                    "tool_result" => {
                        let Some(call_id) =
                            bobj.get("tool_use_id").and_then(|v| v.as_str())
                        else {
                            tracing::warn!(
                                "dropping tool_result without tool_use_id; it cannot be matched"
                            );
                            continue;
                        };
                        tool_messages.push(json!({
                            "role": "tool",
                            "content": tool_result_text(bobj),
                            "tool_call_id": call_id,
                        }));
                    }
                    _ => {}
                }
            }
        }

        let text = normalized_text(&content);
        if text.is_some() || !tool_calls.is_empty() {
            let mut main = Map::new();
            main.insert("role".to_string(), Value::String(role.to_string()));
            if let Some(text) = text {
                main.insert("content".to_string(), Value::String(text));
            }
            if !tool_calls.is_empty() {
                main.insert("tool_calls".to_string(), Value::Array(tool_calls));
            }
            messages.push(Value::Object(main));
        }
        messages.extend(tool_messages);
    }

    let model = resolve_model(
        obj.get("model").and_then(|v| v.as_str()),
        &config.models,
    );

    let mut out = json!({
        "model": model,
        "messages": messages,
    });
    let out_obj = out.as_object_mut().expect("chat request object");

    if let Some(tools) = obj.get("tools").and_then(|v| v.as_array()) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter_map(|t| map_tool(t, &config.blocked_tools))
            .collect();
        if !mapped.is_empty() {
            out_obj.insert("tools".to_string(), Value::Array(mapped));
        }
    }
    if let Some(max_tokens) = obj.get("max_tokens").and_then(|v| v.as_u64()) {
        out_obj.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    let temperature = obj
        .get("temperature")
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0);
    out_obj.insert("temperature".to_string(), Value::from(temperature));
    if let Some(top_p) = obj.get("top_p").and_then(|v| v.as_f64()) {
        out_obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(stop) = obj.get("stop_sequences") {
        if !stop.is_null() {
            out_obj.insert("stop".to_string(), stop.clone());
        }
    }
    out_obj.insert(
        "stream".to_string(),
        Value::Bool(obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false)),
    );

    Ok(out)
}

fn push_system_messages(system: &Value, messages: &mut Vec<Value>) {
    if let Some(s) = system.as_str() {
        messages.push(json!({ "role": "system", "content": s }));
        return;
    }
    if let Some(blocks) = system.as_array() {
        for block in blocks {
            let text = block
                .get("text")
                .and_then(|v| v.as_str())
                .or_else(|| block.get("content").and_then(|v| v.as_str()))
                .unwrap_or("");
            if !text.is_empty() {
                messages.push(json!({ "role": "system", "content": text }));
            }
        }
    }
}

fn tool_use_to_call(block: &Map<String, Value>) -> Value {
    let input = block.get("input").cloned().unwrap_or(json!({}));
    let arguments = serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
    json!({
        "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
        "type": "function",
        "function": {
            "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
            "arguments": arguments,
        }
    })
}

fn tool_result_text(block: &Map<String, Value>) -> String {
    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}

/// Normalized text content of a message: a plain string passes through, a
/// block sequence concatenates its text blocks separated by single spaces.
/// An empty result is treated as absent.
fn normalized_text(content: &Value) -> Option<String> {
    let text = if let Some(s) = content.as_str() {
        s.to_string()
    } else if let Some(blocks) = content.as_array() {
        blocks
            .iter()
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        String::new()
    };
    if text.is_empty() { None } else { Some(text) }
}

fn map_tool(tool: &Value, blocked: &[String]) -> Option<Value> {
    let obj = tool.as_object()?;
    let name = obj.get("name").and_then(|v| v.as_str())?;
    if blocked.iter().any(|b| b == name) {
        tracing::debug!("dropping blocked tool {name}");
        return None;
    }
    let parameters = obj
        .get("input_schema")
        .map(clean_schema)
        .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
    Some(json!({
        "type": "function",
        "function": {
            "name": name,
            "description": obj.get("description").and_then(|v| v.as_str()).unwrap_or(""),
            "parameters": parameters,
        }
    }))
}

/// Substitute the upstream model for the request's model family. Family
/// detection is a case-insensitive substring match; unmapped names pass
/// through unchanged.
pub fn resolve_model(input: Option<&str>, models: &ModelMap) -> String {
    let Some(input) = input.filter(|v| !v.is_empty()) else {
        return models
            .default
            .clone()
            .unwrap_or_else(|| "openai/gpt-4o".to_string());
    };
    let lowered = input.to_lowercase();
    let mapped = if lowered.contains("sonnet") {
        models.sonnet.as_deref()
    } else if lowered.contains("opus") {
        models.opus.as_deref()
    } else if lowered.contains("haiku") {
        models.haiku.as_deref()
    } else {
        None
    };
    mapped.unwrap_or(input).to_string()
}

/// Walk a JSON schema and drop `format: "uri"` from string nodes; the
/// translated upstream's validator rejects it. Everything else is preserved.
/// Recursion is bounded so self-referential inputs cannot loop.
pub fn clean_schema(schema: &Value) -> Value {
    clean_schema_at(schema, 0)
}

fn clean_schema_at(schema: &Value, depth: u32) -> Value {
    if depth >= MAX_SCHEMA_DEPTH {
        return schema.clone();
    }
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };

    let mut out = Map::with_capacity(obj.len());
    let is_uri_string = obj.get("type").and_then(|v| v.as_str()) == Some("string")
        && obj.get("format").and_then(|v| v.as_str()) == Some("uri");

    for (key, value) in obj {
        if is_uri_string && key == "format" {
            continue;
        }
        let cleaned = match key.as_str() {
            "properties" => match value.as_object() {
                Some(props) => Value::Object(
                    props
                        .iter()
                        .map(|(k, v)| (k.clone(), clean_schema_at(v, depth + 1)))
                        .collect(),
                ),
                None => value.clone(),
            },
            "items" | "additionalProperties" => clean_schema_at(value, depth + 1),
            "anyOf" | "allOf" | "oneOf" => match value.as_array() {
                Some(arr) => Value::Array(
                    arr.iter().map(|v| clean_schema_at(v, depth + 1)).collect(),
                ),
                None => value.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }
    Value::Object(out)
}
