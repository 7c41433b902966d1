//! Field extraction shared by the detectors.
//!
//! Log producers disagree on key names; every lookup here accepts the known
//! spellings so detectors only decide *shape*.

use crate::types::{Role, TokenUsage};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use super::{MessageParts, ResultParts, ToolCallParts};

pub const ROLE_KEYS: &[&str] = &["type", "role", "author", "speaker"];
pub const CONTENT_KEYS: &[&str] = &["content", "message", "text"];
pub const CORRELATION_KEYS: &[&str] = &["tool_call_id", "toolUseId", "tool_use_id"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts", "created_at", "createdAt", "time"];

/// Epoch values above this are milliseconds.
const EPOCH_MILLIS_CUTOFF: f64 = 1e11;

/// First role-discriminator key whose value names a known role.
pub fn role(record: &Map<String, Value>) -> Option<Role> {
    ROLE_KEYS
        .iter()
        .filter_map(|k| record.get(*k).and_then(Value::as_str))
        .find_map(Role::normalize)
}

/// Whether any role-discriminator key is present, known or not.
pub fn has_discriminator(record: &Map<String, Value>) -> bool {
    ROLE_KEYS.iter().any(|k| record.contains_key(*k))
}

pub fn content(record: &Map<String, Value>) -> Option<&Value> {
    CONTENT_KEYS
        .iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null())
}

pub fn correlation_id(record: &Map<String, Value>) -> Option<&str> {
    CORRELATION_KEYS
        .iter()
        .find_map(|k| record.get(*k).and_then(Value::as_str))
}

pub fn timestamp(record: &Map<String, Value>) -> Option<&Value> {
    TIMESTAMP_KEYS
        .iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null())
}

/// `true` for JSON `true`, non-zero numbers and non-empty strings other than "false".
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty() && s != "false",
        Some(Value::Object(_)) => true,
        _ => false,
    }
}

// ============================================
// Timestamps
// ============================================

/// Parse RFC 3339, naive UTC datetimes, epoch seconds or milliseconds, and
/// numeric strings holding either.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            s.parse::<f64>().ok().and_then(from_epoch)
        }
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value > EPOCH_MILLIS_CUTOFF {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

// ============================================
// Usage
// ============================================

pub fn usage(value: Option<&Value>) -> Option<TokenUsage> {
    let obj = value?.as_object()?;
    let get = |keys: &[&str]| -> Option<u64> { keys.iter().find_map(|k| obj.get(*k)?.as_u64()) };

    let input = get(&["input_tokens", "prompt_tokens"]);
    let output = get(&["output_tokens", "completion_tokens"]);
    let cache_read = get(&["cache_read_input_tokens"]);
    let cache_creation = get(&["cache_creation_input_tokens"]);

    if input.is_none() && output.is_none() && cache_read.is_none() && cache_creation.is_none() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
        cache_read_tokens: cache_read.unwrap_or(0),
        cache_creation_tokens: cache_creation.unwrap_or(0),
    })
}

// ============================================
// Content
// ============================================

/// Content split into text, tool-use blocks and tool-result blocks.
#[derive(Debug, Default)]
pub struct FlatContent {
    pub text: String,
    pub tool_uses: Vec<ToolCallParts>,
    pub tool_results: Vec<ResultParts>,
}

/// Flatten a string, an array of blocks, or an object carrying `text`.
pub fn flatten_content(value: &Value) -> FlatContent {
    let mut flat = FlatContent::default();
    let mut texts: Vec<String> = Vec::new();

    match value {
        Value::String(s) => texts.push(s.clone()),
        Value::Array(blocks) => {
            for block in blocks {
                match block {
                    Value::String(s) => texts.push(s.clone()),
                    Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = obj.get("text").and_then(Value::as_str) {
                                texts.push(t.to_string());
                            }
                        }
                        Some("tool_use") => flat.tool_uses.push(tool_use_block(obj)),
                        Some("tool_result") => {
                            if let Some(result) = tool_result_block(obj) {
                                flat.tool_results.push(result);
                            }
                        }
                        // thinking, image and other blocks carry no message text
                        _ => {}
                    },
                    _ => {}
                }
            }
        }
        Value::Object(obj) => {
            if let Some(t) = obj.get("text").and_then(Value::as_str) {
                texts.push(t.to_string());
            } else if let Some(inner) = obj.get("content") {
                return flatten_content(inner);
            }
        }
        Value::Null => {}
        other => texts.push(other.to_string()),
    }

    flat.text = texts.join("\n");
    flat
}

/// Whether `value` is a non-empty array made only of `tool_result` blocks.
pub fn only_tool_results(value: Option<&Value>) -> bool {
    match value.and_then(Value::as_array) {
        Some(blocks) if !blocks.is_empty() => blocks
            .iter()
            .all(|b| b.get("type").and_then(Value::as_str) == Some("tool_result")),
        _ => false,
    }
}

fn tool_use_block(obj: &Map<String, Value>) -> ToolCallParts {
    ToolCallParts {
        id: obj.get("id").and_then(Value::as_str).map(str::to_string),
        name: obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        input: obj.get("input").cloned().unwrap_or(Value::Null),
        output: None,
        is_error: false,
        duration_ms: None,
    }
}

pub fn tool_result_block(obj: &Map<String, Value>) -> Option<ResultParts> {
    let correlation_id = correlation_id(obj)?.to_string();
    Some(ResultParts {
        correlation_id,
        output: obj
            .get("content")
            .or_else(|| obj.get("output"))
            .cloned()
            .unwrap_or(Value::Null),
        is_error: truthy(obj.get("is_error")),
    })
}

// ============================================
// Tool call arrays
// ============================================

/// Calls listed under `tool_calls` or `tools`.
pub fn tool_call_array(record: &Map<String, Value>) -> Vec<ToolCallParts> {
    let Some(items) = ["tool_calls", "tools"]
        .iter()
        .find_map(|k| record.get(*k).and_then(Value::as_array))
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .map(|obj| {
            // OpenAI-style calls nest name/arguments under `function`
            let function = obj.get("function").and_then(Value::as_object);
            let name = obj
                .get("name")
                .or_else(|| function.and_then(|f| f.get("name")))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let input = obj
                .get("input")
                .or_else(|| obj.get("arguments"))
                .or_else(|| function.and_then(|f| f.get("arguments")))
                .map(decode_embedded_json)
                .unwrap_or(Value::Null);
            let output = obj
                .get("output")
                .or_else(|| obj.get("result"))
                .filter(|v| !v.is_null())
                .cloned();
            let duration_ms = obj
                .get("duration_ms")
                .or_else(|| obj.get("execution_time"))
                .and_then(Value::as_f64)
                .map(|d| d.round() as i64);

            ToolCallParts {
                id: obj.get("id").and_then(Value::as_str).map(str::to_string),
                name,
                input,
                output,
                is_error: truthy(obj.get("error")) || truthy(obj.get("is_error")),
                duration_ms,
            }
        })
        .collect()
}

/// Arguments are sometimes a JSON document encoded as a string.
fn decode_embedded_json(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

/// Assemble message parts from a role, a content value and any tool arrays.
pub fn message_parts(
    role: Role,
    content: Option<&Value>,
    usage_value: Option<&Value>,
    tool_source: &Map<String, Value>,
) -> MessageParts {
    let flat = content.map(flatten_content).unwrap_or_default();
    let mut tool_calls = flat.tool_uses;
    tool_calls.extend(tool_call_array(tool_source));

    MessageParts {
        role,
        content: flat.text,
        usage: usage(usage_value),
        tool_calls,
        tool_results: flat.tool_results,
    }
}
