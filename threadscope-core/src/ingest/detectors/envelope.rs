use super::fields;
use super::{Normalized, RecordDetector};
use crate::types::Role;
use serde_json::{Map, Value};

/// Nested-message logs: `{"type": "user|assistant|system", "message": {...}}`.
pub struct EnvelopeDetector;

impl RecordDetector for EnvelopeDetector {
    fn name(&self) -> &'static str {
        "envelope"
    }

    fn matches(&self, record: &Map<String, Value>) -> bool {
        let typed = matches!(
            record.get("type").and_then(Value::as_str),
            Some("user" | "assistant" | "system")
        );
        typed && record.get("message").is_some_and(Value::is_object)
    }

    fn normalize(&self, record: &Map<String, Value>) -> Result<Normalized, String> {
        let message = record
            .get("message")
            .and_then(Value::as_object)
            .ok_or("envelope without message object")?;

        let role = message
            .get("role")
            .and_then(Value::as_str)
            .and_then(Role::normalize)
            .or_else(|| record.get("type").and_then(Value::as_str).and_then(Role::normalize))
            .ok_or("envelope role not recognized")?;

        let content = fields::content(message);
        let usage = message.get("usage").or_else(|| record.get("usage"));
        let mut parts = fields::message_parts(role, content, usage, message);
        parts.tool_calls.extend(fields::tool_call_array(record));

        Ok(Normalized::Message(parts))
    }
}
