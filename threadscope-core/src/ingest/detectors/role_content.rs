use super::fields;
use super::{Normalized, RecordDetector};
use serde_json::{Map, Value};

/// Flat chat records: a role discriminator plus `content`, `message` or `text`.
pub struct RoleContentDetector;

impl RecordDetector for RoleContentDetector {
    fn name(&self) -> &'static str {
        "role_content"
    }

    fn matches(&self, record: &Map<String, Value>) -> bool {
        fields::role(record).is_some() && fields::content(record).is_some()
    }

    fn normalize(&self, record: &Map<String, Value>) -> Result<Normalized, String> {
        let role = fields::role(record).ok_or("no recognized role")?;
        let content = fields::content(record);
        Ok(Normalized::Message(fields::message_parts(
            role,
            content,
            record.get("usage"),
            record,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    fn parts(value: Value) -> super::super::MessageParts {
        let obj = value.as_object().unwrap();
        assert!(RoleContentDetector.matches(obj));
        match RoleContentDetector.normalize(obj).unwrap() {
            Normalized::Message(parts) => parts,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_role_aliases() {
        assert_eq!(parts(json!({"role": "human", "content": "hi"})).role, Role::User);
        assert_eq!(parts(json!({"author": "bot", "text": "yo"})).role, Role::Assistant);
        assert_eq!(parts(json!({"speaker": "model", "message": "m"})).role, Role::Assistant);
    }

    #[test]
    fn test_unknown_type_falls_back_to_role_key() {
        let p = parts(json!({"type": "message", "role": "assistant", "content": "x"}));
        assert_eq!(p.role, Role::Assistant);
    }

    #[test]
    fn test_tool_calls_with_inline_output() {
        let p = parts(json!({
            "role": "assistant",
            "content": "running",
            "tool_calls": [{"name": "bash", "input": {"cmd": "ls"}, "output": "a b", "duration_ms": 40}]
        }));
        assert_eq!(p.tool_calls.len(), 1);
        assert_eq!(p.tool_calls[0].duration_ms, Some(40));
    }

    #[test]
    fn test_requires_content() {
        let record = json!({"role": "user"});
        assert!(!RoleContentDetector.matches(record.as_object().unwrap()));
    }
}
