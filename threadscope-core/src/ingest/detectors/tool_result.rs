use super::fields;
use super::{Normalized, RecordDetector, ResultParts};
use serde_json::{Map, Value};

/// Standalone tool results.
///
/// Either a flat record with a correlation id (`tool_call_id`, `toolUseId`,
/// `tool_use_id`) or a record whose content, directly or inside `message`,
/// holds nothing but `tool_result` blocks.
pub struct ToolResultDetector;

impl ToolResultDetector {
    fn blocks(record: &Map<String, Value>) -> Option<&Vec<Value>> {
        let direct = record.get("content");
        if fields::only_tool_results(direct) {
            return direct.and_then(Value::as_array);
        }
        let nested = record
            .get("message")
            .and_then(Value::as_object)
            .and_then(|m| m.get("content"));
        if fields::only_tool_results(nested) {
            return nested.and_then(Value::as_array);
        }
        None
    }
}

impl RecordDetector for ToolResultDetector {
    fn name(&self) -> &'static str {
        "tool_result"
    }

    fn matches(&self, record: &Map<String, Value>) -> bool {
        fields::correlation_id(record).is_some() || Self::blocks(record).is_some()
    }

    fn normalize(&self, record: &Map<String, Value>) -> Result<Normalized, String> {
        if let Some(id) = fields::correlation_id(record) {
            let output = ["output", "result", "content"]
                .iter()
                .find_map(|k| record.get(*k))
                .cloned()
                .unwrap_or(Value::Null);
            let is_error = fields::truthy(record.get("is_error"))
                || fields::truthy(record.get("error"));
            return Ok(Normalized::ToolResults(vec![ResultParts {
                correlation_id: id.to_string(),
                output,
                is_error,
            }]));
        }

        let blocks = Self::blocks(record).ok_or("no tool_result blocks")?;
        let results: Vec<ResultParts> = blocks
            .iter()
            .filter_map(Value::as_object)
            .filter_map(fields::tool_result_block)
            .collect();
        if results.is_empty() {
            return Err("tool_result blocks carry no correlation id".to_string());
        }
        Ok(Normalized::ToolResults(results))
    }
}
