//! Record detectors.
//!
//! Each detector recognizes one family of line shapes and normalizes it into
//! [`Normalized`] parts. The parser tries them in order; the first match wins
//! and [`FallbackDetector`] guarantees that every JSON object is accepted.
//!
//! | Order | Detector | Recognizes |
//! |-------|----------|------------|
//! | 1 | `tool_result` | top-level correlation id, or content made only of `tool_result` blocks |
//! | 2 | `envelope` | `{"type": role, "message": {role, content, usage}}` |
//! | 3 | `role_content` | role discriminator plus `content`/`message`/`text` |
//! | 4 | `legacy_text` | `prompt`/`completion`/`text`/`content` with no discriminator |
//! | 5 | `fallback` | anything else, as a system message plus a warning |

mod envelope;
pub mod fields;
mod legacy;
mod role_content;
mod tool_result;

pub use envelope::EnvelopeDetector;
pub use legacy::LegacyTextDetector;
pub use role_content::RoleContentDetector;
pub use tool_result::ToolResultDetector;

use crate::types::{Role, TokenUsage};
use serde_json::{Map, Value};

/// A tool call as it appears in a record, before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallParts {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub is_error: bool,
    pub duration_ms: Option<i64>,
}

/// A tool result as it appears in a record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultParts {
    pub correlation_id: String,
    pub output: Value,
    pub is_error: bool,
}

/// The message-shaped part of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageParts {
    pub role: Role,
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub tool_calls: Vec<ToolCallParts>,
    /// `tool_result` blocks mixed in with other content
    pub tool_results: Vec<ResultParts>,
}

/// What a detector extracted from one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Message(MessageParts),
    ToolResults(Vec<ResultParts>),
}

/// Trait implemented by every record shape the parser understands.
pub trait RecordDetector: Send + Sync {
    /// Stable name, recorded on every message the detector produces
    fn name(&self) -> &'static str;

    /// Cheap shape test; must not allocate heavily
    fn matches(&self, record: &Map<String, Value>) -> bool;

    /// Extract the record. An `Err` hands the record to the next detector.
    fn normalize(&self, record: &Map<String, Value>) -> Result<Normalized, String>;
}

/// Create the ordered detector list.
pub fn default_detectors() -> Vec<Box<dyn RecordDetector>> {
    vec![
        Box::new(ToolResultDetector),
        Box::new(EnvelopeDetector),
        Box::new(RoleContentDetector),
        Box::new(LegacyTextDetector),
    ]
}

/// Accepts any object as a `system` message so no line is silently dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackDetector;

impl FallbackDetector {
    pub const NAME: &'static str = "fallback";

    pub fn normalize(&self, record: &Map<String, Value>) -> MessageParts {
        let content = ["summary", "text", "content"]
            .iter()
            .find_map(|k| record.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        MessageParts {
            role: Role::System,
            content,
            usage: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    /// Description used for the accompanying warning.
    pub fn describe(&self, record: &Map<String, Value>) -> String {
        let mut keys: Vec<&str> = record.keys().map(String::as_str).collect();
        keys.sort_unstable();
        format!("unrecognized record shape (keys: {})", keys.join(", "))
    }
}
