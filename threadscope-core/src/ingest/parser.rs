//! Line parser
//!
//! Turns one raw line into a normalized record via the ordered detector list.
//!
//! ## Design Principles
//!
//! 1. **Lossless capture**: every message keeps the original JSON in `raw`
//! 2. **Resilience**: malformed lines become [`ParseError`] records, never panics
//! 3. **Nothing dropped**: unknown shapes still yield a `system` message
//! 4. **Extensible**: new log shapes only require a [`RecordDetector`]

use super::detectors::{
    self, FallbackDetector, MessageParts, Normalized, RecordDetector, ResultParts,
};
use super::reader::Line;
use crate::types::{
    message_id, Message, ParseError, SourceRef, ToolCall, ToolCallResult, ToolCallStatus,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Per-file state the parser carries from one line to the next.
#[derive(Debug, Clone)]
pub struct LineContext {
    pub path: PathBuf,
    pub project_id: String,
    pub conversation_id: String,
    /// Truncation generation, mixed into message ids
    pub generation: u32,
    /// Timestamp of the previous record, reused when a record has none
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl LineContext {
    pub fn new(path: &Path, project_id: &str, conversation_id: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            project_id: project_id.to_string(),
            conversation_id: conversation_id.to_string(),
            generation: 0,
            last_timestamp: None,
        }
    }
}

/// The record a line produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    /// A message, plus any `tool_result` blocks embedded in its content
    Message {
        message: Box<Message>,
        results: Vec<ToolCallResult>,
    },
    ToolResults(Vec<ToolCallResult>),
    Error(ParseError),
}

/// Result of parsing one line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub record: ParsedRecord,
    /// Non-fatal problems, always `Severity::Warning`
    pub warnings: Vec<ParseError>,
}

impl ParsedLine {
    fn error(error: ParseError) -> Self {
        Self {
            record: ParsedRecord::Error(error),
            warnings: Vec::new(),
        }
    }
}

/// Ordered detector list with a guaranteed fallback.
pub struct Parser {
    detectors: Vec<Box<dyn RecordDetector>>,
    fallback: FallbackDetector,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Parser with the built-in detectors.
    pub fn new() -> Self {
        Self::with_detectors(detectors::default_detectors())
    }

    /// Parser with a custom detector order; the fallback is always last.
    pub fn with_detectors(detectors: Vec<Box<dyn RecordDetector>>) -> Self {
        Self {
            detectors,
            fallback: FallbackDetector,
        }
    }

    /// Register an additional detector ahead of the fallback.
    pub fn register_detector(&mut self, detector: Box<dyn RecordDetector>) {
        self.detectors.push(detector);
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors
            .iter()
            .map(|d| d.name())
            .chain(std::iter::once(FallbackDetector::NAME))
            .collect()
    }

    pub fn parse(&self, ctx: &mut LineContext, line: &Line) -> ParsedLine {
        self.parse_line(ctx, line.line_number, line.byte_offset, &line.text)
    }

    /// Parse a single line. Never panics on malformed input.
    pub fn parse_line(
        &self,
        ctx: &mut LineContext,
        line_number: u64,
        offset: u64,
        raw: &str,
    ) -> ParsedLine {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return ParsedLine::error(ParseError::error(
                    line_number,
                    raw,
                    format!("invalid JSON: {}", e),
                ))
            }
        };

        let Value::Object(record) = &value else {
            return ParsedLine::error(ParseError::error(
                line_number,
                raw,
                format!("expected a JSON object, found {}", json_kind(&value)),
            ));
        };

        let mut warnings = Vec::new();
        let timestamp = resolve_timestamp(ctx, record, line_number, raw, &mut warnings);

        for detector in &self.detectors {
            if !detector.matches(record) {
                continue;
            }
            match detector.normalize(record) {
                Ok(Normalized::Message(parts)) => {
                    let (message, results) = build_message(
                        ctx,
                        detector.name(),
                        parts,
                        timestamp,
                        line_number,
                        offset,
                        value.clone(),
                    );
                    return ParsedLine {
                        record: ParsedRecord::Message {
                            message: Box::new(message),
                            results,
                        },
                        warnings,
                    };
                }
                Ok(Normalized::ToolResults(parts)) => {
                    let results = parts
                        .into_iter()
                        .map(|p| build_result(p, timestamp, line_number))
                        .collect();
                    return ParsedLine {
                        record: ParsedRecord::ToolResults(results),
                        warnings,
                    };
                }
                Err(reason) => {
                    tracing::debug!(
                        detector = detector.name(),
                        line = line_number,
                        reason = %reason,
                        "Detector matched but could not normalize"
                    );
                    warnings.push(ParseError::warning(
                        line_number,
                        raw,
                        format!("{}: {}", detector.name(), reason),
                    ));
                }
            }
        }

        warnings.push(ParseError::warning(
            line_number,
            raw,
            self.fallback.describe(record),
        ));
        let parts = self.fallback.normalize(record);
        let (message, results) = build_message(
            ctx,
            FallbackDetector::NAME,
            parts,
            timestamp,
            line_number,
            offset,
            value.clone(),
        );
        ParsedLine {
            record: ParsedRecord::Message {
                message: Box::new(message),
                results,
            },
            warnings,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn resolve_timestamp(
    ctx: &mut LineContext,
    record: &Map<String, Value>,
    line_number: u64,
    raw: &str,
    warnings: &mut Vec<ParseError>,
) -> DateTime<Utc> {
    let nested = record
        .get("message")
        .and_then(Value::as_object)
        .and_then(detectors::fields::timestamp);

    let ts = match detectors::fields::timestamp(record).or(nested) {
        Some(value) => match detectors::fields::parse_timestamp(value) {
            Some(ts) => ts,
            None => {
                warnings.push(ParseError::warning(
                    line_number,
                    raw,
                    format!("unparseable timestamp {}, using current time", value),
                ));
                Utc::now()
            }
        },
        None => ctx.last_timestamp.unwrap_or_else(Utc::now),
    };
    ctx.last_timestamp = Some(ts);
    ts
}

fn build_message(
    ctx: &LineContext,
    detector: &str,
    parts: MessageParts,
    timestamp: DateTime<Utc>,
    line_number: u64,
    offset: u64,
    raw: Value,
) -> (Message, Vec<ToolCallResult>) {
    let id = message_id(&ctx.path, offset, ctx.generation);

    let tool_calls = parts
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let status = match (&call.output, call.is_error) {
                (_, true) => ToolCallStatus::Error,
                (Some(_), false) => ToolCallStatus::Success,
                (None, false) => ToolCallStatus::Pending,
            };
            ToolCall {
                id: call.id.unwrap_or_else(|| format!("{}:{}", id, index)),
                message_id: id.clone(),
                name: call.name,
                input: call.input,
                output: call.output,
                duration_ms: call.duration_ms,
                status,
            }
        })
        .collect();

    let results = parts
        .tool_results
        .into_iter()
        .map(|p| build_result(p, timestamp, line_number))
        .collect();

    let message = Message {
        id,
        conversation_id: ctx.conversation_id.clone(),
        project_id: ctx.project_id.clone(),
        role: parts.role,
        content: parts.content,
        timestamp,
        usage: parts.usage,
        tool_calls,
        source: SourceRef {
            path: ctx.path.clone(),
            byte_offset: offset,
            line_number,
        },
        detector: detector.to_string(),
        raw,
    };
    (message, results)
}

fn build_result(parts: ResultParts, timestamp: DateTime<Utc>, line_number: u64) -> ToolCallResult {
    ToolCallResult {
        correlation_id: parts.correlation_id,
        output: parts.output,
        is_error: parts.is_error,
        timestamp,
        line_number,
    }
}
