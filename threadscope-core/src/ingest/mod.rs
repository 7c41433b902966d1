//! Ingestion layer: raw lines in, normalized records out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │  LineReader  │ ──► │    Parser    │ ──► │ ToolCallTracker  │
//! │ (tail state) │     │ (detectors)  │     │ (correlation)    │
//! └──────────────┘     └──────────────┘     └──────────────────┘
//!        ▲                                           │
//!        └──────── ConversationIngestor ◄────────────┘
//! ```
//!
//! A [`ConversationIngestor`] owns all per-file state. Each call to
//! [`ConversationIngestor::ingest`] reads the appended lines and returns one
//! [`IngestBatch`] that the pipeline hands to the threader and the store.

pub mod detectors;
mod parser;
pub mod reader;
mod tracker;

pub use detectors::{Normalized, RecordDetector};
pub use parser::{LineContext, ParsedLine, ParsedRecord, Parser};
pub use reader::{open_incremental, IncrementalRead, Line, LineReader};
pub use tracker::ToolCallTracker;

use crate::error::Result;
use crate::types::{
    conversation_identity, Checkpoint, Message, ParseError, Severity, ToolCall, ToolCallResult,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything one incremental read of a file produced.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub messages: Vec<Message>,
    /// Calls whose status changed because a result arrived
    pub tool_updates: Vec<ToolCall>,
    /// Results that matched no call in this batch
    pub orphans: Vec<ToolCallResult>,
    pub parse_errors: Vec<ParseError>,
    /// Checkpoint the batch started from (after any truncation reset)
    pub previous: Checkpoint,
    pub checkpoint: Checkpoint,
    pub truncated: bool,
    /// More complete lines are already buffered
    pub capped: bool,
    pub lines_read: usize,
    pub modified_at: Option<DateTime<Utc>>,
}

impl IngestBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.tool_updates.is_empty()
            && self.orphans.is_empty()
            && self.parse_errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.parse_errors
            .iter()
            .filter(|e| e.severity == Severity::Error)
            .count()
    }
}

/// Per-file reader, parser context and tool-call tracker.
pub struct ConversationIngestor {
    reader: LineReader,
    ctx: LineContext,
    tracker: ToolCallTracker,
    parser: Arc<Parser>,
}

impl ConversationIngestor {
    /// Returns `None` when project and conversation ids cannot be derived
    /// from the path.
    pub fn new(path: &Path, parser: Arc<Parser>) -> Option<Self> {
        let (project_id, conversation_id) = conversation_identity(path)?;
        Some(Self {
            reader: LineReader::new(path),
            ctx: LineContext::new(path, &project_id, &conversation_id),
            tracker: ToolCallTracker::new(),
            parser,
        })
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    pub fn path_buf(&self) -> PathBuf {
        self.reader.path().to_path_buf()
    }

    pub fn project_id(&self) -> &str {
        &self.ctx.project_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.ctx.conversation_id
    }

    pub fn tracker(&self) -> &ToolCallTracker {
        &self.tracker
    }

    /// Read and parse up to `max_lines` lines appended after `from`.
    ///
    /// Only I/O failures are errors; bad lines become parse errors.
    pub fn ingest(&mut self, from: Checkpoint, max_lines: usize) -> Result<IngestBatch> {
        self.ctx.generation = from.generation;
        self.ctx.last_timestamp = from.last_timestamp;
        let read = self.reader.read(from, max_lines)?;

        let mut batch = IngestBatch {
            previous: from,
            checkpoint: read.new_checkpoint,
            truncated: read.truncated,
            capped: read.capped,
            lines_read: read.lines.len(),
            modified_at: read.modified_at,
            ..Default::default()
        };

        if read.truncated {
            self.tracker.clear();
            self.ctx.last_timestamp = None;
            batch.previous = from.reset();
        }
        self.ctx.generation = read.new_checkpoint.generation;

        for line in read.lines {
            let parsed = self.parser.parse(&mut self.ctx, &line);
            batch.parse_errors.extend(parsed.warnings);

            match parsed.record {
                ParsedRecord::Message { message, results } => {
                    batch
                        .tool_updates
                        .extend(self.tracker.register(&message.tool_calls, message.timestamp));
                    self.apply_results(results, &line, &mut batch);
                    batch.messages.push(*message);
                }
                ParsedRecord::ToolResults(results) => {
                    self.apply_results(results, &line, &mut batch);
                }
                ParsedRecord::Error(error) => {
                    tracing::debug!(
                        path = %self.reader.path().display(),
                        line = error.line_number,
                        error = %error.description,
                        "Unparseable line"
                    );
                    batch.parse_errors.push(error);
                }
            }
        }

        batch.checkpoint.last_timestamp = self.ctx.last_timestamp;
        Ok(batch)
    }

    fn apply_results(&mut self, results: Vec<ToolCallResult>, line: &Line, batch: &mut IngestBatch) {
        for result in results {
            let id = result.correlation_id.clone();
            match self.tracker.resolve(result) {
                Some(call) => batch.tool_updates.push(call),
                None => {
                    batch.parse_errors.push(ParseError::warning(
                        line.line_number,
                        &line.text,
                        format!("orphan tool result: no pending call with id {}", id),
                    ));
                    if let Some(orphan) = self.tracker.orphans().last() {
                        batch.orphans.push(orphan.clone());
                    }
                }
            }
        }
    }
}
