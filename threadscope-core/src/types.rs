//! Core domain types for threadscope
//!
//! These types are the normalized model every stage shares: the reader and
//! parser produce them, the threader groups them, the sink publishes them.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Project** | A subdirectory of the monitored root |
//! | **Conversation** | The ordered message history backing one `*.jsonl` file |
//! | **Message** | One conversational turn parsed from a line |
//! | **ToolCall** | A tool invocation requested inside a message |
//! | **Thread** | A coherent run of messages within a conversation |
//! | **Orphan** | A tool result that matched no pending tool call |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

// ============================================
// Conversation files
// ============================================

/// Committed read position of a conversation file.
///
/// `offset` always points just past the last fully consumed line. `generation`
/// increments every time the file is observed truncated, so identifiers
/// derived after a rewrite never collide with the earlier ones.
/// `last_timestamp` is the timestamp of the last record before `offset`,
/// reused for a following record that carries none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub offset: u64,
    /// Lines consumed up to `offset`, including blank ones
    pub line: u64,
    pub generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Checkpoint used after a truncation: back to the start, next generation.
    pub fn reset(&self) -> Self {
        Self {
            offset: 0,
            line: 0,
            generation: self.generation + 1,
            last_timestamp: None,
        }
    }

    /// Same read position, ignoring the carried timestamp.
    pub fn same_position(&self, other: &Checkpoint) -> bool {
        self.offset == other.offset && self.line == other.line && self.generation == other.generation
    }
}

/// Processing status of a conversation file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    Idle,
    Processing,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Idle => "idle",
            FileStatus::Processing => "processing",
            FileStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(FileStatus::Idle),
            "processing" => Ok(FileStatus::Processing),
            "error" => Ok(FileStatus::Error),
            _ => Err(format!("unknown file status: {}", s)),
        }
    }
}

/// A monitored source file, `<root>/<project>/<conversation>.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationFile {
    pub path: PathBuf,
    pub project_id: String,
    pub conversation_id: String,
    pub checkpoint: Checkpoint,
    pub modified_at: Option<DateTime<Utc>>,
    pub status: FileStatus,
    pub last_error: Option<String>,
}

impl ConversationFile {
    /// Build the record for a newly discovered file.
    ///
    /// Returns `None` when the path has no parent directory name or file stem.
    pub fn discovered(path: &Path) -> Option<Self> {
        let (project_id, conversation_id) = conversation_identity(path)?;
        Some(Self {
            path: path.to_path_buf(),
            project_id,
            conversation_id,
            checkpoint: Checkpoint::default(),
            modified_at: None,
            status: FileStatus::Idle,
            last_error: None,
        })
    }
}

/// `(project_id, conversation_id)` for a conversation file path.
///
/// The conversation id is the bare file stem, so it is only unique within a
/// project: `a/s1.jsonl` and `b/s1.jsonl` share it. Message and thread ids
/// hash the full path and never collide; code that needs a globally unique
/// key for a conversation pairs both ids.
pub fn conversation_identity(path: &Path) -> Option<(String, String)> {
    let conversation = path.file_stem()?.to_str()?.to_string();
    let project = path.parent()?.file_name()?.to_str()?.to_string();
    Some((project, conversation))
}

/// Stable message id: first 16 hex chars of SHA-256 over path and byte offset.
pub fn message_id(path: &Path, offset: u64, generation: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(b":");
    hasher.update(offset.to_string().as_bytes());
    if generation > 0 {
        hasher.update(b":g");
        hasher.update(generation.to_string().as_bytes());
    }
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

// ============================================
// Messages
// ============================================

/// Normalized speaker of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Map the many role spellings found in logs onto the three roles.
    pub fn normalize(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Role::User),
            "assistant" | "ai" | "model" | "bot" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// Token counts reported alongside a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Where a record came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub path: PathBuf,
    pub byte_offset: u64,
    pub line_number: u64,
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub project_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub source: SourceRef,
    /// Name of the detector that recognized the line
    pub detector: String,
    /// Original JSON object, preserved losslessly
    pub raw: serde_json::Value,
}

impl Message {
    /// Distinct tool names used in this message, in first-use order.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for call in &self.tool_calls {
            if !names.contains(&call.name.as_str()) {
                names.push(&call.name);
            }
        }
        names
    }
}

// ============================================
// Tool calls
// ============================================

/// Lifecycle of a tool call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ToolCallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ToolCallStatus::Pending),
            "success" => Ok(ToolCallStatus::Success),
            "error" => Ok(ToolCallStatus::Error),
            _ => Err(format!("unknown tool call status: {}", s)),
        }
    }
}

/// A tool invocation. Only `status`, `output` and `duration_ms` ever change,
/// and only through `pending → success | error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub message_id: String,
    pub name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub status: ToolCallStatus,
}

/// A tool result record, correlated to a call by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub correlation_id: String,
    pub output: serde_json::Value,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
    pub line_number: u64,
}

// ============================================
// Parse errors
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// A per-line problem. Collected per file, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseError {
    pub line_number: u64,
    pub raw: String,
    pub description: String,
    pub severity: Severity,
}

impl ParseError {
    pub fn error(line_number: u64, raw: &str, description: impl Into<String>) -> Self {
        Self {
            line_number,
            raw: raw.to_string(),
            description: description.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(line_number: u64, raw: &str, description: impl Into<String>) -> Self {
        Self {
            line_number,
            raw: raw.to_string(),
            description: description.into(),
            severity: Severity::Warning,
        }
    }
}

// ============================================
// Threads
// ============================================

/// Why a thread was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryReason {
    /// First message of the conversation
    FirstThread,
    TimeGap,
    TopicChange,
    ToolPatternBreak,
    /// A topic or tool rule failed and the decision fell back to a plain gap
    Degraded,
}

impl BoundaryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryReason::FirstThread => "first_thread",
            BoundaryReason::TimeGap => "time_gap",
            BoundaryReason::TopicChange => "topic_change",
            BoundaryReason::ToolPatternBreak => "tool_pattern_break",
            BoundaryReason::Degraded => "degraded",
        }
    }

    /// Confidence assigned to a thread opened for this reason.
    pub fn initial_confidence(&self) -> f64 {
        match self {
            BoundaryReason::FirstThread => 1.0,
            BoundaryReason::TimeGap => 0.95,
            BoundaryReason::TopicChange => 0.85,
            BoundaryReason::ToolPatternBreak => 0.7,
            BoundaryReason::Degraded => 0.5,
        }
    }
}

impl std::str::FromStr for BoundaryReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_thread" => Ok(BoundaryReason::FirstThread),
            "time_gap" => Ok(BoundaryReason::TimeGap),
            "topic_change" => Ok(BoundaryReason::TopicChange),
            "tool_pattern_break" => Ok(BoundaryReason::ToolPatternBreak),
            "degraded" => Ok(BoundaryReason::Degraded),
            _ => Err(format!("unknown boundary reason: {}", s)),
        }
    }
}

/// A coherent run of messages within one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// `<conversation_id>:<first message id>`
    pub id: String,
    pub conversation_id: String,
    pub message_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub topic: Option<String>,
    /// Most frequent salient keywords, strongest first
    #[serde(default)]
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub boundary: BoundaryReason,
    pub closed: bool,
}

impl Thread {
    pub fn thread_id(conversation_id: &str, first_message_id: &str) -> String {
        format!("{}:{}", conversation_id, first_message_id)
    }

    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }
}

// ============================================
// Context analysis
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTrend {
    Increasing,
    Stable,
    Decreasing,
}

impl ComplexityTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTrend::Increasing => "increasing",
            ComplexityTrend::Stable => "stable",
            ComplexityTrend::Decreasing => "decreasing",
        }
    }
}

/// Distribution of response latencies, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: Option<i64>,
    pub max_ms: Option<i64>,
    pub mean_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub p90_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementMetrics {
    pub user_messages: usize,
    pub assistant_messages: usize,
    /// `user / assistant`; absent when there are no assistant messages
    pub user_assistant_ratio: Option<f64>,
    pub response_latency: LatencyStats,
}

/// Derived, regenerable signals for one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAnalysis {
    pub keywords: Vec<String>,
    pub complexity: ComplexityTrend,
    pub engagement: EngagementMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_identity() {
        let path = Path::new("/root/projects/alpha/conv-1.jsonl");
        let (project, conversation) = conversation_identity(path).unwrap();
        assert_eq!(project, "alpha");
        assert_eq!(conversation, "conv-1");
    }

    #[test]
    fn test_message_id_is_stable_and_short() {
        let path = Path::new("/root/projects/alpha/conv-1.jsonl");
        let a = message_id(path, 42, 0);
        assert_eq!(a.len(), 16);
        assert_eq!(a, message_id(path, 42, 0));
        assert_ne!(a, message_id(path, 43, 0));
        assert_ne!(a, message_id(path, 42, 1));
    }

    #[test]
    fn test_same_stem_in_two_projects() {
        let a = Path::new("/root/alpha/session.jsonl");
        let b = Path::new("/root/beta/session.jsonl");
        let (project_a, conversation_a) = conversation_identity(a).unwrap();
        let (project_b, conversation_b) = conversation_identity(b).unwrap();
        assert_eq!(conversation_a, conversation_b);
        assert_ne!(project_a, project_b);
        assert_ne!(message_id(a, 0, 0), message_id(b, 0, 0));
    }

    #[test]
    fn test_checkpoint_reset_bumps_generation() {
        let cp = Checkpoint {
            offset: 100,
            line: 4,
            generation: 2,
            last_timestamp: Some(Utc::now()),
        };
        let reset = cp.reset();
        assert_eq!(reset.last_timestamp, None);
        assert_eq!(reset.offset, 0);
        assert_eq!(reset.line, 0);
        assert_eq!(reset.generation, 3);
    }

    #[test]
    fn test_role_normalize() {
        assert_eq!(Role::normalize("Human"), Some(Role::User));
        assert_eq!(Role::normalize("ai"), Some(Role::Assistant));
        assert_eq!(Role::normalize("model"), Some(Role::Assistant));
        assert_eq!(Role::normalize("bot"), Some(Role::Assistant));
        assert_eq!(Role::normalize("system"), Some(Role::System));
        assert_eq!(Role::normalize("summary"), None);
    }

    #[test]
    fn test_enum_string_roundtrip() {
        for reason in [
            BoundaryReason::FirstThread,
            BoundaryReason::TimeGap,
            BoundaryReason::TopicChange,
            BoundaryReason::ToolPatternBreak,
            BoundaryReason::Degraded,
        ] {
            assert_eq!(reason.as_str().parse::<BoundaryReason>(), Ok(reason));
        }
        assert_eq!("error".parse::<FileStatus>(), Ok(FileStatus::Error));
        assert_eq!("success".parse::<ToolCallStatus>(), Ok(ToolCallStatus::Success));
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let message = Message {
            id: "abc".to_string(),
            conversation_id: "c".to_string(),
            project_id: "p".to_string(),
            role: Role::User,
            content: "hi".to_string(),
            timestamp: Utc::now(),
            usage: None,
            tool_calls: vec![],
            source: SourceRef {
                path: PathBuf::from("/p/c.jsonl"),
                byte_offset: 0,
                line_number: 1,
            },
            detector: "role_content".to_string(),
            raw: serde_json::json!({"role": "user"}),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["conversationId"], "c");
        assert_eq!(value["role"], "user");
        assert_eq!(value["source"]["lineNumber"], 1);
        assert!(value.get("toolCalls").is_none());
    }
}
