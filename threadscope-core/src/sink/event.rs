//! Wire types of the fan-out stream.

use crate::types::{ContextAnalysis, Message, ParseError, Thread, ToolCall};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One increment published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkEvent {
    #[serde(rename = "message.appended", rename_all = "camelCase")]
    MessageAppended {
        conversation_id: String,
        project_id: String,
        message: Message,
    },

    #[serde(rename = "thread.updated", rename_all = "camelCase")]
    ThreadUpdated {
        conversation_id: String,
        project_id: String,
        thread: Thread,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_analysis: Option<ContextAnalysis>,
    },

    #[serde(rename = "tool_call.updated", rename_all = "camelCase")]
    ToolCallUpdated {
        conversation_id: String,
        project_id: String,
        tool_call: ToolCall,
    },

    #[serde(rename = "file.error", rename_all = "camelCase")]
    FileError {
        path: PathBuf,
        project_id: String,
        conversation_id: String,
        parse_errors: Vec<ParseError>,
    },

    #[serde(rename = "file.truncated", rename_all = "camelCase")]
    FileTruncated {
        path: PathBuf,
        project_id: String,
        conversation_id: String,
    },

    #[serde(rename = "conversation.finalized", rename_all = "camelCase")]
    ConversationFinalized {
        conversation_id: String,
        project_id: String,
        threads: Vec<Thread>,
    },
}

impl SinkEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SinkEvent::MessageAppended { .. } => "message.appended",
            SinkEvent::ThreadUpdated { .. } => "thread.updated",
            SinkEvent::ToolCallUpdated { .. } => "tool_call.updated",
            SinkEvent::FileError { .. } => "file.error",
            SinkEvent::FileTruncated { .. } => "file.truncated",
            SinkEvent::ConversationFinalized { .. } => "conversation.finalized",
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            SinkEvent::MessageAppended { project_id, .. }
            | SinkEvent::ThreadUpdated { project_id, .. }
            | SinkEvent::ToolCallUpdated { project_id, .. }
            | SinkEvent::FileError { project_id, .. }
            | SinkEvent::FileTruncated { project_id, .. }
            | SinkEvent::ConversationFinalized { project_id, .. } => project_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            SinkEvent::MessageAppended {
                conversation_id, ..
            }
            | SinkEvent::ThreadUpdated {
                conversation_id, ..
            }
            | SinkEvent::ToolCallUpdated {
                conversation_id, ..
            }
            | SinkEvent::FileError {
                conversation_id, ..
            }
            | SinkEvent::FileTruncated {
                conversation_id, ..
            }
            | SinkEvent::ConversationFinalized {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// An event with its stream position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(flatten)]
    pub event: SinkEvent,
}

/// What a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    All,
    Project {
        #[serde(rename = "projectId", alias = "project_id")]
        project_id: String,
    },
    /// Matches by file stem, across every project that has one.
    Conversation {
        #[serde(rename = "conversationId", alias = "conversation_id")]
        conversation_id: String,
    },
}

impl Scope {
    pub fn matches(&self, event: &SinkEvent) -> bool {
        match self {
            Scope::All => true,
            Scope::Project { project_id } => event.project_id() == project_id,
            Scope::Conversation { conversation_id } => event.conversation_id() == conversation_id,
        }
    }
}

/// Control frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        scope: Scope,
        #[serde(default)]
        since: Option<u64>,
    },
    Unsubscribe {
        scope: Scope,
    },
    Ping,
}

/// Control frames sent by the server; events travel as [`Envelope`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        scope: Scope,
        /// Events replayed after this frame
        replayed: usize,
        /// False when `since` is older than the replay log reaches
        complete: bool,
        head: u64,
    },
    Unsubscribed {
        scope: Scope,
    },
    Pong {
        head: u64,
    },
    Error {
        message: String,
    },
}
