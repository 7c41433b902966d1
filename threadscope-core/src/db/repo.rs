//! Database repository layer
//!
//! Write side of the record store plus the lookups the pipeline and tests
//! need. Every write is an idempotent upsert keyed by id, so replaying a
//! batch after a crash leaves the store unchanged.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Everything one processed batch writes, committed atomically.
#[derive(Debug, Clone)]
pub struct Batch {
    /// File state after the batch, including the new checkpoint
    pub file: ConversationFile,
    pub messages: Vec<Message>,
    /// Tool calls whose status changed
    pub tool_calls: Vec<ToolCall>,
    /// Current snapshots of touched threads
    pub threads: Vec<Thread>,
    /// Threads merged into others at finalization; deleted
    pub retired_threads: Vec<String>,
}

impl Batch {
    pub fn checkpoint_only(file: ConversationFile) -> Self {
        Self {
            file,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            threads: Vec::new(),
            retired_threads: Vec::new(),
        }
    }
}

/// Main database handle
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        super::schema::run_migrations(&conn)
    }

    /// Run raw SQL; tests use it to break and repair the schema.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("database mutex poisoned".to_string()))
    }

    // ============================================
    // Batches
    // ============================================

    /// Write a batch's records and its checkpoint in one transaction.
    pub fn commit_batch(&self, batch: &Batch) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for message in &batch.messages {
            insert_message(&tx, message)?;
            for call in &message.tool_calls {
                upsert_tool_call(&tx, call)?;
            }
        }
        for call in &batch.tool_calls {
            upsert_tool_call(&tx, call)?;
        }

        for id in &batch.retired_threads {
            tx.execute(
                "DELETE FROM threads WHERE id = ?1 AND conversation_id = ?2",
                params![id, batch.file.conversation_id],
            )?;
        }
        for thread in &batch.threads {
            upsert_thread(&tx, thread)?;
        }

        upsert_file(&tx, &batch.file)?;
        tx.commit()?;
        Ok(())
    }

    // ============================================
    // Conversation files
    // ============================================

    /// Stored state of a file, if it was ever committed.
    pub fn load_checkpoint(&self, path: &Path) -> Result<Option<ConversationFile>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM conversation_files WHERE path = ?",
            [path.to_string_lossy()],
            Self::row_to_file,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Update status only; the checkpoint is left alone.
    pub fn set_file_status(
        &self,
        path: &Path,
        status: FileStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE conversation_files SET status = ?2, last_error = ?3, updated_at = ?4
             WHERE path = ?1",
            params![
                path.to_string_lossy(),
                status.as_str(),
                last_error,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Forget a file's checkpoint. Its records stay.
    pub fn remove_file(&self, path: &Path) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM conversation_files WHERE path = ?",
            [path.to_string_lossy()],
        )?;
        Ok(removed > 0)
    }

    pub fn list_files(&self) -> Result<Vec<ConversationFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM conversation_files ORDER BY path")?;
        let files = stmt
            .query_map([], Self::row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    fn row_to_file(row: &Row) -> rusqlite::Result<ConversationFile> {
        let path: String = row.get("path")?;
        let status: String = row.get("status")?;
        let modified_at: Option<String> = row.get("modified_at")?;
        let last_timestamp: Option<String> = row.get("last_timestamp")?;

        Ok(ConversationFile {
            path: path.into(),
            project_id: row.get("project_id")?,
            conversation_id: row.get("conversation_id")?,
            checkpoint: Checkpoint {
                offset: row.get::<_, i64>("byte_offset")? as u64,
                line: row.get::<_, i64>("line_count")? as u64,
                generation: row.get::<_, i64>("generation")? as u32,
                last_timestamp: last_timestamp.as_deref().and_then(parse_datetime),
            },
            modified_at: modified_at.as_deref().and_then(parse_datetime),
            status: status.parse().unwrap_or_default(),
            last_error: row.get("last_error")?,
        })
    }

    // ============================================
    // Messages and tool calls
    // ============================================

    pub fn count_messages(&self, conversation_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?",
            [conversation_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Message ids of a conversation in timestamp order, offset as tie-break.
    pub fn message_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE conversation_id = ? ORDER BY ts, source_offset",
        )?;
        let ids = stmt
            .query_map([conversation_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn get_tool_call(&self, id: &str) -> Result<Option<ToolCall>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM tool_calls WHERE id = ?",
            [id],
            Self::row_to_tool_call,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_tool_call(row: &Row) -> rusqlite::Result<ToolCall> {
        let status: String = row.get("status")?;
        let input: Option<String> = row.get("input")?;
        let output: Option<String> = row.get("output")?;

        Ok(ToolCall {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            name: row.get("name")?,
            input: input
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            output: output.and_then(|s| serde_json::from_str(&s).ok()),
            duration_ms: row.get("duration_ms")?,
            status: status.parse().unwrap_or_default(),
        })
    }

    // ============================================
    // Threads
    // ============================================

    pub fn list_threads(&self, conversation_id: &str) -> Result<Vec<Thread>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM threads WHERE conversation_id = ? ORDER BY started_at, id",
        )?;
        let threads = stmt
            .query_map([conversation_id], Self::row_to_thread)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(threads)
    }

    fn row_to_thread(row: &Row) -> rusqlite::Result<Thread> {
        let started_at: String = row.get("started_at")?;
        let ended_at: String = row.get("ended_at")?;
        let message_ids: String = row.get("message_ids")?;
        let keywords: String = row.get("keywords")?;
        let boundary: String = row.get("boundary")?;
        let started_at = parse_datetime(&started_at).unwrap_or_else(Utc::now);

        Ok(Thread {
            id: row.get("id")?,
            conversation_id: row.get("conversation_id")?,
            message_ids: serde_json::from_str(&message_ids).unwrap_or_default(),
            started_at,
            ended_at: parse_datetime(&ended_at).unwrap_or(started_at),
            topic: row.get("topic")?,
            keywords: serde_json::from_str(&keywords).unwrap_or_default(),
            confidence: row.get("confidence")?,
            boundary: boundary.parse().unwrap_or(BoundaryReason::FirstThread),
            closed: row.get("closed")?,
        })
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn insert_message(tx: &Transaction, message: &Message) -> Result<()> {
    let usage = message.usage.unwrap_or_default();
    let has_usage = message.usage.is_some();
    tx.execute(
        r#"
        INSERT INTO messages (id, conversation_id, project_id, role, content, ts,
                              tokens_in, tokens_out, cache_read_tokens, cache_creation_tokens,
                              source_file, source_offset, source_line, detector, raw_data)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(id) DO NOTHING
        "#,
        params![
            message.id,
            message.conversation_id,
            message.project_id,
            message.role.as_str(),
            message.content,
            message.timestamp.to_rfc3339(),
            has_usage.then_some(usage.input_tokens as i64),
            has_usage.then_some(usage.output_tokens as i64),
            has_usage.then_some(usage.cache_read_tokens as i64),
            has_usage.then_some(usage.cache_creation_tokens as i64),
            message.source.path.to_string_lossy(),
            message.source.byte_offset as i64,
            message.source.line_number as i64,
            message.detector,
            message.raw.to_string(),
        ],
    )?;
    Ok(())
}

/// A resolved call is never downgraded back to pending.
fn upsert_tool_call(tx: &Transaction, call: &ToolCall) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO tool_calls (id, message_id, name, input, output, duration_ms, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            output = excluded.output,
            duration_ms = excluded.duration_ms,
            status = excluded.status
        WHERE excluded.status != 'pending'
        "#,
        params![
            call.id,
            call.message_id,
            call.name,
            call.input.to_string(),
            call.output.as_ref().map(|o| o.to_string()),
            call.duration_ms,
            call.status.as_str(),
        ],
    )?;
    Ok(())
}

fn upsert_thread(tx: &Transaction, thread: &Thread) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO threads (id, conversation_id, started_at, ended_at, message_count,
                             message_ids, topic, keywords, confidence, boundary, closed)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            ended_at = excluded.ended_at,
            message_count = excluded.message_count,
            message_ids = excluded.message_ids,
            topic = excluded.topic,
            keywords = excluded.keywords,
            confidence = excluded.confidence,
            closed = excluded.closed
        "#,
        params![
            thread.id,
            thread.conversation_id,
            thread.started_at.to_rfc3339(),
            thread.ended_at.to_rfc3339(),
            thread.len() as i64,
            serde_json::to_string(&thread.message_ids)?,
            thread.topic,
            serde_json::to_string(&thread.keywords)?,
            thread.confidence,
            thread.boundary.as_str(),
            thread.closed,
        ],
    )?;
    Ok(())
}

fn upsert_file(tx: &Transaction, file: &ConversationFile) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO conversation_files (path, project_id, conversation_id, byte_offset,
                                        line_count, generation, last_timestamp, modified_at,
                                        status, last_error, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(path) DO UPDATE SET
            byte_offset = excluded.byte_offset,
            line_count = excluded.line_count,
            generation = excluded.generation,
            last_timestamp = excluded.last_timestamp,
            modified_at = excluded.modified_at,
            status = excluded.status,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
        params![
            file.path.to_string_lossy(),
            file.project_id,
            file.conversation_id,
            file.checkpoint.offset as i64,
            file.checkpoint.line as i64,
            file.checkpoint.generation as i64,
            file.checkpoint.last_timestamp.map(|t| t.to_rfc3339()),
            file.modified_at.map(|t| t.to_rfc3339()),
            file.status.as_str(),
            file.last_error,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}
