//! Database schema and migrations
//!
//! Migrations are embedded and tracked with `PRAGMA user_version`.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: conversation files, messages, tool calls, threads
    r#"
    -- ============================================
    -- Checkpoints
    -- ============================================

    CREATE TABLE IF NOT EXISTS conversation_files (
        path             TEXT PRIMARY KEY,
        project_id       TEXT NOT NULL,
        conversation_id  TEXT NOT NULL,
        byte_offset      INTEGER NOT NULL DEFAULT 0,
        line_count       INTEGER NOT NULL DEFAULT 0,
        generation       INTEGER NOT NULL DEFAULT 0,
        modified_at      DATETIME,
        status           TEXT NOT NULL DEFAULT 'idle',
        last_error       TEXT,
        updated_at       DATETIME NOT NULL
    );

    -- ============================================
    -- Records
    -- ============================================

    CREATE TABLE IF NOT EXISTS messages (
        id                    TEXT PRIMARY KEY,
        conversation_id       TEXT NOT NULL,
        project_id            TEXT NOT NULL,
        role                  TEXT NOT NULL,
        content               TEXT NOT NULL,
        ts                    DATETIME NOT NULL,

        tokens_in             INTEGER,
        tokens_out            INTEGER,
        cache_read_tokens     INTEGER,
        cache_creation_tokens INTEGER,

        -- Lineage
        source_file           TEXT NOT NULL,
        source_offset         INTEGER NOT NULL,
        source_line           INTEGER NOT NULL,
        detector              TEXT NOT NULL,

        -- Lossless capture
        raw_data              JSON NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, ts, source_offset);

    CREATE TABLE IF NOT EXISTS tool_calls (
        id               TEXT PRIMARY KEY,
        message_id       TEXT NOT NULL REFERENCES messages(id),
        name             TEXT NOT NULL,
        input            JSON,
        output           JSON,
        duration_ms      INTEGER,
        status           TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tool_calls_message ON tool_calls(message_id);

    -- ============================================
    -- Threads
    -- ============================================

    CREATE TABLE IF NOT EXISTS threads (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL,
        started_at       DATETIME NOT NULL,
        ended_at         DATETIME NOT NULL,
        message_count    INTEGER NOT NULL,
        message_ids      JSON NOT NULL,
        topic            TEXT,
        keywords         JSON NOT NULL,
        confidence       REAL NOT NULL,
        boundary         TEXT NOT NULL,
        closed           INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_threads_conversation ON threads(conversation_id, started_at);
    "#,
    // Version 2: timestamp carried across restarts for records without one
    r#"
    ALTER TABLE conversation_files ADD COLUMN last_timestamp DATETIME;
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
