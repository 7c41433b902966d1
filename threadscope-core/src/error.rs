//! Error types for threadscope-core

use thiserror::Error;

/// Main error type for the threadscope-core library
///
/// Per-line problems never surface here; they are carried as
/// [`ParseError`](crate::types::ParseError) records instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The directory watcher could not be created or attached
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Store actor failure (closed channel, poisoned connection)
    #[error("store error: {0}")]
    Store(String),

    /// Fan-out sink error
    #[error("sink error: {0}")]
    Sink(String),

    /// File-level parse failure
    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// Pipeline coordinator error
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

/// Result type alias for threadscope-core
pub type Result<T> = std::result::Result<T, Error>;
