//! # threadscope-core
//!
//! Core library for threadscope - a live watcher for conversation logs.
//!
//! This library provides:
//! - Incremental, crash-resumable reading of append-only `.jsonl` logs
//! - Normalization of heterogeneous record shapes into one message model
//! - Tool-call correlation and conversation threading
//! - SQLite persistence of records and checkpoints
//! - A sequenced fan-out of increments to WebSocket subscribers
//!
//! ## Architecture
//!
//! Data flows through four stages:
//! - **Watch:** filesystem events, debounced and stability-checked
//! - **Ingest:** new lines parsed into messages and tool-call updates
//! - **Thread:** messages grouped into topical threads, optionally analyzed
//! - **Emit:** records committed with their checkpoint, then published
//!
//! ## Example
//!
//! ```rust,no_run
//! use threadscope_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{Batch, Database};
pub use error::{Error, Result};
pub use pipeline::{Coordinator, PipelineCounters};
pub use sink::FanoutSink;
pub use store::StoreHandle;
pub use types::*;

// Public modules
pub mod analysis;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod sink;
pub mod store;
pub mod text;
pub mod threading;
pub mod types;
pub mod watcher;
