//! Record store
//!
//! SQLite storage with:
//! - Schema migrations
//! - Idempotent batch commits (records + checkpoint in one transaction)
//! - Checkpoint lookups for resuming files

pub mod repo;
pub mod schema;

pub use repo::{Batch, Database};
