//! Storage layer
//!
//! SQLite-backed durable store with WAL journaling, plus the retry layer
//! that coordinates writers across processes.

pub mod migrations;
mod retry;
mod sqlite;

pub use retry::{is_transient, run_with_retry, RetryError, RetryPolicy};
pub use sqlite::{
    ConsolidationRunRecord, MemoryStore, Result, SnapshotRow, StorageError, MAX_TAG_LEN,
};
