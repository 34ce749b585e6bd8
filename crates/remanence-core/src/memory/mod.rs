//! Memory module - core types and data structures
//!
//! The memory model:
//! - `Memory`: a stored text record identified by its SHA-256 content hash,
//!   carrying a tag set, an open-vocabulary type, a JSON metadata map, and a
//!   paired epoch/ISO timestamp on both creation and update
//! - `Association` / `Cluster`: artifacts produced by consolidation,
//!   referencing memories by content hash only (no structural pointers)

mod record;
mod temporal;

pub use record::{
    content_hash, normalize_tags, tags_from_csv, tags_to_csv, Memory, RetrievedMemory,
    StoreOutcome, TagMode, ARCHIVED_AT_KEY, ARCHIVED_TAG, PINNED_KEY, SOURCE_HASHES_KEY,
    SUMMARY_TYPE,
};
pub use temporal::{parse_time_expression, TimeParseError, TimeRange, Timestamp};

use serde::{Deserialize, Serialize};

// ============================================================================
// CONSOLIDATION ARTIFACTS
// ============================================================================

/// A discovered link between two memories whose similarity falls in the
/// creative band. Symmetric pairs are stored once, hashes in lexicographic
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub source_hash: String,
    pub target_hash: String,
    pub similarity: f32,
    /// Epoch seconds at discovery (latest refresh)
    pub discovered_at: f64,
}

impl Association {
    /// Order a pair lexicographically so (A,B) and (B,A) collapse to one row
    pub fn ordered(a: &str, b: &str, similarity: f32, discovered_at: f64) -> Self {
        let (source_hash, target_hash) = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        Self {
            source_hash,
            target_hash,
            similarity,
            discovered_at,
        }
    }
}

/// A semantic grouping discovered by clustering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub cluster_id: String,
    /// Most frequent shared tag, or `cluster-N` when members are untagged
    pub theme: String,
    /// Renormalized mean of member embeddings
    pub centroid: Vec<f32>,
    pub member_hashes: Vec<String>,
    /// Epoch seconds at creation
    pub created_at: f64,
}

// ============================================================================
// HEALTH AND STATS
// ============================================================================

/// Result of the `health` operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub total_memories: i64,
    pub db_size_bytes: u64,
    pub unique_tags: usize,
    pub dimension: usize,
    pub model: String,
    pub schema_version: u32,
    pub uptime_seconds: u64,
}

/// Expanded counters for the `stats` operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_memories: i64,
    pub archived_memories: i64,
    pub summary_memories: i64,
    /// Live (non-archived) count
    pub live_memories: i64,
    pub associations: i64,
    pub clusters: i64,
    /// Count per memory type, untyped memories under ""
    pub memories_by_type: std::collections::BTreeMap<String, i64>,
    pub unique_tags: usize,
    pub db_size_bytes: u64,
    /// Epoch seconds of the oldest / newest memory
    pub oldest_memory: Option<f64>,
    pub newest_memory: Option<f64>,
}
