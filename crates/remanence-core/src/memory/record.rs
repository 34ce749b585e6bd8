//! Memory record - the fundamental stored unit
//!
//! Identity is the SHA-256 hex of the content; two memories with equal
//! content are by definition the same memory. Content is immutable after
//! creation; tags, type, and metadata are mutable through the update path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Tag added to a memory when the forgetting phase archives it
pub const ARCHIVED_TAG: &str = "archived";

/// Memory type assigned to compression summaries
pub const SUMMARY_TYPE: &str = "summary";

/// Metadata key holding the archival timestamp (epoch seconds)
pub const ARCHIVED_AT_KEY: &str = "archived_at";

/// Metadata key that exempts a memory from decay and forgetting
pub const PINNED_KEY: &str = "pinned";

/// Metadata key on summaries listing the member hashes they compress
pub const SOURCE_HASHES_KEY: &str = "source_hashes";

// ============================================================================
// CONTENT HASHING AND TAGS
// ============================================================================

/// SHA-256 hex digest of the content, lowercase, 64 chars.
/// This is the stable identity of a memory.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize a tag collection: trim whitespace, drop empties, dedup while
/// preserving first-seen order. The result never contains an empty element.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let trimmed = tag.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Serialize tags as a comma-separated string for storage.
/// Commas inside a tag would corrupt the serialization, so they are
/// replaced with spaces before joining.
pub fn tags_to_csv(tags: &[String]) -> String {
    tags.iter()
        .map(|t| t.replace(',', " ").trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the stored comma-separated tag string back into a normalized list
pub fn tags_from_csv(csv: &str) -> Vec<String> {
    normalize_tags(csv.split(','))
}

// ============================================================================
// MEMORY
// ============================================================================

/// A stored memory
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// The text content; immutable after creation
    pub content: String,
    /// SHA-256 hex of `content`; unique across the store
    pub content_hash: String,
    /// Tag set (logically a set, stored in insertion order)
    pub tags: Vec<String>,
    /// Open-vocabulary type (`note`, `reference`, `decision`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    /// Open JSON metadata map
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Creation time, epoch seconds
    pub created_at: f64,
    /// Creation time, ISO-8601 UTC
    pub created_at_iso: String,
    /// Last mutation time, epoch seconds (>= created_at)
    pub updated_at: f64,
    /// Last mutation time, ISO-8601 UTC
    pub updated_at_iso: String,
}

impl Memory {
    /// Whether the metadata pins this memory (exempt from decay/forgetting)
    pub fn is_pinned(&self) -> bool {
        self.metadata
            .get(PINNED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether the forgetting phase has archived this memory
    pub fn is_archived(&self) -> bool {
        self.tags.iter().any(|t| t == ARCHIVED_TAG)
    }

    /// Epoch seconds at which this memory was archived, if it was
    pub fn archived_at(&self) -> Option<f64> {
        self.metadata.get(ARCHIVED_AT_KEY).and_then(Value::as_f64)
    }

    /// Age of the memory in days relative to `now` (epoch seconds)
    pub fn age_days(&self, now: f64) -> f64 {
        ((now - self.created_at) / 86_400.0).max(0.0)
    }

    /// Member hashes listed by a summary memory, empty for non-summaries
    pub fn source_hashes(&self) -> Vec<String> {
        self.metadata
            .get(SOURCE_HASHES_KEY)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// OPERATION RESULTS
// ============================================================================

/// Result of a `store` operation.
///
/// Duplicates are not errors: storing already-present content returns
/// `success = false` with `reason = "duplicate"` and the existing hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
}

impl StoreOutcome {
    pub fn created(memory: Memory) -> Self {
        Self {
            success: true,
            reason: None,
            content_hash: memory.content_hash.clone(),
            memory: Some(memory),
        }
    }

    pub fn duplicate(content_hash: String) -> Self {
        Self {
            success: false,
            reason: Some("duplicate".to_string()),
            content_hash,
            memory: None,
        }
    }
}

/// A semantic retrieval hit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedMemory {
    pub memory: Memory,
    /// Rescaled cosine similarity: `(cosine + 1) / 2`, in [0, 1].
    /// 0.5 marks orthogonality; 1.0 an exact directional match.
    pub relevance_score: f32,
}

/// Tag filter mode for `search_by_tag` / `delete_by_tag`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagMode {
    /// Memory's tag set must contain every query tag
    #[default]
    And,
    /// Memory's tag set must intersect the query tags
    Or,
}

impl std::str::FromStr for TagMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AND" => Ok(TagMode::And),
            "OR" => Ok(TagMode::Or),
            other => Err(format!("unknown tag mode: {other}")),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
