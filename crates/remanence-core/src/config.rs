//! Engine configuration
//!
//! All tunables recognized by the store and the consolidation pipeline,
//! with defaults matching the documented behavior. Everything is plain
//! data so callers can deserialize it from whatever config source their
//! transport layer uses.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default embedding dimension
pub const DEFAULT_DIMENSION: usize = 384;

/// Top-level store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Directory holding the database file (and its WAL/SHM siblings).
    /// `None` resolves to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Database file name inside `data_dir`
    pub db_file_name: String,
    /// Embedding dimension, fixed at store creation
    pub dimension: usize,
    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// SQLite page cache size in pages
    pub cache_size_pages: i64,
    /// Free-form pragma overrides applied after the built-in set
    pub pragmas: BTreeMap<String, String>,
    /// Batch size for streaming embeddings during linear-scan retrieval
    pub scan_batch_size: usize,
    /// Encoder (content -> vector) cache capacity
    pub encoder_cache_capacity: usize,
    /// Consolidation pipeline tunables
    pub consolidation: ConsolidationConfig,
    /// Consolidation cadences
    pub schedule: ScheduleConfig,
    /// Per-operation deadlines
    pub timeouts: TimeoutConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_file_name: "memory.db".to_string(),
            dimension: DEFAULT_DIMENSION,
            busy_timeout_ms: 15_000,
            cache_size_pages: 20_000,
            pragmas: BTreeMap::new(),
            scan_batch_size: 512,
            encoder_cache_capacity: 500,
            consolidation: ConsolidationConfig::default(),
            schedule: ScheduleConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Resolve the database path, creating the data directory if needed
    pub fn resolve_db_path(&self) -> std::io::Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(d) => d.clone(),
            None => {
                let proj = directories::ProjectDirs::from("io", "remanence", "remanence")
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "could not determine platform data directory",
                        )
                    })?;
                proj.data_dir().to_path_buf()
            }
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(&self.db_file_name))
    }
}

/// Per-memory-type retention used by decay scoring
///
/// `decay_score = exp(-age_days / retention_days(type))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionTable {
    pub critical: f64,
    pub reference: f64,
    pub session_summary: f64,
    pub task: f64,
    pub temporary: f64,
    /// Applies to `note` and any type not otherwise listed
    pub default: f64,
    /// Extra per-type overrides (open vocabulary)
    pub overrides: BTreeMap<String, f64>,
}

impl Default for RetentionTable {
    fn default() -> Self {
        Self {
            critical: 365.0,
            reference: 180.0,
            session_summary: 90.0,
            task: 7.0,
            temporary: 7.0,
            default: 30.0,
            overrides: BTreeMap::new(),
        }
    }
}

impl RetentionTable {
    /// Retention in days for a memory type
    pub fn days_for(&self, memory_type: Option<&str>) -> f64 {
        let Some(t) = memory_type else {
            return self.default;
        };
        if let Some(v) = self.overrides.get(t) {
            return *v;
        }
        match t {
            "critical" => self.critical,
            "reference" => self.reference,
            "session-summary" => self.session_summary,
            "task" => self.task,
            "temporary" => self.temporary,
            _ => self.default,
        }
    }
}

/// Creative association discovery tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssociationConfig {
    /// Lower bound of the creative similarity band
    pub low: f32,
    /// Upper bound of the creative similarity band
    pub high: f32,
    /// Maximum new or refreshed pairs per run
    pub max_pairs_per_run: usize,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            low: 0.30,
            high: 0.70,
            max_pairs_per_run: 100,
        }
    }
}

/// Semantic clustering tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// DBSCAN minimum cluster size
    pub min_samples: usize,
    /// Lower clamp on derived eps (cosine distance)
    pub eps_floor: f32,
    /// Upper clamp on derived eps (cosine distance)
    pub eps_ceiling: f32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            eps_floor: 0.15,
            eps_ceiling: 0.50,
        }
    }
}

/// Summary compression tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    /// Maximum summary content length in characters
    pub max_chars: usize,
    /// Cap on tags carried over from members onto the summary
    pub max_tags: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_chars: 500,
            max_tags: 10,
        }
    }
}

/// Controlled forgetting tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForgettingConfig {
    /// Decay score below which an old memory is archived
    pub relevance_threshold: f64,
    /// Minimum age in days before a memory is eligible for archival
    pub access_threshold_days: f64,
    /// Days after archival before hard deletion
    pub grace_days: f64,
}

impl Default for ForgettingConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.10,
            access_threshold_days: 90.0,
            grace_days: 180.0,
        }
    }
}

/// Consolidation pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsolidationConfig {
    pub retention: RetentionTable,
    pub association: AssociationConfig,
    pub cluster: ClusterConfig,
    pub compression: CompressionConfig,
    pub forgetting: ForgettingConfig,
    /// Days to keep association/cluster artifacts before purging
    pub artifact_retention_days: ArtifactRetention,
}

/// Artifact retention wrapper so the default is visible in serialized config
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRetention(pub f64);

impl Default for ArtifactRetention {
    fn default() -> Self {
        ArtifactRetention(90.0)
    }
}

/// Consolidation cadences
///
/// Hours are local-time hours of day. Missed cadences are coalesced: when
/// several have lapsed, each phase runs exactly once, in pipeline order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    /// Daily decay scoring hour (default 02:00)
    pub decay_hour: u32,
    /// Weekly association discovery: weekday (0 = Sunday) and hour
    pub association_weekday: u32,
    pub association_hour: u32,
    /// Monthly clustering + compression + forgetting: day of month and hour
    pub monthly_day: u32,
    pub monthly_hour: u32,
    /// Seconds after which an abandoned run lock may be taken over
    pub stale_lock_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            decay_hour: 2,
            association_weekday: 0,
            association_hour: 3,
            monthly_day: 1,
            monthly_hour: 4,
            stale_lock_secs: 2 * 60 * 60,
        }
    }
}

/// Per-operation deadlines in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub store_secs: u64,
    pub retrieve_secs: u64,
    pub phase_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store_secs: 10,
            retrieve_secs: 30,
            phase_secs: 600,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = StoreConfig::default();
        assert_eq!(config.dimension, 384);
        assert_eq!(config.busy_timeout_ms, 15_000);
        assert_eq!(config.cache_size_pages, 20_000);
        assert_eq!(config.consolidation.association.max_pairs_per_run, 100);
        assert_eq!(config.consolidation.cluster.min_samples, 5);
        assert_eq!(config.consolidation.compression.max_chars, 500);
        assert!((config.consolidation.forgetting.relevance_threshold - 0.10).abs() < 1e-9);
        assert_eq!(config.schedule.decay_hour, 2);
    }

    #[test]
    fn test_retention_lookup() {
        let table = RetentionTable::default();
        assert_eq!(table.days_for(Some("critical")), 365.0);
        assert_eq!(table.days_for(Some("reference")), 180.0);
        assert_eq!(table.days_for(Some("session-summary")), 90.0);
        assert_eq!(table.days_for(Some("task")), 7.0);
        assert_eq!(table.days_for(Some("note")), 30.0);
        assert_eq!(table.days_for(None), 30.0);
    }

    #[test]
    fn test_retention_override_wins() {
        let mut table = RetentionTable::default();
        table.overrides.insert("task".to_string(), 14.0);
        assert_eq!(table.days_for(Some("task")), 14.0);
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = StoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dimension, config.dimension);
        assert_eq!(back.schedule.monthly_day, config.schedule.monthly_day);
    }
}
