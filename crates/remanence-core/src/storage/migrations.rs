//! Database migrations
//!
//! Schema migration definitions for the storage layer. Each migration is a
//! single SQL batch; `schema_version` tracks what has been applied.

/// Latest schema version; stamped into `store_meta` on creation
pub const LATEST_VERSION: u32 = 2;

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, associations, clusters, store_meta",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Consolidation run history and transient decay score cache",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,

    -- Ordered, comma-separated tag serialization; never contains an
    -- empty element. Queries wrap both sides in ',' delimiters so a
    -- substring match cannot cross tag boundaries.
    tags TEXT NOT NULL DEFAULT '',
    memory_type TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',

    -- Paired timestamps: epoch REAL drives comparisons, ISO is for humans
    created_at REAL NOT NULL,
    created_at_iso TEXT NOT NULL,
    updated_at REAL NOT NULL,
    updated_at_iso TEXT NOT NULL,

    -- Little-endian float32 blob, 4 * dimension bytes
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);

-- Creative associations discovered during consolidation.
-- Pairs are stored once, hashes in lexicographic order.
CREATE TABLE IF NOT EXISTS associations (
    source_hash TEXT NOT NULL,
    target_hash TEXT NOT NULL,
    similarity REAL NOT NULL,
    discovered_at REAL NOT NULL,
    PRIMARY KEY (source_hash, target_hash)
);

CREATE INDEX IF NOT EXISTS idx_associations_discovered ON associations(discovered_at);

-- Semantic clusters, regenerated atomically each clustering run
CREATE TABLE IF NOT EXISTS clusters (
    cluster_id TEXT PRIMARY KEY,
    theme TEXT NOT NULL,
    centroid BLOB NOT NULL,
    created_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS cluster_members (
    cluster_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (cluster_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_cluster_members_cluster ON cluster_members(cluster_id);

-- Store-level metadata: dimension, model identifier, schema version,
-- consolidation last-run timestamps, and the run lock
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Consolidation bookkeeping
/// Decay scores are recomputed per run, not a column on memories; this is
/// their transient cache, keyed by content hash.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS decay_scores (
    content_hash TEXT PRIMARY KEY,
    score REAL NOT NULL,
    computed_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS consolidation_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at REAL NOT NULL,
    finished_at REAL,
    status TEXT NOT NULL DEFAULT 'running',
    phases TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_consolidation_runs_started ON consolidation_runs(started_at);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================
