//! SQLite storage engine
//!
//! The durable store: a single database file with WAL journaling, owned
//! exclusively by [`MemoryStore`]. Uses separate reader/writer connections
//! for interior mutability; all methods take `&self`, so the store is
//! `Send + Sync` and callers can share it behind an `Arc`. A process-local
//! writer mutex serializes mutations; across processes the database's own
//! lock plus busy/locked retry coordinate writers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::config::StoreConfig;
use crate::embeddings::{
    cosine_similarity, decode_vector, encode_vector, Encoder, EncoderError,
};
use crate::memory::{
    content_hash, normalize_tags, parse_time_expression, tags_from_csv, tags_to_csv, Association,
    Cluster, HealthReport, Memory, MemoryStats, RetrievedMemory, StoreOutcome, TagMode,
    TimeParseError, TimeRange, Timestamp, ARCHIVED_AT_KEY, ARCHIVED_TAG, PINNED_KEY, SUMMARY_TYPE,
};
use crate::service::OpBudget;

use super::migrations;
use super::retry::{run_with_retry, RetryError, RetryPolicy};

/// Maximum accepted tag length in characters
pub const MAX_TAG_LEN: usize = 128;

// Store metadata keys
pub(crate) const META_DIMENSION: &str = "dimension";
pub(crate) const META_MODEL: &str = "model_identifier";
pub(crate) const META_SCHEMA: &str = "schema_version";
const META_CREATED: &str = "created_at";

/// SQL fragment excluding archived memories. The tag CSV is wrapped in
/// delimiters so a substring match cannot cross tag boundaries.
const NOT_ARCHIVED: &str = "instr(',' || tags || ',', ',archived,') = 0";

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error taxonomy
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Empty content, malformed hash, oversized tag, bad patch shape
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Unknown content hash
    #[error("memory not found: {0}")]
    NotFound(String),
    /// Encoder output length disagrees with the store's declared dimension
    #[error("dimension mismatch: store declares {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// Persisted dimension or model identifier disagrees with the encoder;
    /// the store refuses to load
    #[error("incompatible store: {0}")]
    IncompatibleStore(String),
    /// Encoder-side failure
    #[error("embedding failed: {0}")]
    Embedding(#[from] EncoderError),
    /// Unparseable time-range expression
    #[error("invalid time expression: {0}")]
    InvalidTimeExpression(#[from] TimeParseError),
    /// Lock contention persisted past the whole backoff budget
    #[error("database contention persisted after {attempts} retries")]
    Contention { attempts: u32 },
    /// Deadline exceeded
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Cooperative cancellation observed
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    /// Stored state failed an integrity check; operator intervention needed
    #[error("store corrupted: {0}")]
    Corrupted(String),
    /// Initialization error
    #[error("initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    fn from_retry(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { attempts, .. } => StorageError::Contention { attempts },
            RetryError::Fatal(e) => StorageError::Database(e),
        }
    }
}

fn is_unique_violation(err: &StorageError) -> bool {
    match err {
        StorageError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
        }
        _ => false,
    }
}

/// One row of the consolidation run history
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationRunRecord {
    pub id: i64,
    pub started_at: f64,
    pub finished_at: Option<f64>,
    /// `running`, `completed`, or `failed`
    pub status: String,
    /// Per-phase reports as serialized JSON
    pub phases_json: String,
}

// ============================================================================
// SNAPSHOT ROW
// ============================================================================

/// One live memory as seen by the consolidation pipeline: identity,
/// embedding, and the fields decay/clustering need. Loaded in a single
/// reader pass so each phase works on a consistent snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub created_at: f64,
    pub memory_type: Option<String>,
    pub tags: Vec<String>,
    pub pinned: bool,
    pub archived: bool,
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// The storage engine
pub struct MemoryStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    encoder: Arc<dyn Encoder>,
    config: StoreConfig,
    retry: RetryPolicy,
    db_path: PathBuf,
    opened_at: Instant,
    /// Monotonic guard over the wall clock so timestamp pairs never go
    /// backwards within a process
    last_clock: Mutex<f64>,
    #[cfg(feature = "vector-search")]
    vector_index: Mutex<crate::search::VectorIndex>,
}

impl MemoryStore {
    /// Apply pragmas to a connection
    fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = {};
             PRAGMA cache_size = {};
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;",
            config.busy_timeout_ms, config.cache_size_pages,
        ))?;

        for (pragma, value) in &config.pragmas {
            conn.pragma_update(None, pragma, value)?;
        }

        Ok(())
    }

    /// Open (creating if absent) the store at the configured path
    pub fn open(config: StoreConfig, encoder: Arc<dyn Encoder>) -> Result<Self> {
        let db_path = config.resolve_db_path()?;

        let writer = Connection::open(&db_path)?;
        Self::configure_connection(&writer, &config)?;
        migrations::apply_migrations(&writer)?;

        Self::validate_store_meta(&writer, &config, encoder.as_ref())?;

        let reader = Connection::open(&db_path)?;
        Self::configure_connection(&reader, &config)?;

        #[cfg(feature = "vector-search")]
        let vector_index = {
            let index = crate::search::VectorIndex::new(config.dimension)
                .map_err(|e| StorageError::Init(format!("vector index: {e}")))?;
            Mutex::new(index)
        };

        let store = Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            encoder,
            config,
            retry: RetryPolicy::default(),
            db_path,
            opened_at: Instant::now(),
            last_clock: Mutex::new(0.0),
            #[cfg(feature = "vector-search")]
            vector_index,
        };

        #[cfg(feature = "vector-search")]
        store.load_embeddings_into_index()?;

        Ok(store)
    }

    /// Validate (or stamp, on a fresh store) dimension, model identifier,
    /// and schema version in `store_meta`
    fn validate_store_meta(
        conn: &Connection,
        config: &StoreConfig,
        encoder: &dyn Encoder,
    ) -> Result<()> {
        if encoder.dimension() != config.dimension {
            return Err(StorageError::IncompatibleStore(format!(
                "encoder dimension {} disagrees with configured dimension {}",
                encoder.dimension(),
                config.dimension
            )));
        }

        let get = |key: &str| -> rusqlite::Result<Option<String>> {
            conn.query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        };

        match get(META_DIMENSION)? {
            None => {
                let ts = Timestamp::now();
                conn.execute(
                    "INSERT OR REPLACE INTO store_meta (key, value) VALUES
                     (?1, ?2), (?3, ?4), (?5, ?6), (?7, ?8)",
                    params![
                        META_DIMENSION,
                        config.dimension.to_string(),
                        META_MODEL,
                        encoder.model_identifier(),
                        META_SCHEMA,
                        migrations::LATEST_VERSION.to_string(),
                        META_CREATED,
                        ts.iso,
                    ],
                )?;
            }
            Some(stored) => {
                let stored_dim: usize = stored.parse().map_err(|_| {
                    StorageError::Corrupted(format!("unparseable stored dimension {stored:?}"))
                })?;
                if stored_dim != config.dimension {
                    return Err(StorageError::IncompatibleStore(format!(
                        "store was created with dimension {stored_dim}, configured {}",
                        config.dimension
                    )));
                }
                let stored_model = get(META_MODEL)?.unwrap_or_default();
                let model = encoder.model_identifier();
                if stored_model != model {
                    return Err(StorageError::IncompatibleStore(format!(
                        "store embeddings were produced by {stored_model:?}, encoder is {model:?}"
                    )));
                }
                // Keep the stamped schema version current after migrations
                conn.execute(
                    "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
                    params![META_SCHEMA, migrations::LATEST_VERSION.to_string()],
                )?;
            }
        }

        Ok(())
    }

    #[cfg(feature = "vector-search")]
    fn load_embeddings_into_index(&self) -> Result<()> {
        let rows: Vec<(String, Vec<u8>)> = {
            let reader = self.read_conn()?;
            let mut stmt = reader.prepare("SELECT content_hash, embedding FROM memories")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| StorageError::Init("vector index lock poisoned".to_string()))?;
        for (hash, blob) in rows {
            match decode_vector(&blob, self.config.dimension) {
                Ok(vector) => {
                    if let Err(e) = index.add(&hash, &vector) {
                        tracing::warn!("failed to index embedding for {hash}: {e}");
                    }
                }
                Err(e) => tracing::warn!("skipping undecodable embedding for {hash}: {e}"),
            }
        }
        Ok(())
    }

    /// The configured embedding dimension
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// The encoder's model identifier
    pub fn model_identifier(&self) -> String {
        self.encoder.model_identifier()
    }

    /// Engine configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Path of the database file
    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    fn read_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("reader lock poisoned".to_string()))
    }

    fn write_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("writer lock poisoned".to_string()))
    }

    /// Monotonic-safe wall-clock pair: never goes backwards within the
    /// process, so `created_at <= updated_at` holds across mutations even
    /// under clock adjustment.
    pub(crate) fn now_pair(&self) -> Timestamp {
        let wall = Timestamp::now().epoch;
        let mut last = match self.last_clock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let epoch = if wall > *last { wall } else { *last + 1e-6 };
        *last = epoch;
        Timestamp::from_epoch(epoch)
    }

    // ========================================================================
    // CORE OPERATIONS
    // ========================================================================

    /// Store a new memory. Duplicate content (by hash) is a no-op reported
    /// as `success = false, reason = "duplicate"`.
    pub fn store(
        &self,
        content: &str,
        tags: &[String],
        memory_type: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Result<StoreOutcome> {
        self.store_bounded(content, tags, memory_type, metadata, &OpBudget::unbounded())
    }

    /// `store` with a deadline/cancellation budget
    pub fn store_bounded(
        &self,
        content: &str,
        tags: &[String],
        memory_type: Option<&str>,
        metadata: Map<String, Value>,
        budget: &OpBudget,
    ) -> Result<StoreOutcome> {
        if content.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "content must not be empty".to_string(),
            ));
        }
        let tags = normalize_tags(tags);
        for tag in &tags {
            if tag.chars().count() > MAX_TAG_LEN {
                return Err(StorageError::InvalidInput(format!(
                    "tag exceeds {MAX_TAG_LEN} characters: {tag:?}"
                )));
            }
        }

        let hash = content_hash(content);
        if self.get_by_hash(&hash)?.is_some() {
            return Ok(StoreOutcome::duplicate(hash));
        }

        budget.check("store")?;
        let vector = self.encoder.embed(content)?;
        if vector.len() != self.config.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        let vector = crate::embeddings::validate_embedding(vector, self.config.dimension)?;

        budget.check("store")?;
        let ts = self.now_pair();
        let blob = encode_vector(&vector);
        let tags_csv = tags_to_csv(&tags);
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| StorageError::InvalidInput(format!("unserializable metadata: {e}")))?;

        let insert = {
            let writer = self.write_conn()?;
            run_with_retry(&self.retry, || {
                writer.execute(
                    "INSERT INTO memories (
                        content_hash, content, tags, memory_type, metadata,
                        created_at, created_at_iso, updated_at, updated_at_iso, embedding
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        hash,
                        content,
                        tags_csv,
                        memory_type,
                        metadata_json,
                        ts.epoch,
                        ts.iso,
                        ts.epoch,
                        ts.iso,
                        blob,
                    ],
                )
            })
            .map_err(StorageError::from_retry)
        };

        match insert {
            Ok(_) => {}
            // Another writer stored the same content between our existence
            // check and the insert; that is still a duplicate, not an error
            Err(e) if is_unique_violation(&e) => return Ok(StoreOutcome::duplicate(hash)),
            Err(e) => return Err(e),
        }

        #[cfg(feature = "vector-search")]
        if let Ok(mut index) = self.vector_index.lock() {
            if let Err(e) = index.add(&hash, &vector) {
                tracing::warn!("failed to index new memory {hash}: {e}");
            }
        }

        let memory = self
            .get_by_hash(&hash)?
            .ok_or_else(|| StorageError::NotFound(hash.clone()))?;
        Ok(StoreOutcome::created(memory))
    }

    /// Fetch one memory by content hash
    pub fn get_by_hash(&self, hash: &str) -> Result<Option<Memory>> {
        validate_hash(hash)?;
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare("SELECT * FROM memories WHERE content_hash = ?1")?;
        let memory = stmt
            .query_row(params![hash], Self::row_to_memory)
            .optional()?;
        Ok(memory)
    }

    /// Fetch the stored embedding for a memory
    pub fn get_embedding(&self, hash: &str) -> Result<Option<Vec<f32>>> {
        validate_hash(hash)?;
        let blob: Option<Vec<u8>> = {
            let reader = self.read_conn()?;
            reader
                .query_row(
                    "SELECT embedding FROM memories WHERE content_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?
        };
        blob.map(|b| {
            decode_vector(&b, self.config.dimension)
                .map_err(|e| StorageError::Corrupted(e.to_string()))
        })
        .transpose()
    }

    /// Semantic retrieval: exact cosine top-n by batched linear scan over
    /// live (non-archived) memories. Results are ordered by similarity
    /// descending, ties broken by `created_at` descending.
    pub fn retrieve(&self, query: &str, n: usize) -> Result<Vec<RetrievedMemory>> {
        self.retrieve_bounded(query, n, &OpBudget::unbounded())
    }

    /// `retrieve` with a deadline/cancellation budget, checked once per
    /// scanned batch
    pub fn retrieve_bounded(
        &self,
        query: &str,
        n: usize,
        budget: &OpBudget,
    ) -> Result<Vec<RetrievedMemory>> {
        if query.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }
        if n == 0 {
            return Ok(vec![]);
        }

        let query_vec = self.encoder.embed(query)?;
        if query_vec.len() != self.config.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.config.dimension,
                actual: query_vec.len(),
            });
        }

        #[cfg(feature = "vector-search")]
        if let Some(results) = self.retrieve_via_index(&query_vec, n)? {
            return Ok(results);
        }

        let top = self.scan_top_n(&query_vec, n, budget)?;

        let mut results = Vec::with_capacity(top.len());
        for candidate in top {
            if let Some(memory) = self.get_by_hash(&candidate.hash)? {
                results.push(RetrievedMemory {
                    memory,
                    relevance_score: (candidate.score + 1.0) / 2.0,
                });
            }
        }
        Ok(results)
    }

    /// Linear scan over live embeddings, keeping the top n candidates
    fn scan_top_n(&self, query_vec: &[f32], n: usize, budget: &OpBudget) -> Result<Vec<Candidate>> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(n + 1);
        {
            let reader = self.read_conn()?;
            let mut stmt = reader.prepare(&format!(
                "SELECT content_hash, created_at, embedding FROM memories WHERE {NOT_ARCHIVED}"
            ))?;
            let mut rows = stmt.query([])?;
            let mut scanned: usize = 0;

            while let Some(row) = rows.next()? {
                if scanned % self.config.scan_batch_size.max(1) == 0 {
                    budget.check("retrieve")?;
                }
                scanned += 1;

                let hash: String = row.get(0)?;
                let created_at: f64 = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                let vector = decode_vector(&blob, self.config.dimension)
                    .map_err(|e| StorageError::Corrupted(format!("memory {hash}: {e}")))?;

                let score = cosine_similarity(query_vec, &vector);
                heap.push(Reverse(Candidate {
                    score,
                    created_at,
                    hash,
                }));
                if heap.len() > n {
                    heap.pop();
                }
            }
        }

        let mut top: Vec<Candidate> = heap.into_iter().map(|r| r.0).collect();
        top.sort_by(|a, b| b.cmp(a));
        Ok(top)
    }

    #[cfg(feature = "vector-search")]
    fn retrieve_via_index(
        &self,
        query_vec: &[f32],
        n: usize,
    ) -> Result<Option<Vec<RetrievedMemory>>> {
        let index = self
            .vector_index
            .lock()
            .map_err(|_| StorageError::Init("vector index lock poisoned".to_string()))?;
        if index.is_empty() {
            return Ok(None);
        }
        // Overfetch so archived rows filtered below cannot shrink the page
        let hits = index
            .search(query_vec, n.saturating_mul(2).max(n + 8))
            .map_err(|e| StorageError::Init(format!("vector search failed: {e}")))?;
        drop(index);

        let mut results = Vec::with_capacity(n);
        for (hash, similarity) in hits {
            if results.len() >= n {
                break;
            }
            if let Some(memory) = self.get_by_hash(&hash)? {
                if memory.is_archived() {
                    continue;
                }
                results.push(RetrievedMemory {
                    memory,
                    relevance_score: (similarity + 1.0) / 2.0,
                });
            }
        }
        Ok(Some(results))
    }

    /// Tag search. AND requires every query tag; OR requires any.
    /// Comparison is case-sensitive on trimmed tags. Archived memories are
    /// included — the archive partition is reachable through its tag.
    pub fn search_by_tag(&self, tags: &[String], mode: TagMode) -> Result<Vec<Memory>> {
        let tags = normalize_tags(tags);
        if tags.is_empty() {
            return Err(StorageError::InvalidInput(
                "tag search requires at least one tag".to_string(),
            ));
        }

        let clause = tags
            .iter()
            .map(|_| "instr(',' || tags || ',', ',' || ? || ',') > 0")
            .collect::<Vec<_>>()
            .join(match mode {
                TagMode::And => " AND ",
                TagMode::Or => " OR ",
            });

        let sql = format!(
            "SELECT * FROM memories WHERE ({clause}) ORDER BY created_at DESC"
        );

        let reader = self.read_conn()?;
        let mut stmt = reader.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            tags.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), Self::row_to_memory)?;

        let mut memories = Vec::new();
        for row in rows {
            memories.push(row?);
        }
        Ok(memories)
    }

    /// Recall live memories whose creation time falls inside a
    /// natural-language time window, newest first
    pub fn recall_by_time(&self, expression: &str, limit: Option<usize>) -> Result<Vec<Memory>> {
        let range = parse_time_expression(expression)?;
        self.recall_in_range(range, limit)
    }

    /// Recall against an already-resolved range
    pub fn recall_in_range(&self, range: TimeRange, limit: Option<usize>) -> Result<Vec<Memory>> {
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT * FROM memories
             WHERE created_at >= ?1 AND created_at < ?2 AND {NOT_ARCHIVED}
             ORDER BY created_at DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![range.start, range.end, limit], Self::row_to_memory)?;

        let mut memories = Vec::new();
        for row in rows {
            memories.push(row?);
        }
        Ok(memories)
    }

    /// Delete one memory and every artifact row referencing it, atomically.
    /// Returns whether a row was deleted.
    pub fn delete(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        let owned = hash.to_string();
        let deleted = self.delete_all_cascading(std::slice::from_ref(&owned))?;
        Ok(deleted > 0)
    }

    /// Delete every memory matching a tag filter; returns the count
    pub fn delete_by_tag(&self, tags: &[String], mode: TagMode) -> Result<usize> {
        let hashes: Vec<String> = self
            .search_by_tag(tags, mode)?
            .into_iter()
            .map(|m| m.content_hash)
            .collect();
        if hashes.is_empty() {
            return Ok(0);
        }
        self.delete_all_cascading(&hashes)
    }

    /// Single-transaction cascading delete across memories and artifacts
    fn delete_all_cascading(&self, hashes: &[String]) -> Result<usize> {
        let deleted = {
            let mut writer = self.write_conn()?;
            let conn: &mut Connection = &mut writer;
            run_with_retry(&self.retry, move || {
                let tx = conn.transaction()?;
                let mut deleted = 0usize;
                for hash in hashes {
                    deleted +=
                        tx.execute("DELETE FROM memories WHERE content_hash = ?1", [hash])?;
                    tx.execute(
                        "DELETE FROM associations WHERE source_hash = ?1 OR target_hash = ?1",
                        [hash],
                    )?;
                    tx.execute("DELETE FROM cluster_members WHERE content_hash = ?1", [hash])?;
                    tx.execute("DELETE FROM decay_scores WHERE content_hash = ?1", [hash])?;
                }
                tx.commit()?;
                Ok(deleted)
            })
            .map_err(StorageError::from_retry)?
        };

        #[cfg(feature = "vector-search")]
        if let Ok(mut index) = self.vector_index.lock() {
            for hash in hashes {
                let _ = index.remove(hash);
            }
        }

        Ok(deleted)
    }

    /// Merge a metadata patch into a memory.
    ///
    /// Addressed patch keys: `tags` (array, replaced wholesale),
    /// `memory_type` (string or null), `metadata` (object, merged).
    /// Any other key is merged directly into the metadata map. `content`,
    /// `content_hash`, and the timestamps are immutable and ignored.
    /// Sets `updated_at`; `created_at` is preserved.
    pub fn update_metadata(&self, hash: &str, patch: &Map<String, Value>) -> Result<Memory> {
        let existing = self
            .get_by_hash(hash)?
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;

        let mut tags = existing.tags.clone();
        let mut memory_type = existing.memory_type.clone();
        let mut metadata = existing.metadata.clone();

        for (key, value) in patch {
            match key.as_str() {
                "tags" => match value {
                    Value::Array(items) => {
                        let replacement: Vec<String> = items
                            .iter()
                            .map(|v| {
                                v.as_str().map(str::to_string).ok_or_else(|| {
                                    StorageError::InvalidInput(
                                        "tags patch must be an array of strings".to_string(),
                                    )
                                })
                            })
                            .collect::<Result<_>>()?;
                        tags = normalize_tags(replacement);
                    }
                    _ => {
                        return Err(StorageError::InvalidInput(
                            "tags patch must be an array of strings".to_string(),
                        ))
                    }
                },
                "memory_type" => {
                    memory_type = match value {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        _ => {
                            return Err(StorageError::InvalidInput(
                                "memory_type patch must be a string or null".to_string(),
                            ))
                        }
                    };
                }
                "metadata" => match value {
                    Value::Object(map) => {
                        for (k, v) in map {
                            metadata.insert(k.clone(), v.clone());
                        }
                    }
                    _ => {
                        return Err(StorageError::InvalidInput(
                            "metadata patch must be an object".to_string(),
                        ))
                    }
                },
                "content" | "content_hash" | "created_at" | "created_at_iso" | "updated_at"
                | "updated_at_iso" => {
                    tracing::warn!("ignoring immutable field {key:?} in metadata patch");
                }
                other => {
                    metadata.insert(other.to_string(), value.clone());
                }
            }
        }

        let ts = self.now_pair();
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| StorageError::InvalidInput(format!("unserializable metadata: {e}")))?;
        let tags_csv = tags_to_csv(&tags);

        {
            let writer = self.write_conn()?;
            run_with_retry(&self.retry, || {
                writer.execute(
                    "UPDATE memories SET tags = ?1, memory_type = ?2, metadata = ?3,
                         updated_at = ?4, updated_at_iso = ?5
                     WHERE content_hash = ?6",
                    params![tags_csv, memory_type, metadata_json, ts.epoch, ts.iso, hash],
                )
            })
            .map_err(StorageError::from_retry)?;
        }

        self.get_by_hash(hash)?
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    /// Total number of memories (archived included)
    pub fn count(&self) -> Result<i64> {
        let reader = self.read_conn()?;
        Ok(reader.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?)
    }

    /// Newest-first page over live memories
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Memory>> {
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT * FROM memories WHERE {NOT_ARCHIVED}
             ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_memory)?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(row?);
        }
        Ok(memories)
    }

    /// Distinct tag inventory with usage counts
    pub fn all_tags(&self) -> Result<BTreeMap<String, usize>> {
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare("SELECT tags FROM memories")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for csv in rows {
            for tag in tags_from_csv(&csv?) {
                *counts.entry(tag).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// The `health` operation
    pub fn health(&self) -> Result<HealthReport> {
        let total = self.count()?;
        let unique_tags = self.all_tags()?.len();
        Ok(HealthReport {
            status: "healthy".to_string(),
            total_memories: total,
            db_size_bytes: self.db_size_bytes(),
            unique_tags,
            dimension: self.config.dimension,
            model: self.encoder.model_identifier(),
            schema_version: migrations::LATEST_VERSION,
            uptime_seconds: self.opened_at.elapsed().as_secs(),
        })
    }

    /// The `stats` operation: expanded counters
    pub fn stats(&self) -> Result<MemoryStats> {
        let reader = self.read_conn()?;

        let total: i64 = reader.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
        let archived: i64 = reader.query_row(
            &format!("SELECT COUNT(*) FROM memories WHERE NOT ({NOT_ARCHIVED})"),
            [],
            |r| r.get(0),
        )?;
        let summaries: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE memory_type = ?1",
            params![SUMMARY_TYPE],
            |r| r.get(0),
        )?;
        let associations: i64 =
            reader.query_row("SELECT COUNT(*) FROM associations", [], |r| r.get(0))?;
        let clusters: i64 = reader.query_row("SELECT COUNT(*) FROM clusters", [], |r| r.get(0))?;

        let mut by_type: BTreeMap<String, i64> = BTreeMap::new();
        {
            let mut stmt = reader.prepare(
                "SELECT COALESCE(memory_type, ''), COUNT(*) FROM memories GROUP BY memory_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (t, c) = row?;
                by_type.insert(t, c);
            }
        }

        let oldest: Option<f64> = reader
            .query_row("SELECT MIN(created_at) FROM memories", [], |r| r.get(0))
            .ok()
            .flatten();
        let newest: Option<f64> = reader
            .query_row("SELECT MAX(created_at) FROM memories", [], |r| r.get(0))
            .ok()
            .flatten();
        drop(reader);

        Ok(MemoryStats {
            total_memories: total,
            archived_memories: archived,
            summary_memories: summaries,
            live_memories: total - archived,
            associations,
            clusters,
            memories_by_type: by_type,
            unique_tags: self.all_tags()?.len(),
            db_size_bytes: self.db_size_bytes(),
            oldest_memory: oldest,
            newest_memory: newest,
        })
    }

    fn db_size_bytes(&self) -> u64 {
        let main = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        let wal = std::fs::metadata(self.db_path.with_extension("db-wal"))
            .map(|m| m.len())
            .unwrap_or(0);
        main + wal
    }

    /// Database-level maintenance: vacuum + analyze, plus a rebuild of the
    /// auxiliary index when one is enabled. Returns the elapsed time.
    pub fn optimize(&self) -> Result<std::time::Duration> {
        let started = Instant::now();
        {
            let writer = self.write_conn()?;
            run_with_retry(&self.retry, || {
                writer.execute_batch("PRAGMA optimize; ANALYZE; VACUUM;")
            })
            .map_err(StorageError::from_retry)?;
        }

        #[cfg(feature = "vector-search")]
        {
            let mut index = self
                .vector_index
                .lock()
                .map_err(|_| StorageError::Init("vector index lock poisoned".to_string()))?;
            index.clear();
            drop(index);
            self.load_embeddings_into_index()?;
        }

        Ok(started.elapsed())
    }

    // ========================================================================
    // STORE META
    // ========================================================================

    /// Read a `store_meta` value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let reader = self.read_conn()?;
        Ok(reader
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Write a `store_meta` value
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let writer = self.write_conn()?;
        run_with_retry(&self.retry, || {
            writer.execute(
                "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
        })
        .map_err(StorageError::from_retry)?;
        Ok(())
    }

    /// Remove a `store_meta` key
    pub fn delete_meta(&self, key: &str) -> Result<()> {
        let writer = self.write_conn()?;
        run_with_retry(&self.retry, || {
            writer.execute("DELETE FROM store_meta WHERE key = ?1", [key])
        })
        .map_err(StorageError::from_retry)?;
        Ok(())
    }

    /// Insert a meta key only if absent; the database's own atomicity makes
    /// this a cross-process lock primitive
    pub fn try_insert_meta(&self, key: &str, value: &str) -> Result<bool> {
        let writer = self.write_conn()?;
        let changed = run_with_retry(&self.retry, || {
            writer.execute(
                "INSERT OR IGNORE INTO store_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
        })
        .map_err(StorageError::from_retry)?;
        Ok(changed > 0)
    }

    /// Compare-and-swap a meta value; used for stale lock takeover
    pub fn compare_and_swap_meta(&self, key: &str, expected: &str, new: &str) -> Result<bool> {
        let writer = self.write_conn()?;
        let changed = run_with_retry(&self.retry, || {
            writer.execute(
                "UPDATE store_meta SET value = ?1 WHERE key = ?2 AND value = ?3",
                params![new, key, expected],
            )
        })
        .map_err(StorageError::from_retry)?;
        Ok(changed > 0)
    }

    // ========================================================================
    // CONSOLIDATION SUPPORT
    // ========================================================================

    /// Load the consolidation working set in one reader pass
    pub fn load_snapshot(&self, include_archived: bool) -> Result<Vec<SnapshotRow>> {
        let sql = if include_archived {
            "SELECT content_hash, embedding, created_at, memory_type, tags, metadata FROM memories"
                .to_string()
        } else {
            format!(
                "SELECT content_hash, embedding, created_at, memory_type, tags, metadata
                 FROM memories WHERE {NOT_ARCHIVED}"
            )
        };

        let reader = self.read_conn()?;
        let mut stmt = reader.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        let mut snapshot = Vec::new();
        while let Some(row) = rows.next()? {
            let hash: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let created_at: f64 = row.get(2)?;
            let memory_type: Option<String> = row.get(3)?;
            let tags_csv: String = row.get(4)?;
            let metadata_json: String = row.get(5)?;

            let embedding = decode_vector(&blob, self.config.dimension)
                .map_err(|e| StorageError::Corrupted(format!("memory {hash}: {e}")))?;
            let metadata: Map<String, Value> =
                serde_json::from_str(&metadata_json).unwrap_or_default();
            let tags = tags_from_csv(&tags_csv);

            snapshot.push(SnapshotRow {
                pinned: metadata
                    .get(PINNED_KEY)
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                archived: tags.iter().any(|t| t == ARCHIVED_TAG),
                content_hash: hash,
                embedding,
                created_at,
                memory_type,
                tags,
            });
        }
        Ok(snapshot)
    }

    /// Replace the transient decay score cache in one transaction
    pub fn replace_decay_scores(&self, scores: &[(String, f64)], computed_at: f64) -> Result<()> {
        let mut writer = self.write_conn()?;
        let conn: &mut Connection = &mut writer;
        run_with_retry(&self.retry, move || {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM decay_scores", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO decay_scores (content_hash, score, computed_at)
                     VALUES (?1, ?2, ?3)",
                )?;
                for (hash, score) in scores {
                    stmt.execute(params![hash, score, computed_at])?;
                }
            }
            tx.commit()
        })
        .map_err(StorageError::from_retry)?;
        Ok(())
    }

    /// Read the cached decay scores
    pub fn decay_scores(&self) -> Result<std::collections::HashMap<String, f64>> {
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare("SELECT content_hash, score FROM decay_scores")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut scores = std::collections::HashMap::new();
        for row in rows {
            let (hash, score): (String, f64) = row?;
            scores.insert(hash, score);
        }
        Ok(scores)
    }

    /// Insert or refresh an association pair. Returns true when the pair
    /// was new.
    pub fn upsert_association(&self, association: &Association) -> Result<bool> {
        let writer = self.write_conn()?;
        let existed: bool = writer
            .query_row(
                "SELECT 1 FROM associations WHERE source_hash = ?1 AND target_hash = ?2",
                params![association.source_hash, association.target_hash],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        run_with_retry(&self.retry, || {
            writer.execute(
                "INSERT INTO associations (source_hash, target_hash, similarity, discovered_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_hash, target_hash)
                 DO UPDATE SET similarity = excluded.similarity,
                               discovered_at = excluded.discovered_at",
                params![
                    association.source_hash,
                    association.target_hash,
                    association.similarity,
                    association.discovered_at,
                ],
            )
        })
        .map_err(StorageError::from_retry)?;
        Ok(!existed)
    }

    /// All stored associations, newest first
    pub fn associations(&self) -> Result<Vec<Association>> {
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare(
            "SELECT source_hash, target_hash, similarity, discovered_at
             FROM associations ORDER BY discovered_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Association {
                source_hash: row.get(0)?,
                target_hash: row.get(1)?,
                similarity: row.get(2)?,
                discovered_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Atomically replace all cluster artifacts with this run's output
    pub fn replace_clusters(&self, clusters: &[Cluster]) -> Result<()> {
        let mut writer = self.write_conn()?;
        let conn: &mut Connection = &mut writer;
        run_with_retry(&self.retry, move || {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM cluster_members", [])?;
            tx.execute("DELETE FROM clusters", [])?;
            {
                let mut insert_cluster = tx.prepare(
                    "INSERT INTO clusters (cluster_id, theme, centroid, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                let mut insert_member = tx.prepare(
                    "INSERT INTO cluster_members (cluster_id, content_hash, position)
                     VALUES (?1, ?2, ?3)",
                )?;
                for cluster in clusters {
                    insert_cluster.execute(params![
                        cluster.cluster_id,
                        cluster.theme,
                        encode_vector(&cluster.centroid),
                        cluster.created_at,
                    ])?;
                    for (position, hash) in cluster.member_hashes.iter().enumerate() {
                        insert_member.execute(params![
                            cluster.cluster_id,
                            hash,
                            position as i64,
                        ])?;
                    }
                }
            }
            tx.commit()
        })
        .map_err(StorageError::from_retry)?;
        Ok(())
    }

    /// Load all clusters with their ordered members
    pub fn clusters(&self) -> Result<Vec<Cluster>> {
        let reader = self.read_conn()?;
        let mut stmt = reader
            .prepare("SELECT cluster_id, theme, centroid, created_at FROM clusters")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut clusters = Vec::new();
        for row in rows {
            let (cluster_id, theme, blob, created_at) = row?;
            let centroid = decode_vector(&blob, self.config.dimension)
                .map_err(|e| StorageError::Corrupted(format!("cluster {cluster_id}: {e}")))?;

            let mut member_stmt = reader.prepare(
                "SELECT content_hash FROM cluster_members
                 WHERE cluster_id = ?1 ORDER BY position",
            )?;
            let members = member_stmt
                .query_map([&cluster_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            clusters.push(Cluster {
                cluster_id,
                theme,
                centroid,
                member_hashes: members,
                created_at,
            });
        }
        Ok(clusters)
    }

    /// Purge association and cluster artifacts older than the cutoff.
    /// Returns (associations, clusters) removed.
    pub fn purge_artifacts_before(&self, cutoff_epoch: f64) -> Result<(usize, usize)> {
        let mut writer = self.write_conn()?;
        let conn: &mut Connection = &mut writer;
        run_with_retry(&self.retry, move || {
            let tx = conn.transaction()?;
            let associations = tx.execute(
                "DELETE FROM associations WHERE discovered_at < ?1",
                params![cutoff_epoch],
            )?;
            tx.execute(
                "DELETE FROM cluster_members WHERE cluster_id IN
                     (SELECT cluster_id FROM clusters WHERE created_at < ?1)",
                params![cutoff_epoch],
            )?;
            let clusters = tx.execute(
                "DELETE FROM clusters WHERE created_at < ?1",
                params![cutoff_epoch],
            )?;
            tx.commit()?;
            Ok((associations, clusters))
        })
        .map_err(StorageError::from_retry)
    }

    /// All summary memories (live and archived)
    pub fn summaries(&self) -> Result<Vec<Memory>> {
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories WHERE memory_type = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![SUMMARY_TYPE], Self::row_to_memory)?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(row?);
        }
        Ok(memories)
    }

    /// Archive a memory: add the `archived` tag and stamp `archived_at`.
    /// The row is retained; default retrieval excludes it. Returns false
    /// when the memory was already archived or does not exist.
    pub fn archive_memory(&self, hash: &str, now: f64) -> Result<bool> {
        let Some(memory) = self.get_by_hash(hash)? else {
            return Ok(false);
        };
        if memory.is_archived() {
            return Ok(false);
        }

        let mut patch = Map::new();
        let mut tags: Vec<Value> = memory.tags.iter().map(|t| Value::from(t.clone())).collect();
        tags.push(Value::from(ARCHIVED_TAG));
        patch.insert("tags".to_string(), Value::Array(tags));
        patch.insert(ARCHIVED_AT_KEY.to_string(), Value::from(now));
        self.update_metadata(hash, &patch)?;
        Ok(true)
    }

    /// Hard-delete archived memories whose archival predates the cutoff.
    /// Returns the number purged.
    pub fn purge_archived_before(&self, cutoff_epoch: f64) -> Result<usize> {
        let archived = self.search_by_tag(&[ARCHIVED_TAG.to_string()], TagMode::And)?;
        let expired: Vec<String> = archived
            .into_iter()
            .filter(|m| m.archived_at().is_some_and(|at| at < cutoff_epoch))
            .map(|m| m.content_hash)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        self.delete_all_cascading(&expired)
    }

    /// Open a consolidation run record; returns its row id
    pub fn begin_run_record(&self, started_at: f64) -> Result<i64> {
        let writer = self.write_conn()?;
        run_with_retry(&self.retry, || {
            writer.execute(
                "INSERT INTO consolidation_runs (started_at, status) VALUES (?1, 'running')",
                params![started_at],
            )?;
            Ok(writer.last_insert_rowid())
        })
        .map_err(StorageError::from_retry)
    }

    /// Close a consolidation run record with its per-phase stats JSON
    pub fn finish_run_record(
        &self,
        run_id: i64,
        finished_at: f64,
        status: &str,
        phases_json: &str,
    ) -> Result<()> {
        let writer = self.write_conn()?;
        run_with_retry(&self.retry, || {
            writer.execute(
                "UPDATE consolidation_runs
                 SET finished_at = ?1, status = ?2, phases = ?3
                 WHERE id = ?4",
                params![finished_at, status, phases_json, run_id],
            )
        })
        .map_err(StorageError::from_retry)?;
        Ok(())
    }

    /// Most recent consolidation runs, newest first
    pub fn recent_consolidation_runs(&self, limit: usize) -> Result<Vec<ConsolidationRunRecord>> {
        let reader = self.read_conn()?;
        let mut stmt = reader.prepare(
            "SELECT id, started_at, finished_at, status, phases
             FROM consolidation_runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ConsolidationRunRecord {
                id: row.get(0)?,
                started_at: row.get(1)?,
                finished_at: row.get(2)?,
                status: row.get(3)?,
                phases_json: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    // ========================================================================
    // ROW MAPPING
    // ========================================================================

    fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
        let tags_csv: String = row.get("tags")?;
        let metadata_json: String = row.get("metadata")?;
        let metadata: Map<String, Value> = serde_json::from_str(&metadata_json).unwrap_or_default();

        Ok(Memory {
            content: row.get("content")?,
            content_hash: row.get("content_hash")?,
            tags: tags_from_csv(&tags_csv),
            memory_type: row.get("memory_type")?,
            metadata,
            created_at: row.get("created_at")?,
            created_at_iso: row.get("created_at_iso")?,
            updated_at: row.get("updated_at")?,
            updated_at_iso: row.get("updated_at_iso")?,
        })
    }
}

/// A 64-char lowercase hex string is the only accepted hash shape
fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(StorageError::InvalidInput(format!(
            "malformed content hash: {hash:?}"
        )))
    }
}

/// Scan candidate ordered by (score, created_at); both descending when
/// sorted with `sort_by(|a, b| b.cmp(a))`
#[derive(Debug, Clone)]
struct Candidate {
    score: f32,
    created_at: f64,
    hash: String,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.created_at == other.created_at
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.created_at.total_cmp(&other.created_at))
    }
}

// ============================================================================
// TESTS
// ============================================================================
