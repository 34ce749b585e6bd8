//! Operation API facade
//!
//! [`MemoryService`] is the surface transports consume: it owns the store
//! handle, the consolidator, and the scheduler, applies the configured
//! per-operation deadlines, and threads cooperative cancellation through
//! long-running work. There is no global state; everything hangs off the
//! handle a caller constructs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::StoreConfig;
use crate::consolidation::{ConsolidationError, Consolidator, Phase, RunReport, Scheduler};
use crate::embeddings::{CachedEncoder, Encoder};
use crate::memory::{
    HealthReport, Memory, MemoryStats, RetrievedMemory, StoreOutcome, TagMode, Timestamp,
};
use crate::storage::{MemoryStore, Result, StorageError};

// ============================================================================
// CANCELLATION AND DEADLINES
// ============================================================================

/// Cooperative cancellation signal, checked at suspension points and
/// between consolidation units. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Deadline + cancellation budget threaded through an operation
#[derive(Debug, Clone, Default)]
pub struct OpBudget {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl OpBudget {
    /// No deadline, no cancellation
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(timeout: Option<Duration>, cancel: Option<CancellationToken>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
        }
    }

    /// Budget with only a deadline
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Some(timeout), None)
    }

    /// Fail with `Timeout` / `Cancelled` when the budget is spent
    pub fn check(&self, operation: &str) -> Result<()> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(StorageError::Cancelled(operation.to_string()));
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(StorageError::Timeout(operation.to_string()));
            }
        }
        Ok(())
    }
}

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Builder-style input for the `store` operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StoreRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tags: vec![],
            memory_type: None,
            metadata: Map::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = Some(memory_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Result of the `delete` operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub success: bool,
    pub deleted: u32,
}

/// Result of the `optimize` operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub ok: bool,
    pub duration_ms: u64,
}

// ============================================================================
// MEMORY SERVICE
// ============================================================================

/// The externally consumed operation surface
pub struct MemoryService {
    store: Arc<MemoryStore>,
    consolidator: Consolidator,
    scheduler: Scheduler,
}

impl MemoryService {
    /// Open the store with an encoder, wrapping it in the configured
    /// (content -> vector) LRU cache
    pub fn open(config: StoreConfig, encoder: Arc<dyn Encoder>) -> Result<Self> {
        let cached = CachedEncoder::with_capacity(encoder, config.encoder_cache_capacity);
        Self::open_with_encoder(config, Arc::new(cached))
    }

    /// Open with an encoder used as-is (no extra caching layer)
    pub fn open_with_encoder(config: StoreConfig, encoder: Arc<dyn Encoder>) -> Result<Self> {
        let consolidation = config.consolidation.clone();
        let schedule = config.schedule.clone();
        let store = Arc::new(MemoryStore::open(config, encoder)?);
        let consolidator = Consolidator::new(Arc::clone(&store), consolidation);
        let scheduler = Scheduler::new(Arc::clone(&store), schedule);
        Ok(Self {
            store,
            consolidator,
            scheduler,
        })
    }

    /// The underlying store handle
    pub fn store_handle(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn budget(&self, secs: u64, cancel: Option<CancellationToken>) -> OpBudget {
        OpBudget::new(Some(Duration::from_secs(secs)), cancel)
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Store a memory (deduplicated by content hash)
    pub fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        self.store_cancellable(request, None)
    }

    /// `store` with an external cancellation signal
    pub fn store_cancellable(
        &self,
        request: StoreRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<StoreOutcome> {
        let budget = self.budget(self.store.config().timeouts.store_secs, cancel);
        self.store.store_bounded(
            &request.content,
            &request.tags,
            request.memory_type.as_deref(),
            request.metadata,
            &budget,
        )
    }

    /// Semantic retrieval, best `n` matches
    pub fn retrieve(&self, query: &str, n: usize) -> Result<Vec<RetrievedMemory>> {
        self.retrieve_cancellable(query, n, None)
    }

    /// `retrieve` with an external cancellation signal
    pub fn retrieve_cancellable(
        &self,
        query: &str,
        n: usize,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<RetrievedMemory>> {
        let budget = self.budget(self.store.config().timeouts.retrieve_secs, cancel);
        self.store.retrieve_bounded(query, n, &budget)
    }

    /// Structured retrieval by tag set
    pub fn search_by_tag(&self, tags: &[String], mode: TagMode) -> Result<Vec<Memory>> {
        self.store.search_by_tag(tags, mode)
    }

    /// Structured retrieval by natural-language time window
    pub fn recall_by_time(&self, expression: &str, n: Option<usize>) -> Result<Vec<Memory>> {
        self.store.recall_by_time(expression, n)
    }

    /// Fetch one memory by content hash
    pub fn get_by_hash(&self, hash: &str) -> Result<Option<Memory>> {
        self.store.get_by_hash(hash)
    }

    /// Delete one memory and its artifact references
    pub fn delete(&self, hash: &str) -> Result<DeleteOutcome> {
        let deleted = self.store.delete(hash)?;
        Ok(DeleteOutcome {
            success: deleted,
            deleted: u32::from(deleted),
        })
    }

    /// Delete all memories matching a tag filter; returns the count
    pub fn delete_by_tag(&self, tags: &[String], mode: TagMode) -> Result<usize> {
        self.store.delete_by_tag(tags, mode)
    }

    /// Merge a metadata patch into a memory
    pub fn update_metadata(&self, hash: &str, patch: &Map<String, Value>) -> Result<Memory> {
        self.store.update_metadata(hash, patch)
    }

    /// Service health summary
    pub fn health(&self) -> Result<HealthReport> {
        self.store.health()
    }

    /// Expanded counters
    pub fn stats(&self) -> Result<MemoryStats> {
        self.store.stats()
    }

    /// Database maintenance: vacuum, analyze, index rebuild
    pub fn optimize(&self) -> Result<OptimizeReport> {
        let elapsed = self.store.optimize()?;
        Ok(OptimizeReport {
            ok: true,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Run consolidation now: one phase, or the full pipeline in order.
    /// Fails with `AlreadyRunning` when another run holds the lock.
    pub fn consolidate(
        &self,
        phase: Option<Phase>,
    ) -> std::result::Result<RunReport, ConsolidationError> {
        self.consolidate_cancellable(phase, None)
    }

    /// `consolidate` with an external cancellation signal
    pub fn consolidate_cancellable(
        &self,
        phase: Option<Phase>,
        cancel: Option<CancellationToken>,
    ) -> std::result::Result<RunReport, ConsolidationError> {
        let phases: Vec<Phase> = match phase {
            Some(p) => vec![p],
            None => Phase::pipeline().to_vec(),
        };
        let budget = self.budget(self.store.config().timeouts.phase_secs, cancel);
        let now = Timestamp::now().epoch;
        self.scheduler
            .run_locked(&self.consolidator, &phases, now, &budget)
    }

    /// Scheduler tick: run whatever cadences have lapsed, coalesced into
    /// one ordered pass. Returns `None` when nothing was due.
    pub fn tick(&self) -> std::result::Result<Option<RunReport>, ConsolidationError> {
        let budget = self.budget(self.store.config().timeouts.phase_secs, None);
        self.scheduler.tick(&self.consolidator, &budget)
    }

    /// Recent consolidation runs, newest first
    pub fn consolidation_history(
        &self,
        limit: usize,
    ) -> Result<Vec<crate::storage::ConsolidationRunRecord>> {
        self.store.recent_consolidation_runs(limit)
    }
}

// ============================================================================
// TESTS
// ============================================================================
