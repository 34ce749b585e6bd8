//! # Remanence Core
//!
//! Persistent semantic memory engine for AI assistants:
//!
//! - **Durable store**: single-file SQLite with WAL journaling, safe to share
//!   across cooperative tasks and across processes
//! - **Semantic retrieval**: unit-norm float32 embeddings stored as compact
//!   blobs, exact cosine top-n by batched linear scan (optional HNSW index
//!   for large stores via the `vector-search` feature)
//! - **Structured retrieval**: tag sets (AND/OR), content hash, and
//!   natural-language time windows ("yesterday", "last week", "2 weeks ago")
//! - **Deduplication**: SHA-256 content hash is the memory identity; storing
//!   the same content twice is a no-op
//! - **Consolidation**: a scheduled five-phase pipeline — exponential decay
//!   scoring, creative association discovery, DBSCAN clustering, extractive
//!   compression into summary memories, and controlled forgetting with an
//!   archival grace window
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use remanence_core::{MemoryService, StoreConfig, StoreRequest};
//!
//! let encoder = std::sync::Arc::new(MyEncoder::new());
//! let service = MemoryService::open(StoreConfig::default(), encoder)?;
//!
//! service.store(StoreRequest::new("The capital of France is Paris.")
//!     .with_tags(["geo", "trivia"]))?;
//!
//! let hits = service.retrieve("capital France", 5)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): compile SQLite from source
//! - `embeddings`: in-repo local encoder backed by fastembed
//! - `vector-search`: auxiliary HNSW index with USearch

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consolidation;
pub mod embeddings;
pub mod memory;
pub mod service;
pub mod storage;

#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
pub mod search;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Memory types
pub use memory::{
    content_hash, normalize_tags, HealthReport, Memory, MemoryStats, RetrievedMemory,
    StoreOutcome, TagMode, TimeParseError, TimeRange, Timestamp,
};

// Embeddings
pub use embeddings::{
    cosine_similarity, decode_vector, encode_vector, CachedEncoder, Encoder, EncoderError,
};

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
pub use embeddings::LocalEncoder;

// Storage layer
pub use storage::{ConsolidationRunRecord, MemoryStore, Result, RetryPolicy, StorageError};

// Consolidation
pub use consolidation::{
    ConsolidationError, Consolidator, Phase, PhaseReport, RunReport, Scheduler,
};

// Configuration
pub use config::{
    AssociationConfig, ClusterConfig, CompressionConfig, ConsolidationConfig, ForgettingConfig,
    RetentionTable, ScheduleConfig, StoreConfig, TimeoutConfig,
};

// Facade
pub use service::{
    CancellationToken, DeleteOutcome, MemoryService, OpBudget, OptimizeReport, StoreRequest,
};

// Search (when feature enabled)
#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
pub use search::{VectorIndex, VectorIndexConfig, VectorSearchError};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version stamped into `store_meta` on creation
pub const SCHEMA_VERSION: u32 = storage::migrations::LATEST_VERSION;

/// Default embedding dimension when none is configured
pub use config::DEFAULT_DIMENSION;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        CachedEncoder, CancellationToken, Consolidator, Encoder, HealthReport, Memory,
        MemoryService, MemoryStore, Phase, Result, RetrievedMemory, Scheduler, StorageError,
        StoreConfig, StoreOutcome, StoreRequest, TagMode,
    };
}
