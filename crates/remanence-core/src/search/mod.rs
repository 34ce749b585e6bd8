//! Auxiliary vector search
//!
//! Optional HNSW index used by `retrieve` when the `vector-search` feature
//! is enabled. The batched linear scan over the database remains the
//! baseline and the source of truth; this index is rebuilt from it on open
//! and during `optimize`.

mod vector;

pub use vector::{VectorIndex, VectorIndexConfig, VectorSearchError};
