//! HNSW vector index (USearch)
//!
//! Approximate nearest neighbor over the same vectors the database holds,
//! keyed by content hash. Kept consistent with the `memories` table on
//! every store and delete; rebuilt wholesale during `optimize`.

use std::collections::HashMap;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// HNSW connectivity parameter
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// Expansion factor while building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// Expansion factor while searching
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Vector search error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    #[error("index creation failed: {0}")]
    IndexCreation(String),
    #[error("failed to add vector: {0}")]
    IndexAdd(String),
    #[error("search failed: {0}")]
    IndexSearch(String),
    #[error("invalid dimensions: expected {expected}, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },
}

/// Configuration for the HNSW index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
}

impl VectorIndexConfig {
    pub fn for_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

/// Content-hash-keyed HNSW index
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    /// Create an empty index for the store's dimension
    pub fn new(dimensions: usize) -> Result<Self, VectorSearchError> {
        Self::with_config(VectorIndexConfig::for_dimensions(dimensions))
    }

    /// Create with explicit HNSW parameters
    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    /// Add or replace a vector under a content hash
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }

        if let Some(&existing) = self.key_to_id.get(key) {
            self.index
                .remove(existing)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.reserve_for_one()?;
            return self
                .index
                .add(existing, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()));
        }

        self.reserve_for_one()?;
        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    // usearch requires reserve() before add() to avoid faults
    fn reserve_for_one(&mut self) -> Result<(), VectorSearchError> {
        let capacity = self.index.capacity();
        if self.index.size() >= capacity {
            let next = std::cmp::max(capacity * 2, 16);
            self.index
                .reserve(next)
                .map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        }
        Ok(())
    }

    /// Remove a vector by content hash; returns whether it existed
    pub fn remove(&mut self, key: &str) -> Result<bool, VectorSearchError> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drop all vectors (prior to a rebuild)
    pub fn clear(&mut self) {
        self.key_to_id.clear();
        self.id_to_key.clear();
        if let Ok(replacement) = Self::with_config(self.config.clone()) {
            self.index = replacement.index;
            self.next_id = 0;
        }
    }

    /// Nearest neighbors as (content_hash, cosine similarity), best first
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        let results = self
            .index
            .search(query, limit)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        let mut hits = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(hash) = self.id_to_key.get(key) {
                // Cosine distance -> similarity
                hits.push((hash.clone(), (1.0 - distance).clamp(-1.0, 1.0)));
            }
        }
        Ok(hits)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_vector(dim: usize, seed: f32) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim)
            .map(|i| ((i as f32 + seed) / dim as f32).sin())
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    #[test]
    fn test_add_search_remove() {
        let mut index = VectorIndex::new(32).unwrap();
        let a = unit_vector(32, 1.0);
        let b = unit_vector(32, 50.0);

        index.add("hash-a", &a).unwrap();
        index.add("hash-b", &b).unwrap();
        assert_eq!(index.len(), 2);

        let hits = index.search(&a, 2).unwrap();
        assert_eq!(hits[0].0, "hash-a");
        assert!(hits[0].1 > hits[1].1);

        assert!(index.remove("hash-a").unwrap());
        assert!(!index.contains("hash-a"));
        assert!(!index.remove("hash-a").unwrap());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = VectorIndex::new(32).unwrap();
        assert!(index.add("k", &[1.0, 2.0]).is_err());
        assert!(index.search(&[1.0, 2.0], 5).is_err());
    }

    #[test]
    fn test_clear_resets() {
        let mut index = VectorIndex::new(16).unwrap();
        index.add("k", &unit_vector(16, 3.0)).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert!(index.search(&unit_vector(16, 3.0), 5).unwrap().is_empty());
    }
}
