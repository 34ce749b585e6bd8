//! Encoder adapter
//!
//! The embedding model is an external collaborator. Anything that can turn
//! UTF-8 text into an L2-normalized vector of a fixed dimension plugs in
//! through [`Encoder`]; [`CachedEncoder`] wraps any encoder with an
//! in-process LRU (content -> vector) cache.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use super::codec::cosine_similarity;

/// Default capacity of the (content -> vector) cache
pub const DEFAULT_CACHE_CAPACITY: usize = 500;

/// Encoder-side failure
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncoderError {
    /// The model could not be loaded; fatal on first use
    #[error("embedding model initialization failed: {0}")]
    ModelInit(String),
    /// A single input failed to embed
    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),
    /// Empty or otherwise unusable input
    #[error("invalid encoder input: {0}")]
    InvalidInput(String),
}

/// A pluggable text embedding model.
///
/// Implementations must be deterministic for a given model and return
/// unit-norm vectors whose length equals [`Encoder::dimension`]. The store
/// validates both on every write.
pub trait Encoder: Send + Sync {
    /// Embed a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncoderError>;

    /// Embed a batch; the default implementation loops, real models should
    /// override with true batching
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EncoderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// The fixed output dimension D
    fn dimension(&self) -> usize;

    /// Opaque model identity, stamped into store metadata on creation.
    /// A different identifier means embeddings are no longer comparable.
    fn model_identifier(&self) -> String;
}

impl<T: Encoder + ?Sized> Encoder for std::sync::Arc<T> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        (**self).embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EncoderError> {
        (**self).embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn model_identifier(&self) -> String {
        (**self).model_identifier()
    }
}

/// LRU-caching wrapper around any [`Encoder`]
///
/// The cache is keyed by the exact input text and is per-process. It is
/// only valid for the wrapped model; swapping models means building a new
/// `CachedEncoder`.
pub struct CachedEncoder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Encoder> CachedEncoder<E> {
    /// Wrap an encoder with the default cache capacity
    pub fn new(inner: E) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    /// Wrap an encoder with an explicit cache capacity (minimum 1)
    pub fn with_capacity(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1))
            .unwrap_or_else(|| NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Access the wrapped encoder
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Number of cached entries
    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cache_get(&self, text: &str) -> Option<Vec<f32>> {
        self.cache.lock().ok().and_then(|mut c| c.get(text).cloned())
    }

    fn cache_put(&self, text: &str, vector: Vec<f32>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_string(), vector);
        }
    }
}

impl<E: Encoder> Encoder for CachedEncoder<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        if let Some(cached) = self.cache_get(text) {
            return Ok(cached);
        }
        let vector = self.inner.embed(text)?;
        self.cache_put(text, vector.clone());
        Ok(vector)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EncoderError> {
        // Embed only the misses, preserving input order
        let mut results: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.cache_get(t)).collect();
        let misses: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
            .collect();

        if !misses.is_empty() {
            let miss_texts: Vec<&str> = misses.iter().map(|&i| texts[i]).collect();
            let embedded = self.inner.embed_batch(&miss_texts)?;
            if embedded.len() != miss_texts.len() {
                return Err(EncoderError::EmbeddingFailed(format!(
                    "batch returned {} vectors for {} inputs",
                    embedded.len(),
                    miss_texts.len()
                )));
            }
            for (&index, vector) in misses.iter().zip(embedded) {
                self.cache_put(texts[index], vector.clone());
                results[index] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_identifier(&self) -> String {
        self.inner.model_identifier()
    }
}

/// Validate an encoder output against the declared dimension and unit norm.
/// Returns the vector unchanged on success.
pub(crate) fn validate_embedding(
    vector: Vec<f32>,
    dimension: usize,
) -> Result<Vec<f32>, EncoderError> {
    if vector.len() != dimension {
        return Err(EncoderError::EmbeddingFailed(format!(
            "encoder returned {} dimensions, store declares {}",
            vector.len(),
            dimension
        )));
    }
    let norm = cosine_similarity(&vector, &vector);
    // cosine(v, v) is 1 for any non-zero vector; a zero vector scores 0
    if norm == 0.0 {
        return Err(EncoderError::EmbeddingFailed(
            "encoder returned a zero vector".to_string(),
        ));
    }
    Ok(vector)
}

// ============================================================================
// TESTS
// ============================================================================
