//! Local encoder backed by fastembed (ONNX inference)
//!
//! The default in-repo [`Encoder`] implementation: all-MiniLM-L6-v2,
//! 384 dimensions, L2-normalized output. The model is loaded lazily on
//! first use and shared process-wide; load failure is fatal for every
//! subsequent call.

use std::sync::{Mutex, MutexGuard, OnceLock};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::codec::normalize_in_place;
use super::encoder::{Encoder, EncoderError};

/// Output dimension of all-MiniLM-L6-v2
pub const LOCAL_DIMENSIONS: usize = 384;

/// Model identifier stamped into store metadata
pub const LOCAL_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Maximum input length in bytes; longer inputs are truncated on a char
/// boundary before embedding
const MAX_TEXT_LENGTH: usize = 8192;

/// Batch size for embed_batch
const BATCH_SIZE: usize = 32;

static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj) = directories::ProjectDirs::from("io", "remanence", "remanence") {
        return proj.cache_dir().join("fastembed");
    }
    std::path::PathBuf::from(".fastembed_cache")
}

fn model() -> Result<MutexGuard<'static, TextEmbedding>, EncoderError> {
    let result = MODEL.get_or_init(|| {
        let cache = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache) {
            tracing::warn!("failed to create model cache directory {:?}: {}", cache, e);
        }
        let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false)
            .with_cache_dir(cache);
        TextEmbedding::try_new(options)
            .map(Mutex::new)
            .map_err(|e| format!("failed to initialize all-MiniLM-L6-v2: {e}"))
    });

    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EncoderError::ModelInit(format!("model lock poisoned: {e}"))),
        Err(err) => Err(EncoderError::ModelInit(err.clone())),
    }
}

fn truncate_on_char_boundary(text: &str) -> &str {
    if text.len() <= MAX_TEXT_LENGTH {
        return text;
    }
    let mut end = MAX_TEXT_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// fastembed-backed local encoder
#[derive(Debug, Default)]
pub struct LocalEncoder {
    _private: (),
}

impl LocalEncoder {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Force model initialization, surfacing download/load errors early
    pub fn init(&self) -> Result<(), EncoderError> {
        model().map(|_| ())
    }
}

impl Encoder for LocalEncoder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        if text.is_empty() {
            return Err(EncoderError::InvalidInput("text cannot be empty".to_string()));
        }
        let mut model = model()?;
        let embeddings = model
            .embed(vec![truncate_on_char_boundary(text)], None)
            .map_err(|e| EncoderError::EmbeddingFailed(e.to_string()))?;
        let mut vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncoderError::EmbeddingFailed("no embedding generated".to_string()))?;
        normalize_in_place(&mut vector);
        Ok(vector)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EncoderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let mut model = model()?;
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            let truncated: Vec<&str> = chunk
                .iter()
                .map(|t| truncate_on_char_boundary(t))
                .collect();
            let embeddings = model
                .embed(truncated, None)
                .map_err(|e| EncoderError::EmbeddingFailed(e.to_string()))?;
            for mut vector in embeddings {
                normalize_in_place(&mut vector);
                all.push(vector);
            }
        }
        Ok(all)
    }

    fn dimension(&self) -> usize {
        LOCAL_DIMENSIONS
    }

    fn model_identifier(&self) -> String {
        LOCAL_MODEL_ID.to_string()
    }
}
