//! Vector codec
//!
//! Embeddings are stored as little-endian float32 concatenations, so a
//! D-dimensional vector occupies exactly 4·D bytes. Vectors are unit-norm
//! at rest, which makes cosine similarity a plain dot product.

/// Codec failure: blob length does not match the expected dimension
#[derive(Debug, Clone, thiserror::Error)]
#[error("embedding blob of {actual_bytes} bytes does not decode to {dimension} dimensions")]
pub struct VectorCodecError {
    pub dimension: usize,
    pub actual_bytes: usize,
}

/// Serialize a vector to its little-endian float32 byte string
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserialize a blob back into a vector of the declared dimension
pub fn decode_vector(bytes: &[u8], dimension: usize) -> Result<Vec<f32>, VectorCodecError> {
    if bytes.len() != dimension * 4 {
        return Err(VectorCodecError {
            dimension,
            actual_bytes: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Cosine similarity, clamped to [-1, 1].
///
/// For unit-norm inputs this is the dot product; the full quotient is
/// computed anyway so denormalized vectors still score sensibly.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        (dot / denominator).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// L2-normalize a vector in place; zero vectors are left untouched
#[inline]
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
