//! Embeddings - vector codec and the encoder adapter
//!
//! The engine never talks to a model directly; it accepts any [`Encoder`]
//! implementation returning L2-normalized float32 vectors of the store's
//! declared dimension. Vectors are persisted as little-endian float32 blobs.

mod codec;
mod encoder;

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
mod local;

pub use codec::{cosine_similarity, decode_vector, encode_vector, normalize_in_place, VectorCodecError};
pub use encoder::{CachedEncoder, Encoder, EncoderError};

pub(crate) use encoder::validate_embedding;

#[cfg(feature = "embeddings")]
pub use local::LocalEncoder;
