//! Embedding provider seam and vector similarity.
//!
//! The embedding service is an external collaborator; the engine only sees
//! the [`EmbeddingProvider`] trait. [`LexicalEmbedder`] is a deterministic,
//! offline provider using feature hashing over tokens. It is *not* a neural
//! embedding model, but it gives embedded deployments and tests a stable
//! baseline without a network dependency.

use crate::error::EmbeddingError;
use crate::normalize::{normalize, tokens};

/// Default dimensionality of [`LexicalEmbedder`] vectors.
pub const DEFAULT_EMBEDDING_DIM: usize = 64;

/// Text to vector. Implementations must be safe to call from worker threads.
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds one piece of text.
    ///
    /// # Errors
    /// Returns [`EmbeddingError`] when the backing service fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Deterministic lexical embedding provider.
#[derive(Debug, Clone, Copy)]
pub struct LexicalEmbedder {
    dim: usize,
}

impl LexicalEmbedder {
    /// Creates a provider producing vectors of `dim` components.
    #[must_use]
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Output dimensionality.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl EmbeddingProvider for LexicalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.dim == 0 {
            return Err(EmbeddingError::InvalidOutput {
                message: "lexical embedder configured with zero dimensions".to_string(),
            });
        }
        Ok(lexical_embedding_with_dim(text, self.dim))
    }
}

/// Feature-hashed bag of normalized tokens, L2-normalized.
///
/// Each token lands in one of `dim` buckets with a hash-derived sign, so
/// texts sharing tokens point in similar directions. Text with no tokens
/// yields the zero vector.
#[must_use]
pub fn lexical_embedding_with_dim(text: &str, dim: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dim];
    if dim == 0 {
        return vec;
    }

    let normalized = normalize(text);
    for token in tokens(&normalized) {
        let hash = blake3::hash(token.as_bytes());
        let bytes = hash.as_bytes();
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&bytes[..8]);

        #[allow(clippy::cast_possible_truncation)]
        let idx = (u64::from_le_bytes(bucket) % dim as u64) as usize;
        vec[idx] += if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
    }

    let norm = vec.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
    if norm > 0.0 {
        #[allow(clippy::cast_possible_truncation)]
        let inv = norm.recip() as f32;
        vec.iter_mut().for_each(|x| *x *= inv);
    }
    vec
}

/// Cosine similarity of two vectors, computed in `f64`.
///
/// Zero-norm or empty inputs score `0.0`. Returns `None` when the
/// dimensions differ.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |(d, na, nb), (&x, &y)| {
        let (x, y) = (f64::from(x), f64::from(y));
        (d + x * y, na + x * x, nb + y * y)
    });
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return Some(0.0);
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    #[allow(clippy::cast_possible_truncation)]
    Some(if sim.is_finite() { sim as f32 } else { 0.0 })
}
