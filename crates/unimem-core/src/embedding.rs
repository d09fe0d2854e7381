//! Embedding contract and the built-in hashing model.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// The vector data
    pub vector: Vec<f32>,
    /// Model used to generate this embedding
    pub model_id: String,
    /// Dimensions
    pub dimensions: usize,
}

impl Embedding {
    pub fn new(vector: Vec<f32>, model_id: impl Into<String>) -> Self {
        let dimensions = vector.len();
        Self {
            vector,
            model_id: model_id.into(),
            dimensions,
        }
    }

    /// Cosine similarity in `[-1, 1]`; 0.0 for mismatched or zero vectors.
    pub fn cosine_similarity(&self, other: &[f32]) -> f32 {
        cosine_similarity(&self.vector, other)
    }
}

/// Cosine similarity of two raw vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// External service turning text into vectors.
///
/// Calls block; implementations that talk to remote models should apply
/// their own timeouts.
pub trait EmbeddingService: Send + Sync {
    /// Resolve a model identifier to its output dimension.
    fn dimension(&self, model_id: &str) -> Result<usize>;

    /// Generate embedding for a single text.
    fn embed(&self, model_id: &str, text: &str) -> Result<Embedding>;

    /// Generate embeddings for multiple texts, in input order.
    fn embed_batch(&self, model_id: &str, texts: &[&str]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed(model_id, t)).collect()
    }
}

/// Deterministic feature-hashing embedder.
///
/// Serves the model family `hashing-<dims>` (e.g. `hashing-256`). Texts that
/// share words land close together, which is enough for offline use and tests.
#[derive(Debug, Clone, Default)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub const PREFIX: &'static str = "hashing-";

    pub fn new() -> Self {
        Self
    }

    fn parse_dims(model_id: &str) -> Option<usize> {
        model_id
            .strip_prefix(Self::PREFIX)
            .and_then(|d| d.parse::<usize>().ok())
            .filter(|d| (1..=4096).contains(d))
    }

    fn hash_text(text: &str, dims: usize) -> Vec<f32> {
        let mut vector = vec![0.0f32; dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(idx_bytes) % dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl EmbeddingService for HashingEmbedder {
    fn dimension(&self, model_id: &str) -> Result<usize> {
        Self::parse_dims(model_id)
            .ok_or_else(|| Error::Embedding(format!("unknown model '{model_id}'")))
    }

    fn embed(&self, model_id: &str, text: &str) -> Result<Embedding> {
        let dims = self.dimension(model_id)?;
        Ok(Embedding::new(Self::hash_text(text, dims), model_id))
    }
}
