//! unimem Embeddings Library
//!
//! An [`EmbeddingService`] backed by fastembed's local ONNX models.

use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use unimem_core::{Embedding, EmbeddingService, Error, HashingEmbedder, Result};

/// Model ids this service can load, with their output dimension.
const MODELS: &[(&str, fastembed::EmbeddingModel, usize)] = &[
    (
        "sentence-transformers/all-MiniLM-L6-v2",
        fastembed::EmbeddingModel::AllMiniLML6V2,
        384,
    ),
    (
        "BAAI/bge-small-en-v1.5",
        fastembed::EmbeddingModel::BGESmallENV15,
        384,
    ),
    (
        "BAAI/bge-base-en-v1.5",
        fastembed::EmbeddingModel::BGEBaseENV15,
        768,
    ),
    (
        "nomic-ai/nomic-embed-text-v1.5",
        fastembed::EmbeddingModel::NomicEmbedTextV15,
        768,
    ),
];

/// Default model id.
pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

type Model = Arc<Mutex<fastembed::TextEmbedding>>;

/// Embedding service using fastembed.
///
/// Models are loaded on first use and kept for the life of the service.
/// `hashing-<dims>` ids are served by the built-in [`HashingEmbedder`].
pub struct FastEmbedService {
    models: Mutex<HashMap<String, Model>>,
    cache_dir: Option<PathBuf>,
    show_download_progress: bool,
    hashing: HashingEmbedder,
}

impl Default for FastEmbedService {
    fn default() -> Self {
        Self::new()
    }
}

impl FastEmbedService {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            cache_dir: None,
            show_download_progress: true,
            hashing: HashingEmbedder::new(),
        }
    }

    /// Store downloaded model files under `dir`.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_show_download_progress(mut self, show: bool) -> Self {
        self.show_download_progress = show;
        self
    }

    /// Ids of every loadable fastembed model.
    pub fn supported_models() -> impl Iterator<Item = &'static str> {
        MODELS.iter().map(|(id, _, _)| *id)
    }

    fn lookup(model_id: &str) -> Option<(fastembed::EmbeddingModel, usize)> {
        MODELS
            .iter()
            .find(|(id, _, _)| *id == model_id)
            .map(|(_, model, dim)| (model.clone(), *dim))
    }

    fn model(&self, model_id: &str) -> Result<Model> {
        let (kind, _) = Self::lookup(model_id)
            .ok_or_else(|| Error::Embedding(format!("unknown model '{model_id}'")))?;
        let mut models = self
            .models
            .lock()
            .map_err(|e| Error::Embedding(e.to_string()))?;
        if let Some(model) = models.get(model_id) {
            return Ok(model.clone());
        }

        let model = self
            .load(kind, model_id)
            .map_err(|e| Error::Embedding(format!("{e:#}")))?;
        let model = Arc::new(Mutex::new(model));
        models.insert(model_id.to_string(), model.clone());
        Ok(model)
    }

    fn load(
        &self,
        kind: fastembed::EmbeddingModel,
        model_id: &str,
    ) -> anyhow::Result<fastembed::TextEmbedding> {
        let mut options = fastembed::InitOptions::new(kind)
            .with_show_download_progress(self.show_download_progress);
        if let Some(dir) = &self.cache_dir {
            options = options.with_cache_dir(dir.clone());
        }
        let model = fastembed::TextEmbedding::try_new(options)
            .with_context(|| format!("failed to load embedding model '{model_id}'"))?;
        info!(model = %model_id, "embedding model loaded");
        Ok(model)
    }
}

impl EmbeddingService for FastEmbedService {
    fn dimension(&self, model_id: &str) -> Result<usize> {
        if model_id.starts_with(HashingEmbedder::PREFIX) {
            return self.hashing.dimension(model_id);
        }
        Self::lookup(model_id)
            .map(|(_, dim)| dim)
            .ok_or_else(|| Error::Embedding(format!("unknown model '{model_id}'")))
    }

    fn embed(&self, model_id: &str, text: &str) -> Result<Embedding> {
        self.embed_batch(model_id, &[text])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("No embedding generated".to_string()))
    }

    fn embed_batch(&self, model_id: &str, texts: &[&str]) -> Result<Vec<Embedding>> {
        if model_id.starts_with(HashingEmbedder::PREFIX) {
            return self.hashing.embed_batch(model_id, texts);
        }
        let model = self.model(model_id)?;
        let mut model = model.lock().map_err(|e| Error::Embedding(e.to_string()))?;
        let embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::Embedding(e.to_string()))?;

        Ok(embeddings
            .into_iter()
            .map(|vector| Embedding::new(vector, model_id))
            .collect())
    }
}
