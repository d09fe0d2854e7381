//! Adapter contracts toward the three storage engines.

use crate::cancel::CancelSignal;
use crate::content_hash::ContentHash;
use crate::embedding::Embedding;
use crate::error::StorageResult;
use crate::object::{ObjectId, PropertyMap, RelationId};
use crate::query::RelationalFilter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Write-concurrency contract an engine exposes upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Only one writer may be active at a time.
    pub single_writer: bool,
}

impl EngineCapabilities {
    pub const SINGLE_WRITER: Self = Self { single_writer: true };
    pub const CONCURRENT_WRITERS: Self = Self { single_writer: false };
}

/// A stored vector together with the fingerprint of its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub embedding: Embedding,
    pub source_hash: Option<ContentHash>,
}

/// Result of a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub id: ObjectId,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

/// Parameters of a k-NN search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub top_k: usize,
    /// Drop results scoring below this value
    pub min_score: Option<f32>,
    /// Only consider these ids when set
    pub restrict_to: Option<HashSet<ObjectId>>,
    pub cancel: CancelSignal,
}

/// Edge traversal direction relative to the starting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Follow edges where the node is the source
    Outgoing,
    /// Follow edges where the node is the target
    Incoming,
}

/// An edge as stored by the graph engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: RelationId,
    pub relation_type: String,
    pub source: ObjectId,
    pub target: ObjectId,
    #[serde(default)]
    pub properties: PropertyMap,
}

/// System of record for object properties.
#[async_trait]
pub trait RelationalAdapter: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities;

    /// Insert or replace the properties of `id`.
    async fn put(&self, object_type: &str, id: &ObjectId, properties: &PropertyMap)
        -> StorageResult<()>;

    async fn get(&self, object_type: &str, id: &ObjectId) -> StorageResult<Option<PropertyMap>>;

    /// Delete a record; `NotFound` when it does not exist.
    async fn delete(&self, object_type: &str, id: &ObjectId) -> StorageResult<()>;

    /// Ids of `object_type` matching every filter, ascending.
    async fn scan(
        &self,
        object_type: &str,
        filters: &[RelationalFilter],
    ) -> StorageResult<Vec<ObjectId>>;

    /// The user-defined type an id belongs to, if any.
    async fn lookup_type(&self, id: &ObjectId) -> StorageResult<Option<String>>;

    async fn count(&self, object_type: &str) -> StorageResult<usize>;
}

/// Vector storage and similarity search.
#[async_trait]
pub trait VectorAdapter: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities;

    async fn upsert(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
        vector: &StoredVector,
    ) -> StorageResult<()>;

    async fn get(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
    ) -> StorageResult<Option<StoredVector>>;

    /// Delete a vector; `NotFound` when it does not exist.
    async fn delete(&self, object_type: &str, embedding_name: &str, id: &ObjectId)
        -> StorageResult<()>;

    /// Ranked by score descending, ties by id ascending, at most `top_k` entries.
    async fn search(
        &self,
        object_type: &str,
        embedding_name: &str,
        request: &SearchRequest,
    ) -> StorageResult<Vec<SimilarityResult>>;

    /// Remove every vector of one embedding; returns how many were removed.
    async fn purge(&self, object_type: &str, embedding_name: &str) -> StorageResult<usize>;
}

/// Graph storage for object existence and typed edges.
#[async_trait]
pub trait GraphAdapter: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities;

    /// Register a node; idempotent.
    async fn upsert_node(&self, object_type: &str, id: &ObjectId) -> StorageResult<()>;

    async fn has_node(&self, id: &ObjectId) -> StorageResult<bool>;

    /// Delete a node; `NotFound` when absent. Edges are left alone.
    async fn delete_node(&self, id: &ObjectId) -> StorageResult<()>;

    async fn upsert_edge(&self, edge: &EdgeRecord) -> StorageResult<()>;

    async fn get_edge(&self, id: &RelationId) -> StorageResult<Option<EdgeRecord>>;

    /// Delete an edge; `NotFound` when absent.
    async fn delete_edge(&self, id: &RelationId) -> StorageResult<()>;

    /// Every edge with `id` as source or target.
    async fn incident_edges(&self, id: &ObjectId) -> StorageResult<Vec<EdgeRecord>>;

    /// Ids of every edge of one relation type, ascending.
    async fn edges_of_type(&self, relation_type: &str) -> StorageResult<Vec<RelationId>>;

    /// Ids reachable from `id` over one `relation_type` edge in `direction`, ascending.
    async fn neighbors(
        &self,
        relation_type: &str,
        id: &ObjectId,
        direction: Direction,
    ) -> StorageResult<Vec<ObjectId>>;
}
