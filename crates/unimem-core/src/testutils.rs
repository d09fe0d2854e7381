//! Test utilities for unimem.
//!
//! Provides reusable fixtures, a seeded library schema, and adapter wrappers
//! that count calls or inject failures.

use crate::coordinator::WriteCoordinator;
use crate::embedding::{Embedding, EmbeddingService, HashingEmbedder};
use crate::error::{Engine, Result, StorageError, StorageResult};
use crate::object::{ObjectId, ObjectInstance, PropertyMap, RelationId, RelationInstance};
use crate::query::RelationalFilter;
use crate::retry::RetryConfig;
use crate::schema::{
    EmbeddingSpec, ObjectTypeDefinition, PropertyDefinition, RelationTypeDefinition,
    SchemaRegistry,
};
use crate::storage::{
    Direction, EdgeRecord, EngineCapabilities, GraphAdapter, RelationalAdapter, SearchRequest,
    SimilarityResult, StoredVector, VectorAdapter,
};
use crate::value::SemanticType;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Embedding model used by the library fixtures.
pub const MODEL: &str = "hashing-64";

/// Test fixture for creating sample instances.
pub struct TestFixtures;

impl TestFixtures {
    pub fn book(id: &str, title: &str, year: i64) -> ObjectInstance {
        ObjectInstance::new("Book")
            .with_id(id)
            .with("title", title)
            .with("year", year)
    }

    pub fn author(id: &str, name: &str) -> ObjectInstance {
        ObjectInstance::new("Author").with_id(id).with("name", name)
    }

    pub fn written_by(id: &str, book: &str, author: &str) -> RelationInstance {
        RelationInstance::new("WRITTEN_BY", book, author).with_id(id)
    }
}

/// `Book{title, year}`, `Author{name}`, `WRITTEN_BY(Book -> Author)`,
/// `REVIEWED(Author -> Book){stars}` and an embedding on `Book.title`.
pub async fn library_registry(store: Arc<dyn RelationalAdapter>) -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::load(store, RetryConfig::none())
        .await
        .expect("load registry");
    define_library(&registry).await.expect("define library schema");
    Arc::new(registry)
}

pub async fn define_library(registry: &SchemaRegistry) -> Result<()> {
    registry
        .define_object_type(ObjectTypeDefinition::new(
            "Book",
            vec![
                PropertyDefinition::new("title", SemanticType::Text),
                PropertyDefinition::new("year", SemanticType::Integer),
            ],
        ))
        .await?;
    registry
        .define_object_type(ObjectTypeDefinition::new(
            "Author",
            vec![PropertyDefinition::new("name", SemanticType::Text)],
        ))
        .await?;
    registry
        .define_relation_type(RelationTypeDefinition::new("WRITTEN_BY", "Book", "Author"))
        .await?;
    registry
        .define_relation_type(
            RelationTypeDefinition::new("REVIEWED", "Author", "Book").with_properties(vec![
                PropertyDefinition::new("stars", SemanticType::Integer),
            ]),
        )
        .await?;
    registry
        .define_embedding(EmbeddingSpec::new("Book", "title", MODEL), &HashingEmbedder::new())
        .await?;
    Ok(())
}

/// Two authors, four books, three authorship edges.
///
/// `A1 "X"` wrote `B1 "Y" (2000)`; `A2 "Ursula"` wrote `B2` and `B3`; `B4` has no author.
pub async fn seed_library(coordinator: &WriteCoordinator) {
    let objects = vec![
        TestFixtures::author("A1", "X"),
        TestFixtures::author("A2", "Ursula"),
        TestFixtures::book("B1", "Y", 2000),
        TestFixtures::book("B2", "the dispossessed anarchist moon", 1974),
        TestFixtures::book("B3", "a wizard of earthsea", 1968),
        TestFixtures::book("B4", "dune desert planet", 1965),
    ];
    coordinator.upsert_objects(objects).await.expect("seed objects");
    for (id, book, author) in [("R1", "B1", "A1"), ("R2", "B2", "A2"), ("R3", "B3", "A2")] {
        coordinator
            .upsert_relation(TestFixtures::written_by(id, book, author))
            .await
            .expect("seed relation");
    }
}

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Transient,
    Permanent,
}

impl Fault {
    fn error(self, engine: Engine) -> StorageError {
        match self {
            Fault::Transient => StorageError::transient(engine, "injected: database is locked"),
            Fault::Permanent => StorageError::permanent(engine, "injected: disk I/O error"),
        }
    }
}

struct Plan {
    fault: Fault,
    skip: usize,
    remaining: usize,
}

/// Decides whether the next call of one operation fails.
#[derive(Default)]
pub struct Trigger {
    plan: Mutex<Option<Plan>>,
}

impl Trigger {
    /// Let `skip` calls through, then fail the next `times` calls.
    pub fn arm(&self, fault: Fault, skip: usize, times: usize) {
        *self.plan.lock().unwrap() = Some(Plan {
            fault,
            skip,
            remaining: times,
        });
    }

    fn check(&self, engine: Engine) -> StorageResult<()> {
        let mut plan = self.plan.lock().unwrap();
        let Some(p) = plan.as_mut() else {
            return Ok(());
        };
        if p.skip > 0 {
            p.skip -= 1;
            return Ok(());
        }
        if p.remaining == 0 {
            return Ok(());
        }
        p.remaining -= 1;
        Err(p.fault.error(engine))
    }
}

/// Graph adapter that fails `upsert_node` or `upsert_edge` on demand, and can
/// stall traversals.
pub struct FaultyGraph {
    inner: Arc<dyn GraphAdapter>,
    upsert_node: Trigger,
    upsert_edge: Trigger,
    stall_neighbors: AtomicBool,
}

impl FaultyGraph {
    pub fn new(inner: Arc<dyn GraphAdapter>) -> Self {
        Self {
            inner,
            upsert_node: Trigger::default(),
            upsert_edge: Trigger::default(),
            stall_neighbors: AtomicBool::new(false),
        }
    }

    pub fn fail_upsert_edge(&self, fault: Fault) {
        self.upsert_edge.arm(fault, 0, usize::MAX);
    }

    /// Make every later `neighbors` call hang until dropped.
    pub fn stall_neighbors(&self) {
        self.stall_neighbors.store(true, Ordering::SeqCst);
    }

    pub fn fail_upsert_node(&self, fault: Fault) {
        self.upsert_node.arm(fault, 0, usize::MAX);
    }

    pub fn fail_upsert_node_times(&self, fault: Fault, times: usize) {
        self.upsert_node.arm(fault, 0, times);
    }

    pub fn fail_upsert_node_after(&self, successes: usize, fault: Fault) {
        self.upsert_node.arm(fault, successes, usize::MAX);
    }
}

#[async_trait]
impl GraphAdapter for FaultyGraph {
    fn capabilities(&self) -> EngineCapabilities {
        self.inner.capabilities()
    }

    async fn upsert_node(&self, object_type: &str, id: &ObjectId) -> StorageResult<()> {
        self.upsert_node.check(Engine::Graph)?;
        self.inner.upsert_node(object_type, id).await
    }

    async fn has_node(&self, id: &ObjectId) -> StorageResult<bool> {
        self.inner.has_node(id).await
    }

    async fn delete_node(&self, id: &ObjectId) -> StorageResult<()> {
        self.inner.delete_node(id).await
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> StorageResult<()> {
        self.upsert_edge.check(Engine::Graph)?;
        self.inner.upsert_edge(edge).await
    }

    async fn get_edge(&self, id: &RelationId) -> StorageResult<Option<EdgeRecord>> {
        self.inner.get_edge(id).await
    }

    async fn delete_edge(&self, id: &RelationId) -> StorageResult<()> {
        self.inner.delete_edge(id).await
    }

    async fn incident_edges(&self, id: &ObjectId) -> StorageResult<Vec<EdgeRecord>> {
        self.inner.incident_edges(id).await
    }

    async fn edges_of_type(&self, relation_type: &str) -> StorageResult<Vec<RelationId>> {
        self.inner.edges_of_type(relation_type).await
    }

    async fn neighbors(
        &self,
        relation_type: &str,
        id: &ObjectId,
        direction: Direction,
    ) -> StorageResult<Vec<ObjectId>> {
        if self.stall_neighbors.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.neighbors(relation_type, id, direction).await
    }
}

/// Vector adapter that fails `upsert`, `delete` or `search` on demand.
pub struct FaultyVector {
    inner: Arc<dyn VectorAdapter>,
    upsert: Trigger,
    delete: Trigger,
    search: Trigger,
}

impl FaultyVector {
    pub fn new(inner: Arc<dyn VectorAdapter>) -> Self {
        Self {
            inner,
            upsert: Trigger::default(),
            delete: Trigger::default(),
            search: Trigger::default(),
        }
    }

    pub fn fail_upsert(&self, fault: Fault) {
        self.upsert.arm(fault, 0, usize::MAX);
    }

    pub fn fail_delete(&self, fault: Fault) {
        self.delete.arm(fault, 0, usize::MAX);
    }

    pub fn fail_search(&self, fault: Fault) {
        self.search.arm(fault, 0, usize::MAX);
    }
}

#[async_trait]
impl VectorAdapter for FaultyVector {
    fn capabilities(&self) -> EngineCapabilities {
        self.inner.capabilities()
    }

    async fn upsert(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
        vector: &StoredVector,
    ) -> StorageResult<()> {
        self.upsert.check(Engine::Vector)?;
        self.inner.upsert(object_type, embedding_name, id, vector).await
    }

    async fn get(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
    ) -> StorageResult<Option<StoredVector>> {
        self.inner.get(object_type, embedding_name, id).await
    }

    async fn delete(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
    ) -> StorageResult<()> {
        self.delete.check(Engine::Vector)?;
        self.inner.delete(object_type, embedding_name, id).await
    }

    async fn search(
        &self,
        object_type: &str,
        embedding_name: &str,
        request: &SearchRequest,
    ) -> StorageResult<Vec<SimilarityResult>> {
        self.search.check(Engine::Vector)?;
        self.inner.search(object_type, embedding_name, request).await
    }

    async fn purge(&self, object_type: &str, embedding_name: &str) -> StorageResult<usize> {
        self.inner.purge(object_type, embedding_name).await
    }
}

/// Counts read calls the query executor makes.
#[derive(Default)]
pub struct CallCounts {
    pub scans: AtomicUsize,
    pub searches: AtomicUsize,
    pub neighbors: AtomicUsize,
}

impl CallCounts {
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn neighbors(&self) -> usize {
        self.neighbors.load(Ordering::SeqCst)
    }
}

/// Relational adapter that counts `scan` calls.
pub struct CountingRelational {
    pub inner: Arc<dyn RelationalAdapter>,
    pub counts: Arc<CallCounts>,
}

#[async_trait]
impl RelationalAdapter for CountingRelational {
    fn capabilities(&self) -> EngineCapabilities {
        self.inner.capabilities()
    }

    async fn put(
        &self,
        object_type: &str,
        id: &ObjectId,
        properties: &PropertyMap,
    ) -> StorageResult<()> {
        self.inner.put(object_type, id, properties).await
    }

    async fn get(&self, object_type: &str, id: &ObjectId) -> StorageResult<Option<PropertyMap>> {
        self.inner.get(object_type, id).await
    }

    async fn delete(&self, object_type: &str, id: &ObjectId) -> StorageResult<()> {
        self.inner.delete(object_type, id).await
    }

    async fn scan(
        &self,
        object_type: &str,
        filters: &[RelationalFilter],
    ) -> StorageResult<Vec<ObjectId>> {
        self.counts.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.scan(object_type, filters).await
    }

    async fn lookup_type(&self, id: &ObjectId) -> StorageResult<Option<String>> {
        self.inner.lookup_type(id).await
    }

    async fn count(&self, object_type: &str) -> StorageResult<usize> {
        self.inner.count(object_type).await
    }
}

/// Vector adapter that counts `search` calls.
pub struct CountingVector {
    pub inner: Arc<dyn VectorAdapter>,
    pub counts: Arc<CallCounts>,
}

#[async_trait]
impl VectorAdapter for CountingVector {
    fn capabilities(&self) -> EngineCapabilities {
        self.inner.capabilities()
    }

    async fn upsert(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
        vector: &StoredVector,
    ) -> StorageResult<()> {
        self.inner.upsert(object_type, embedding_name, id, vector).await
    }

    async fn get(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
    ) -> StorageResult<Option<StoredVector>> {
        self.inner.get(object_type, embedding_name, id).await
    }

    async fn delete(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
    ) -> StorageResult<()> {
        self.inner.delete(object_type, embedding_name, id).await
    }

    async fn search(
        &self,
        object_type: &str,
        embedding_name: &str,
        request: &SearchRequest,
    ) -> StorageResult<Vec<SimilarityResult>> {
        self.counts.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search(object_type, embedding_name, request).await
    }

    async fn purge(&self, object_type: &str, embedding_name: &str) -> StorageResult<usize> {
        self.inner.purge(object_type, embedding_name).await
    }
}

/// Graph adapter that counts `neighbors` calls.
pub struct CountingGraph {
    pub inner: Arc<dyn GraphAdapter>,
    pub counts: Arc<CallCounts>,
}

#[async_trait]
impl GraphAdapter for CountingGraph {
    fn capabilities(&self) -> EngineCapabilities {
        self.inner.capabilities()
    }

    async fn upsert_node(&self, object_type: &str, id: &ObjectId) -> StorageResult<()> {
        self.inner.upsert_node(object_type, id).await
    }

    async fn has_node(&self, id: &ObjectId) -> StorageResult<bool> {
        self.inner.has_node(id).await
    }

    async fn delete_node(&self, id: &ObjectId) -> StorageResult<()> {
        self.inner.delete_node(id).await
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> StorageResult<()> {
        self.inner.upsert_edge(edge).await
    }

    async fn get_edge(&self, id: &RelationId) -> StorageResult<Option<EdgeRecord>> {
        self.inner.get_edge(id).await
    }

    async fn delete_edge(&self, id: &RelationId) -> StorageResult<()> {
        self.inner.delete_edge(id).await
    }

    async fn incident_edges(&self, id: &ObjectId) -> StorageResult<Vec<EdgeRecord>> {
        self.inner.incident_edges(id).await
    }

    async fn edges_of_type(&self, relation_type: &str) -> StorageResult<Vec<RelationId>> {
        self.inner.edges_of_type(relation_type).await
    }

    async fn neighbors(
        &self,
        relation_type: &str,
        id: &ObjectId,
        direction: Direction,
    ) -> StorageResult<Vec<ObjectId>> {
        self.counts.neighbors.fetch_add(1, Ordering::SeqCst);
        self.inner.neighbors(relation_type, id, direction).await
    }
}

/// Wrap every adapter of `stores` with call counters.
pub fn counted(stores: &crate::storage::Adapters) -> (crate::storage::Adapters, Arc<CallCounts>) {
    let counts = Arc::new(CallCounts::default());
    let wrapped = crate::storage::Adapters {
        relational: Arc::new(CountingRelational {
            inner: stores.relational.clone(),
            counts: counts.clone(),
        }),
        vector: Arc::new(CountingVector {
            inner: stores.vector.clone(),
            counts: counts.clone(),
        }),
        graph: Arc::new(CountingGraph {
            inner: stores.graph.clone(),
            counts: counts.clone(),
        }),
    };
    (wrapped, counts)
}

/// Hashing embedder that counts texts and batches it was asked for.
#[derive(Default)]
pub struct CountingEmbedder {
    inner: HashingEmbedder,
    texts: AtomicUsize,
    batches: AtomicUsize,
}

impl CountingEmbedder {
    pub fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

impl EmbeddingService for CountingEmbedder {
    fn dimension(&self, model_id: &str) -> Result<usize> {
        self.inner.dimension(model_id)
    }

    fn embed(&self, model_id: &str, text: &str) -> Result<Embedding> {
        self.texts.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(model_id, text)
    }

    fn embed_batch(&self, model_id: &str, texts: &[&str]) -> Result<Vec<Embedding>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(model_id, texts)
    }
}

/// Embedder whose vectors disagree with the dimension it reports.
pub struct LyingEmbedder;

impl EmbeddingService for LyingEmbedder {
    fn dimension(&self, _model_id: &str) -> Result<usize> {
        Ok(8)
    }

    fn embed(&self, model_id: &str, _text: &str) -> Result<Embedding> {
        Ok(Embedding::new(vec![0.5; 4], model_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_skips_then_fails() {
        let trigger = Trigger::default();
        assert!(trigger.check(Engine::Graph).is_ok());
        trigger.arm(Fault::Transient, 1, 2);
        assert!(trigger.check(Engine::Graph).is_ok());
        assert!(trigger.check(Engine::Graph).unwrap_err().is_transient());
        assert!(trigger.check(Engine::Graph).is_err());
        assert!(trigger.check(Engine::Graph).is_ok());
    }

    #[test]
    fn test_book_fixture() {
        let book = TestFixtures::book("B1", "Dune", 1965);
        assert_eq!(book.id, Some(ObjectId::new("B1")));
        assert_eq!(book.object_type, "Book");
    }
}
