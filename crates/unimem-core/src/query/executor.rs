//! Query execution over the three adapters.
//!
//! Components run in index order. Each one computes its own candidates, then
//! intersects them with the ids reachable from every component linking into
//! it. A backward pass over the same links then drops candidates whose only
//! related objects were eliminated later, so every returned object has a
//! qualifying partner along each link.

use super::filter::{FilterOp, RelationalFilter, ID_FIELD};
use super::planner::{Access, ComponentPlan, QueryPlan, QueryPlanner, SimilarityClause};
use super::types::{ComplexQuery, QueryComponent, QueryHit, QueryOptions, QueryResult, SearchInput};
use crate::cancel::{CancelHandle, CancelSignal};
use crate::config::QueryConfig;
use crate::embedding::EmbeddingService;
use crate::error::{Error, Result, StorageError, StorageErrorKind};
use crate::object::{ObjectId, ObjectInstance};
use crate::retry::{retry_storage, RetryConfig};
use crate::schema::SchemaRegistry;
use crate::storage::{Adapters, SearchRequest, SimilarityResult};
use crate::value::Value;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Concurrent adapter reads while following links or hydrating.
const READ_CONCURRENCY: usize = 8;

/// Ids bound per `id IN (..)` filter, well under SQLite's variable limit.
const ID_FILTER_CHUNK: usize = 500;

/// Candidate ids of one component, in ranking order when scored.
#[derive(Debug, Default)]
struct Candidates {
    ids: Vec<ObjectId>,
    scores: HashMap<ObjectId, f32>,
}

impl Candidates {
    fn unscored(ids: Vec<ObjectId>) -> Self {
        Self {
            ids,
            scores: HashMap::new(),
        }
    }

    fn scored(hits: Vec<SimilarityResult>) -> Self {
        let mut candidates = Self::default();
        for hit in hits {
            candidates.scores.insert(hit.id.clone(), hit.score);
            candidates.ids.push(hit.id);
        }
        candidates
    }

    fn retain(&mut self, keep: impl Fn(&ObjectId) -> bool) {
        self.ids.retain(|id| keep(id));
        self.scores.retain(|id, _| keep(id));
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Aborts the deadline watcher when the query finishes.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Cancellation and deadline of one running query, merged into one signal.
struct Interrupt {
    signal: CancelSignal,
    deadline: Option<Instant>,
    _watcher: Option<AbortOnDrop>,
}

impl Interrupt {
    fn new(options: &QueryOptions, default_deadline: Option<Duration>) -> Self {
        let Some(timeout) = options.deadline.or(default_deadline) else {
            return Self {
                signal: options.cancel.clone(),
                deadline: None,
                _watcher: None,
            };
        };

        let deadline = Instant::now() + timeout;
        let (handle, signal) = CancelHandle::pair();
        let caller = options.cancel.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = caller.cancelled() => {}
            }
            handle.cancel();
        });
        Self {
            signal,
            deadline: Some(deadline),
            _watcher: Some(AbortOnDrop(watcher)),
        }
    }

    fn error(&self) -> Error {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Error::query("query deadline exceeded"),
            _ => Error::query("query cancelled"),
        }
    }

    fn check(&self) -> Result<()> {
        if self.signal.is_cancelled() {
            return Err(self.error());
        }
        Ok(())
    }

    fn storage(&self, err: StorageError) -> Error {
        if err.kind == StorageErrorKind::Cancelled {
            return self.error();
        }
        Error::query_storage(err)
    }
}

/// Plans and runs complex queries against one instance.
pub struct QueryExecutor {
    registry: Arc<SchemaRegistry>,
    stores: Adapters,
    embedder: Arc<dyn EmbeddingService>,
    config: QueryConfig,
    retry: RetryConfig,
}

impl QueryExecutor {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        stores: Adapters,
        embedder: Arc<dyn EmbeddingService>,
        config: QueryConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            stores,
            embedder,
            config,
            retry,
        }
    }

    /// Validate `query` against the current schema without touching storage.
    pub fn plan(&self, query: &ComplexQuery) -> Result<QueryPlan> {
        QueryPlanner::plan(&self.registry.snapshot(), query, self.config.strategy)
    }

    pub async fn execute(&self, query: &ComplexQuery, options: QueryOptions) -> Result<QueryResult> {
        let plan = self.plan(query)?;
        self.execute_plan(&plan, options).await
    }

    /// Objects of one type matching every filter, ordered by id.
    pub async fn find_objects(
        &self,
        object_type: &str,
        filters: Vec<RelationalFilter>,
    ) -> Result<Vec<ObjectInstance>> {
        let mut component = QueryComponent::new(object_type);
        component.filters = filters;
        let result = self
            .execute(&ComplexQuery::new(vec![component]), QueryOptions::default())
            .await?;
        Ok(result.objects())
    }

    pub async fn execute_plan(&self, plan: &QueryPlan, options: QueryOptions) -> Result<QueryResult> {
        let interrupt = Interrupt::new(&options, self.config.deadline_ms.map(Duration::from_millis));
        interrupt.check()?;
        tokio::select! {
            res = self.run(plan, &interrupt) => res,
            _ = interrupt.signal.cancelled() => Err(interrupt.error()),
        }
    }

    async fn run(&self, plan: &QueryPlan, interrupt: &Interrupt) -> Result<QueryResult> {
        let count = plan.components.len();
        let mut candidates: Vec<Candidates> = Vec::with_capacity(count);
        // For each linking component: its id -> ids reached in the linked component.
        let mut reached: HashMap<usize, HashMap<ObjectId, Vec<ObjectId>>> = HashMap::new();

        for (index, component) in plan.components.iter().enumerate() {
            let mut own = self.own_candidates(component, interrupt).await?;
            debug!(
                component = index,
                object_type = %component.object_type,
                candidates = own.ids.len(),
                "component evaluated"
            );
            if own.is_empty() {
                return Ok(QueryResult::default());
            }

            for join in &component.joins {
                let from = &candidates[join.from];
                let map = self
                    .follow(&from.ids, &join.relation, join.direction, interrupt)
                    .await?;
                let reachable: HashSet<&ObjectId> = map.values().flatten().collect();
                own.retain(|id| reachable.contains(id));
                debug!(
                    from = join.from,
                    to = index,
                    relation = %join.relation,
                    remaining = own.ids.len(),
                    "link intersected"
                );
                if own.is_empty() {
                    return Ok(QueryResult::default());
                }
                reached.insert(join.from, map);
            }
            candidates.push(own);
        }

        for index in (0..count).rev() {
            for join in &plan.components[index].joins {
                let Some(map) = reached.get(&join.from) else {
                    continue;
                };
                let parent: HashSet<ObjectId> = candidates[index].ids.iter().cloned().collect();
                candidates[join.from].retain(|id| {
                    map.get(id)
                        .is_some_and(|targets| targets.iter().any(|t| parent.contains(t)))
                });
            }
        }

        let result = &plan.components[plan.result];
        let mut chosen = std::mem::take(&mut candidates[plan.result]);
        if result.access.similarity().is_some() {
            let scores = &chosen.scores;
            let score = |id: &ObjectId| scores.get(id).copied().unwrap_or(f32::NEG_INFINITY);
            chosen
                .ids
                .sort_by(|a, b| score(b).total_cmp(&score(a)).then_with(|| a.cmp(b)));
        } else {
            chosen.ids.sort();
        }

        self.hydrate(&result.object_type, chosen, interrupt).await
    }

    async fn own_candidates(
        &self,
        component: &ComponentPlan,
        interrupt: &Interrupt,
    ) -> Result<Candidates> {
        let object_type = component.object_type.as_str();
        match &component.access {
            Access::Scan(filters) => {
                let ids = self.scan(object_type, filters, interrupt).await?;
                Ok(Candidates::unscored(ids))
            }
            Access::Search(search) => {
                let hits = self.search(object_type, search, None, interrupt).await?;
                Ok(Candidates::scored(hits))
            }
            Access::FilterThenSearch { filters, search } => {
                let ids = self.scan(object_type, filters, interrupt).await?;
                if ids.is_empty() {
                    return Ok(Candidates::default());
                }
                let pool = ids.into_iter().collect();
                let hits = self.search(object_type, search, Some(pool), interrupt).await?;
                Ok(Candidates::scored(hits))
            }
            Access::SearchThenFilter { search, filters } => {
                let hits = self.search(object_type, search, None, interrupt).await?;
                if hits.is_empty() {
                    return Ok(Candidates::default());
                }
                let mut passing: HashSet<ObjectId> = HashSet::new();
                for chunk in hits.chunks(ID_FILTER_CHUNK) {
                    let mut narrowed = filters.clone();
                    narrowed.push(RelationalFilter::new(
                        ID_FIELD,
                        FilterOp::In,
                        Value::List(chunk.iter().map(|h| Value::text(h.id.as_str())).collect()),
                    ));
                    passing.extend(self.scan(object_type, &narrowed, interrupt).await?);
                }
                let mut candidates = Candidates::scored(hits);
                candidates.retain(|id| passing.contains(id));
                Ok(candidates)
            }
        }
    }

    async fn scan(
        &self,
        object_type: &str,
        filters: &[RelationalFilter],
        interrupt: &Interrupt,
    ) -> Result<Vec<ObjectId>> {
        interrupt.check()?;
        let relational = &self.stores.relational;
        retry_storage(&self.retry, "scan", || relational.scan(object_type, filters))
            .await
            .map_err(|e| interrupt.storage(e))
    }

    async fn search(
        &self,
        object_type: &str,
        clause: &SimilarityClause,
        restrict_to: Option<HashSet<ObjectId>>,
        interrupt: &Interrupt,
    ) -> Result<Vec<SimilarityResult>> {
        let vector = match &clause.query {
            SearchInput::Vector(vector) => vector.clone(),
            SearchInput::Text(text) => self.embed_query(clause, text).await?,
        };
        interrupt.check()?;

        let request = SearchRequest {
            vector,
            top_k: clause.top_k,
            min_score: clause.min_score,
            restrict_to,
            cancel: interrupt.signal.clone(),
        };
        let vectors = &self.stores.vector;
        let name = clause.embedding.name.as_str();
        retry_storage(&self.retry, "search", || vectors.search(object_type, name, &request))
            .await
            .map_err(|e| interrupt.storage(e))
    }

    async fn embed_query(&self, clause: &SimilarityClause, text: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder.clone();
        let model = clause.embedding.model_id.clone();
        let text = text.to_string();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&model, &text))
            .await
            .map_err(|e| Error::Embedding(format!("embedding task failed: {e}")))??;

        if embedding.vector.len() != clause.embedding.dimension {
            return Err(Error::Embedding(format!(
                "model '{}' produced {} dimensions, '{}.{}' expects {}",
                clause.embedding.model_id,
                embedding.vector.len(),
                clause.embedding.object_type,
                clause.embedding.name,
                clause.embedding.dimension
            )));
        }
        Ok(embedding.vector)
    }

    /// Neighbors of every id over one relation.
    async fn follow(
        &self,
        ids: &[ObjectId],
        relation: &str,
        direction: crate::storage::Direction,
        interrupt: &Interrupt,
    ) -> Result<HashMap<ObjectId, Vec<ObjectId>>> {
        interrupt.check()?;
        let graph = &self.stores.graph;
        stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let reached = retry_storage(&self.retry, "neighbors", || {
                    graph.neighbors(relation, &id, direction)
                })
                .await
                .map_err(|e| interrupt.storage(e))?;
                Ok::<_, Error>((id, reached))
            })
            .buffer_unordered(READ_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn hydrate(
        &self,
        object_type: &str,
        chosen: Candidates,
        interrupt: &Interrupt,
    ) -> Result<QueryResult> {
        interrupt.check()?;
        let relational = &self.stores.relational;
        let scores = &chosen.scores;
        let hits: Vec<Option<QueryHit>> = stream::iter(chosen.ids.iter().cloned())
            .map(|id| async move {
                let properties =
                    retry_storage(&self.retry, "get", || relational.get(object_type, &id))
                        .await
                        .map_err(|e| interrupt.storage(e))?;
                // Deleted between search and hydration.
                Ok::<_, Error>(properties.map(|properties| QueryHit {
                    score: scores.get(&id).copied(),
                    object: ObjectInstance {
                        id: Some(id),
                        object_type: object_type.to_string(),
                        properties,
                    },
                }))
            })
            .buffered(READ_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(QueryResult {
            hits: hits.into_iter().flatten().collect(),
        })
    }
}
