//! Cross-store writes as an ordered saga with reverse-order compensation.
//!
//! An object write goes Relational -> Vector -> Graph. When a later step fails
//! the steps already applied are undone in reverse order, restoring whatever
//! was there before. If an undo step fails too the caller gets a
//! [`Error::ConsistencyRisk`] naming the store and id left inconsistent.

use crate::content_hash::ContentHash;
use crate::embedding::{Embedding, EmbeddingService};
use crate::error::{Engine, Error, Result, StorageError, StorageResult};
use crate::locks::{object_key, relation_key, LockTable};
use crate::object::{ObjectId, ObjectInstance, PropertyMap, RelationId, RelationInstance};
use crate::retry::{retry_storage, RetryConfig};
use crate::schema::{relation_properties_ns, EmbeddingDefinition, SchemaRegistry, SchemaSnapshot};
use crate::storage::{Adapters, EdgeRecord, EngineCapabilities, StoredVector};
use crate::value::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// How often a write re-validates after a concurrent schema change before giving up.
const MAX_SCHEMA_ATTEMPTS: usize = 3;

/// Bounds concurrent writes per engine according to its capabilities.
struct WriterGates {
    relational: Option<Semaphore>,
    vector: Option<Semaphore>,
    graph: Option<Semaphore>,
}

impl WriterGates {
    fn new(stores: &Adapters) -> Self {
        fn gate(caps: EngineCapabilities) -> Option<Semaphore> {
            caps.single_writer.then(|| Semaphore::new(1))
        }
        Self {
            relational: gate(stores.relational.capabilities()),
            vector: gate(stores.vector.capabilities()),
            graph: gate(stores.graph.capabilities()),
        }
    }

    fn get(&self, engine: Engine) -> Option<&Semaphore> {
        match engine {
            Engine::Relational => self.relational.as_ref(),
            Engine::Vector => self.vector.as_ref(),
            Engine::Graph => self.graph.as_ref(),
        }
    }
}

enum VectorAction {
    /// Stored vector already matches the current text
    Keep,
    /// Source text is now null; drop the stored vector
    Remove,
    /// Needs a fresh embedding of `text`
    Embed { text: String, hash: ContentHash },
    Write(StoredVector),
}

struct VectorPlan {
    definition: EmbeddingDefinition,
    prior: Option<StoredVector>,
    action: VectorAction,
}

/// Everything needed to apply, and undo, one object write.
struct PreparedObject {
    instance: ObjectInstance,
    id: ObjectId,
    prior: Option<PropertyMap>,
    node_existed: bool,
    vectors: Vec<VectorPlan>,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Relational,
    Vector(usize),
    Graph,
}

fn tolerate_missing(result: StorageResult<()>) -> StorageResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Orchestrates object and relation mutations across the three adapters.
pub struct WriteCoordinator {
    registry: Arc<SchemaRegistry>,
    stores: Adapters,
    embedder: Arc<dyn EmbeddingService>,
    retry: RetryConfig,
    locks: LockTable,
    gates: WriterGates,
}

impl WriteCoordinator {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        stores: Adapters,
        embedder: Arc<dyn EmbeddingService>,
        retry: RetryConfig,
    ) -> Self {
        let gates = WriterGates::new(&stores);
        Self {
            registry,
            stores,
            embedder,
            retry,
            locks: LockTable::new(),
            gates,
        }
    }

    /// Insert or replace one object. Returns the stored instance with its id.
    pub async fn upsert_object(&self, instance: ObjectInstance) -> Result<ObjectInstance> {
        let mut stored = self.upsert_objects(vec![instance]).await?;
        stored
            .pop()
            .ok_or_else(|| Error::Validation("empty upsert".to_string()))
    }

    /// Insert or replace a batch of objects, all or nothing.
    ///
    /// Embedding calls are grouped per model across the whole batch.
    pub async fn upsert_objects(&self, instances: Vec<ObjectInstance>) -> Result<Vec<ObjectInstance>> {
        if instances.is_empty() {
            return Ok(Vec::new());
        }

        // Validate everything up front so bad input never touches a store.
        let snapshot = self.registry.snapshot();
        let mut validated = Vec::with_capacity(instances.len());
        let mut seen = HashSet::new();
        for mut instance in instances {
            let def = snapshot.object_type(&instance.object_type).ok_or_else(|| {
                Error::Schema(format!(
                    "object type '{}' is not defined",
                    instance.object_type
                ))
            })?;
            let id = def.validate(&mut instance)?;
            if !seen.insert(id.clone()) {
                return Err(Error::Validation(format!("id '{id}' appears twice in one batch")));
            }
            validated.push(instance);
        }

        let _guards = self
            .locks
            .lock_all(seen.iter().map(|id| object_key(id.as_str())))
            .await;

        let mut snapshot = snapshot;
        let mut attempt = 0;
        let prepared = loop {
            attempt += 1;
            let mut prepared = Vec::with_capacity(validated.len());
            for instance in &validated {
                prepared.push(self.prepare(&snapshot, instance.clone()).await?);
            }
            self.embed_pending(&mut prepared).await?;

            let current = self.registry.snapshot();
            if current.version() == snapshot.version()
                || validated
                    .iter()
                    .all(|i| same_shape(&snapshot, &current, &i.object_type))
            {
                break prepared;
            }
            if attempt >= MAX_SCHEMA_ATTEMPTS {
                return Err(Error::Schema(
                    "schema kept changing while the write was prepared".to_string(),
                ));
            }
            debug!(attempt, "schema changed during write, re-validating");
            snapshot = current;
        };

        let mut completed: Vec<(usize, Vec<Step>)> = Vec::with_capacity(prepared.len());
        for (index, object) in prepared.iter().enumerate() {
            let mut log = Vec::new();
            if let Err(err) = self.apply(object, &mut log).await {
                warn!(
                    id = %object.id,
                    error = %err,
                    rolled_back = completed.len() + 1,
                    "object write failed, compensating"
                );
                let mut risk = self.undo(object, &log, &err).await.err();
                for (done, steps) in completed.iter().rev() {
                    if let Err(e) = self.undo(&prepared[*done], steps, &err).await {
                        risk.get_or_insert(e);
                    }
                }
                return Err(risk.unwrap_or(Error::Storage(err)));
            }
            completed.push((index, log));
        }

        debug!(count = prepared.len(), "objects written");
        Ok(prepared.into_iter().map(|p| p.instance).collect())
    }

    /// Read the current state an upsert has to know about to apply and undo itself.
    async fn prepare(
        &self,
        snapshot: &SchemaSnapshot,
        mut instance: ObjectInstance,
    ) -> Result<PreparedObject> {
        let def = snapshot.object_type(&instance.object_type).ok_or_else(|| {
            Error::Schema(format!(
                "object type '{}' is no longer defined",
                instance.object_type
            ))
        })?;
        let id = def.validate(&mut instance)?;

        let existing = self
            .read("lookup type", || self.stores.relational.lookup_type(&id))
            .await?;
        let prior = match existing {
            Some(other) if other != def.name => {
                return Err(Error::Validation(format!(
                    "id '{id}' already belongs to type '{other}'"
                )))
            }
            Some(_) => {
                self.read("get", || self.stores.relational.get(&def.name, &id))
                    .await?
            }
            None => None,
        };
        let node_existed = self.read("has node", || self.stores.graph.has_node(&id)).await?;

        let mut vectors = Vec::new();
        for emb in snapshot.embeddings_for(&def.name) {
            let stored = self
                .read("get vector", || self.stores.vector.get(&def.name, &emb.name, &id))
                .await?;
            let action = match instance.properties.get(&emb.source_property) {
                Some(Value::Text(text)) => {
                    let hash = ContentHash::of_source(&emb.model_id, text);
                    match &stored {
                        Some(s)
                            if s.source_hash.as_ref() == Some(&hash)
                                && s.embedding.dimensions == emb.dimension =>
                        {
                            VectorAction::Keep
                        }
                        _ => VectorAction::Embed {
                            text: text.clone(),
                            hash,
                        },
                    }
                }
                _ if stored.is_some() => VectorAction::Remove,
                _ => VectorAction::Keep,
            };
            vectors.push(VectorPlan {
                definition: emb.clone(),
                prior: stored,
                action,
            });
        }

        Ok(PreparedObject {
            instance,
            id,
            prior,
            node_existed,
            vectors,
        })
    }

    /// Compute every pending embedding, one batch per model.
    async fn embed_pending(&self, prepared: &mut [PreparedObject]) -> Result<()> {
        let mut by_model: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();
        for (oi, object) in prepared.iter().enumerate() {
            for (vi, plan) in object.vectors.iter().enumerate() {
                if matches!(plan.action, VectorAction::Embed { .. }) {
                    by_model
                        .entry(plan.definition.model_id.clone())
                        .or_default()
                        .push((oi, vi));
                }
            }
        }

        for (model_id, slots) in by_model {
            let texts: Vec<String> = slots
                .iter()
                .filter_map(|&(oi, vi)| match &prepared[oi].vectors[vi].action {
                    VectorAction::Embed { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect();
            let embeddings = self.embed_texts(&model_id, texts).await?;

            for ((oi, vi), embedding) in slots.into_iter().zip(embeddings) {
                let plan = &mut prepared[oi].vectors[vi];
                if embedding.vector.len() != plan.definition.dimension {
                    return Err(Error::Embedding(format!(
                        "model '{}' produced {} dimensions, '{}.{}' expects {}",
                        model_id,
                        embedding.vector.len(),
                        plan.definition.object_type,
                        plan.definition.name,
                        plan.definition.dimension
                    )));
                }
                let hash = match &plan.action {
                    VectorAction::Embed { hash, .. } => hash.clone(),
                    _ => continue,
                };
                plan.action = VectorAction::Write(StoredVector {
                    embedding,
                    source_hash: Some(hash),
                });
            }
        }
        Ok(())
    }

    /// Run the (blocking) embedding service off the async workers.
    async fn embed_texts(&self, model_id: &str, texts: Vec<String>) -> Result<Vec<Embedding>> {
        let expected = texts.len();
        let embedder = self.embedder.clone();
        let model = model_id.to_string();
        debug!(model = %model_id, count = expected, "embedding batch");

        let embeddings = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            embedder.embed_batch(&model, &refs)
        })
        .await
        .map_err(|e| Error::Embedding(format!("embedding task failed: {e}")))??;

        if embeddings.len() != expected {
            return Err(Error::Embedding(format!(
                "model '{model_id}' returned {} vectors for {expected} texts",
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }

    async fn apply(&self, object: &PreparedObject, log: &mut Vec<Step>) -> StorageResult<()> {
        let object_type = object.instance.object_type.as_str();
        let id = &object.id;
        let stores = &self.stores;

        self.write(Engine::Relational, "put", || {
            stores
                .relational
                .put(object_type, id, &object.instance.properties)
        })
        .await?;
        log.push(Step::Relational);

        for (index, plan) in object.vectors.iter().enumerate() {
            let name = plan.definition.name.as_str();
            match &plan.action {
                VectorAction::Keep => {}
                VectorAction::Write(vector) => {
                    self.write(Engine::Vector, "upsert vector", || {
                        stores.vector.upsert(object_type, name, id, vector)
                    })
                    .await?;
                    log.push(Step::Vector(index));
                }
                VectorAction::Remove => {
                    tolerate_missing(
                        self.write(Engine::Vector, "delete vector", || {
                            stores.vector.delete(object_type, name, id)
                        })
                        .await,
                    )?;
                    log.push(Step::Vector(index));
                }
                VectorAction::Embed { .. } => {
                    return Err(StorageError::permanent(
                        Engine::Vector,
                        format!("vector '{name}' for '{id}' was never computed"),
                    ))
                }
            }
        }

        self.write(Engine::Graph, "upsert node", || {
            stores.graph.upsert_node(object_type, id)
        })
        .await?;
        log.push(Step::Graph);
        debug!(%id, object_type, "saga complete");
        Ok(())
    }

    /// Undo `log` in reverse, restoring the state captured by `prepare`.
    async fn undo(&self, object: &PreparedObject, log: &[Step], cause: &StorageError) -> Result<()> {
        let object_type = object.instance.object_type.as_str();
        let id = &object.id;
        let stores = &self.stores;
        let mut first_failure = None;

        for step in log.iter().rev() {
            let outcome = match *step {
                Step::Graph if object.node_existed => Ok(()),
                Step::Graph => tolerate_missing(
                    self.write(Engine::Graph, "compensate node", || stores.graph.delete_node(id))
                        .await,
                ),
                Step::Vector(index) => {
                    let plan = &object.vectors[index];
                    let name = plan.definition.name.as_str();
                    match &plan.prior {
                        Some(prior) => {
                            self.write(Engine::Vector, "restore vector", || {
                                stores.vector.upsert(object_type, name, id, prior)
                            })
                            .await
                        }
                        None => tolerate_missing(
                            self.write(Engine::Vector, "compensate vector", || {
                                stores.vector.delete(object_type, name, id)
                            })
                            .await,
                        ),
                    }
                }
                Step::Relational => match &object.prior {
                    Some(prior) => {
                        self.write(Engine::Relational, "restore properties", || {
                            stores.relational.put(object_type, id, prior)
                        })
                        .await
                    }
                    None => tolerate_missing(
                        self.write(Engine::Relational, "compensate put", || {
                            stores.relational.delete(object_type, id)
                        })
                        .await,
                    ),
                },
            };

            if let Err(e) = outcome {
                error!(
                    %id,
                    store = %e.engine,
                    error = %e,
                    cause = %cause,
                    "compensation failed, stores may disagree"
                );
                first_failure.get_or_insert(Error::ConsistencyRisk {
                    store: e.engine,
                    id: id.to_string(),
                    reason: format!("undoing after '{cause}' failed: {e}"),
                });
            }
        }

        match first_failure {
            Some(risk) => Err(risk),
            None => Ok(()),
        }
    }

    /// Fetch an object by id alone.
    pub async fn get_object(&self, id: &ObjectId) -> Result<ObjectInstance> {
        let object_type = self
            .read("lookup type", || self.stores.relational.lookup_type(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("object '{id}'")))?;
        let properties = self
            .read("get", || self.stores.relational.get(&object_type, id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("object '{id}'")))?;
        Ok(ObjectInstance {
            id: Some(id.clone()),
            object_type,
            properties,
        })
    }

    /// Delete an object and every relation touching it. Deleting a missing id succeeds.
    pub async fn delete_object(&self, id: &ObjectId) -> Result<()> {
        let _guard = self.locks.lock(object_key(id.as_str())).await;
        let stores = &self.stores;
        let object_type = self
            .read("lookup type", || stores.relational.lookup_type(id))
            .await?;
        let mut progressed = false;

        let edges = self.read("incident edges", || stores.graph.incident_edges(id)).await?;
        for edge in &edges {
            self.delete_edge_record(edge, progressed, id).await?;
            progressed = true;
        }

        let node = tolerate_missing(
            self.write(Engine::Graph, "delete node", || stores.graph.delete_node(id))
                .await,
        );
        progressed = self.checkpoint(node, progressed, id)?;

        if let Some(object_type) = &object_type {
            let snapshot = self.registry.snapshot();
            for emb in snapshot.embeddings_for(object_type) {
                let removed = tolerate_missing(
                    self.write(Engine::Vector, "delete vector", || {
                        stores.vector.delete(object_type, &emb.name, id)
                    })
                    .await,
                );
                progressed = self.checkpoint(removed, progressed, id)?;
            }

            let removed = tolerate_missing(
                self.write(Engine::Relational, "delete", || {
                    stores.relational.delete(object_type, id)
                })
                .await,
            );
            self.checkpoint(removed, progressed, id)?;
        }

        if object_type.is_some() || !edges.is_empty() {
            info!(%id, relations = edges.len(), "object deleted");
        }
        Ok(())
    }

    /// Turn a failed destructive step into a consistency risk once earlier steps succeeded.
    fn checkpoint(&self, outcome: StorageResult<()>, progressed: bool, id: &ObjectId) -> Result<bool> {
        match outcome {
            Ok(()) => Ok(true),
            Err(e) if progressed => {
                error!(%id, store = %e.engine, error = %e, "delete left stores inconsistent");
                Err(Error::ConsistencyRisk {
                    store: e.engine,
                    id: id.to_string(),
                    reason: format!("partial delete: {e}"),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_edge_record(&self, edge: &EdgeRecord, progressed: bool, owner: &ObjectId) -> Result<()> {
        let stores = &self.stores;
        let removed = tolerate_missing(
            self.write(Engine::Graph, "delete edge", || stores.graph.delete_edge(&edge.id))
                .await,
        );
        self.checkpoint(removed, progressed, owner)?;

        let ns = relation_properties_ns(&edge.relation_type);
        let edge_id = ObjectId::new(edge.id.as_str());
        let removed = tolerate_missing(
            self.write(Engine::Relational, "delete relation properties", || {
                stores.relational.delete(&ns, &edge_id)
            })
            .await,
        );
        self.checkpoint(removed, true, owner)?;
        Ok(())
    }

    /// Insert or replace a relation between two existing objects.
    pub async fn upsert_relation(&self, instance: RelationInstance) -> Result<RelationInstance> {
        let snapshot = self.registry.snapshot();
        let def = snapshot.relation_type(&instance.relation_type).ok_or_else(|| {
            Error::Validation(format!(
                "relation type '{}' is not defined",
                instance.relation_type
            ))
        })?;
        let mut instance = instance;
        def.validate(&mut instance.properties)?;
        let id = instance.id.clone().unwrap_or_else(RelationId::generate);
        instance.id = Some(id.clone());

        let _guards = self
            .locks
            .lock_all([
                object_key(instance.source.as_str()),
                object_key(instance.target.as_str()),
                relation_key(id.as_str()),
            ])
            .await;
        let stores = &self.stores;

        for (endpoint, expected) in [
            (&instance.source, &def.source_type),
            (&instance.target, &def.target_type),
        ] {
            match self
                .read("lookup type", || stores.relational.lookup_type(endpoint))
                .await?
            {
                Some(actual) if &actual == expected => {}
                Some(actual) => {
                    return Err(Error::Validation(format!(
                        "'{}' expects a {expected} at '{endpoint}', found {actual}",
                        def.name
                    )))
                }
                None => {
                    return Err(Error::Validation(format!(
                        "object '{endpoint}' referenced by '{}' does not exist",
                        def.name
                    )))
                }
            }
        }

        let prior_edge = self.read("get edge", || stores.graph.get_edge(&id)).await?;
        if let Some(prior) = &prior_edge {
            if prior.relation_type != def.name {
                return Err(Error::Validation(format!(
                    "relation '{id}' is a {}, not a {}",
                    prior.relation_type, def.name
                )));
            }
        }

        let ns = relation_properties_ns(&def.name);
        let record_id = ObjectId::new(id.as_str());
        let has_properties = !def.properties.is_empty();
        let prior_props = if has_properties {
            self.read("get relation properties", || stores.relational.get(&ns, &record_id))
                .await?
        } else {
            None
        };

        if has_properties {
            self.write(Engine::Relational, "put relation properties", || {
                stores.relational.put(&ns, &record_id, &instance.properties)
            })
            .await?;
        }

        let edge = EdgeRecord {
            id: id.clone(),
            relation_type: def.name.clone(),
            source: instance.source.clone(),
            target: instance.target.clone(),
            properties: instance.properties.clone(),
        };
        let written = self
            .write(Engine::Graph, "upsert edge", || stores.graph.upsert_edge(&edge))
            .await;

        if let Err(err) = written {
            if has_properties {
                warn!(%id, error = %err, "edge write failed, compensating");
                let undo = match &prior_props {
                    Some(props) => {
                        self.write(Engine::Relational, "restore relation properties", || {
                            stores.relational.put(&ns, &record_id, props)
                        })
                        .await
                    }
                    None => tolerate_missing(
                        self.write(Engine::Relational, "compensate relation properties", || {
                            stores.relational.delete(&ns, &record_id)
                        })
                        .await,
                    ),
                };
                if let Err(e) = undo {
                    error!(%id, store = %e.engine, error = %e, "compensation failed");
                    return Err(Error::ConsistencyRisk {
                        store: e.engine,
                        id: id.to_string(),
                        reason: format!("undoing after '{err}' failed: {e}"),
                    });
                }
            }
            return Err(err.into());
        }

        debug!(%id, relation = %def.name, "relation written");
        Ok(instance)
    }

    pub async fn get_relation(&self, id: &RelationId) -> Result<RelationInstance> {
        let stores = &self.stores;
        let edge = self
            .read("get edge", || stores.graph.get_edge(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("relation '{id}'")))?;

        let ns = relation_properties_ns(&edge.relation_type);
        let record_id = ObjectId::new(id.as_str());
        let properties = self
            .read("get relation properties", || stores.relational.get(&ns, &record_id))
            .await?
            .unwrap_or(edge.properties);

        Ok(RelationInstance {
            id: Some(edge.id),
            relation_type: edge.relation_type,
            source: edge.source,
            target: edge.target,
            properties,
        })
    }

    /// Delete a relation. Deleting a missing id succeeds.
    pub async fn delete_relation(&self, id: &RelationId) -> Result<()> {
        let _guard = self.locks.lock(relation_key(id.as_str())).await;
        let stores = &self.stores;
        let Some(edge) = self.read("get edge", || stores.graph.get_edge(id)).await? else {
            return Ok(());
        };
        let owner = ObjectId::new(id.as_str());
        self.delete_edge_record(&edge, false, &owner).await?;
        debug!(%id, relation = %edge.relation_type, "relation deleted");
        Ok(())
    }

    /// Delete every instance of an object type; returns how many were removed.
    pub async fn delete_objects_of_type(&self, object_type: &str) -> Result<usize> {
        let ids = self
            .read("scan", || self.stores.relational.scan(object_type, &[]))
            .await?;
        for id in &ids {
            self.delete_object(id).await?;
        }
        Ok(ids.len())
    }

    /// Delete every instance of a relation type; returns how many were removed.
    pub async fn delete_relations_of_type(&self, relation_type: &str) -> Result<usize> {
        let ids = self
            .read("edges of type", || self.stores.graph.edges_of_type(relation_type))
            .await?;
        for id in &ids {
            self.delete_relation(id).await?;
        }
        Ok(ids.len())
    }

    async fn write<T, F, Fut>(&self, engine: Engine, what: &str, operation: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let _permit = match self.gates.get(engine) {
            Some(gate) => Some(
                gate.acquire()
                    .await
                    .map_err(|_| StorageError::permanent(engine, "writer gate closed"))?,
            ),
            None => None,
        };
        retry_storage(&self.retry, what, operation).await
    }

    async fn read<T, F, Fut>(&self, what: &str, operation: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        retry_storage(&self.retry, what, operation).await
    }
}

/// Whether the definitions a write of `object_type` depends on are unchanged.
fn same_shape(old: &SchemaSnapshot, new: &SchemaSnapshot, object_type: &str) -> bool {
    old.object_type(object_type) == new.object_type(object_type)
        && old.embeddings_for(object_type) == new.embeddings_for(object_type)
}
