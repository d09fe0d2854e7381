//! The public face of one unimem instance.

use crate::config::{InstancePaths, MemoryConfig};
use crate::coordinator::WriteCoordinator;
use crate::embedding::EmbeddingService;
use crate::error::{Engine, Error, Result};
use crate::object::{ObjectId, ObjectInstance, RelationId, RelationInstance};
use crate::query::{ComplexQuery, QueryExecutor, QueryOptions, QueryPlan, QueryResult, RelationalFilter};
use crate::retry::retry_storage;
use crate::schema::{
    EmbeddingDefinition, EmbeddingSpec, ObjectTypeDefinition, PropertyDefinition,
    RelationTypeDefinition, SchemaRegistry,
};
use crate::storage::Adapters;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// A unified memory instance: schema, writes and queries over three stores.
pub struct UnifiedMemory {
    paths: Option<InstancePaths>,
    config: MemoryConfig,
    stores: Adapters,
    embedder: Arc<dyn EmbeddingService>,
    registry: Arc<SchemaRegistry>,
    coordinator: WriteCoordinator,
    executor: QueryExecutor,
}

impl UnifiedMemory {
    /// Open (or create) the instance `config` points at.
    pub async fn open(config: MemoryConfig, embedder: Arc<dyn EmbeddingService>) -> Result<Self> {
        let paths = InstancePaths::prepare(&config)?;
        let stores = Adapters::open_sqlite(&paths)?;
        let mut memory = Self::with_adapters(stores, embedder, config).await?;
        info!(
            root = %paths.root.display(),
            schema_version = memory.registry.version(),
            "unimem instance opened"
        );
        memory.paths = Some(paths);
        Ok(memory)
    }

    /// Create an in-memory instance (for testing).
    pub async fn in_memory(embedder: Arc<dyn EmbeddingService>) -> Result<Self> {
        Self::with_adapters(Adapters::in_memory()?, embedder, MemoryConfig::default()).await
    }

    /// Assemble an instance over caller-provided adapters.
    pub async fn with_adapters(
        stores: Adapters,
        embedder: Arc<dyn EmbeddingService>,
        config: MemoryConfig,
    ) -> Result<Self> {
        let registry = Arc::new(
            SchemaRegistry::load(stores.relational.clone(), config.retry.clone()).await?,
        );
        let coordinator = WriteCoordinator::new(
            registry.clone(),
            stores.clone(),
            embedder.clone(),
            config.retry.clone(),
        );
        let executor = QueryExecutor::new(
            registry.clone(),
            stores.clone(),
            embedder.clone(),
            config.query.clone(),
            config.retry.clone(),
        );
        Ok(Self {
            paths: None,
            config,
            stores,
            embedder,
            registry,
            coordinator,
            executor,
        })
    }

    /// Root directory of an on-disk instance.
    pub fn root(&self) -> Option<&Path> {
        self.paths.as_ref().map(|p| p.root.as_path())
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    // Schema

    pub async fn define_object_type(&self, def: ObjectTypeDefinition) -> Result<ObjectTypeDefinition> {
        self.registry.define_object_type(def).await
    }

    pub async fn extend_object_type(
        &self,
        name: &str,
        additions: Vec<PropertyDefinition>,
    ) -> Result<ObjectTypeDefinition> {
        self.registry.extend_object_type(name, additions).await
    }

    pub async fn define_relation_type(
        &self,
        def: RelationTypeDefinition,
    ) -> Result<RelationTypeDefinition> {
        self.registry.define_relation_type(def).await
    }

    pub async fn define_embedding(&self, spec: EmbeddingSpec) -> Result<EmbeddingDefinition> {
        self.registry.define_embedding(spec, self.embedder.as_ref()).await
    }

    pub fn get_object_type(&self, name: &str) -> Option<ObjectTypeDefinition> {
        self.registry.get_object_type(name)
    }

    pub fn get_relation_type(&self, name: &str) -> Option<RelationTypeDefinition> {
        self.registry.get_relation_type(name)
    }

    pub fn get_embedding_definition(
        &self,
        object_type: &str,
        name: &str,
    ) -> Option<EmbeddingDefinition> {
        self.registry.get_embedding_definition(object_type, name)
    }

    pub fn list_embeddings_for(&self, object_type: &str) -> Vec<EmbeddingDefinition> {
        self.registry.list_embeddings_for(object_type)
    }

    pub fn list_object_types(&self) -> Vec<ObjectTypeDefinition> {
        self.registry.list_object_types()
    }

    pub fn list_relation_types(&self) -> Vec<RelationTypeDefinition> {
        self.registry.list_relation_types()
    }

    /// Remove an object type.
    ///
    /// Without `cascade` the type must have no instances and no relation
    /// types or embeddings referring to it. With `cascade` those are removed
    /// first: relation instances, objects, embeddings with their vectors,
    /// then the relation types.
    pub async fn drop_object_type(&self, name: &str, cascade: bool) -> Result<()> {
        if !cascade {
            return self.registry.remove_object_type(name).await;
        }

        let snapshot = self.registry.snapshot();
        if snapshot.object_type(name).is_none() {
            return Err(Error::Schema(format!("object type '{name}' is not defined")));
        }
        let relations: Vec<String> = snapshot
            .relation_types_touching(name)
            .map(|r| r.name.clone())
            .collect();
        let embeddings: Vec<String> = snapshot
            .embeddings_for(name)
            .iter()
            .map(|e| e.name.clone())
            .collect();

        for relation in &relations {
            self.coordinator.delete_relations_of_type(relation).await?;
        }
        let removed = self.coordinator.delete_objects_of_type(name).await?;
        for embedding in &embeddings {
            self.drop_embedding(name, embedding).await?;
        }
        for relation in &relations {
            self.registry.remove_relation_type(relation).await?;
        }
        self.registry.remove_object_type(name).await?;
        info!(
            object_type = %name,
            instances = removed,
            relation_types = relations.len(),
            embeddings = embeddings.len(),
            "object type dropped with dependents"
        );
        Ok(())
    }

    /// Remove a relation type; with `cascade` its instances are deleted first.
    pub async fn drop_relation_type(&self, name: &str, cascade: bool) -> Result<()> {
        if self.registry.get_relation_type(name).is_none() {
            return Err(Error::Schema(format!("relation type '{name}' is not defined")));
        }
        if cascade {
            self.coordinator.delete_relations_of_type(name).await?;
        } else {
            let graph = &self.stores.graph;
            let live = retry_storage(&self.config.retry, "edges of type", || {
                graph.edges_of_type(name)
            })
            .await?
            .len();
            if live > 0 {
                return Err(Error::Schema(format!(
                    "relation type '{name}' still has {live} instances"
                )));
            }
        }
        self.registry.remove_relation_type(name).await
    }

    /// Remove an embedding definition and every vector stored for it.
    pub async fn drop_embedding(&self, object_type: &str, name: &str) -> Result<()> {
        self.registry.remove_embedding(object_type, name).await?;
        let vectors = &self.stores.vector;
        match retry_storage(&self.config.retry, "purge", || vectors.purge(object_type, name)).await
        {
            Ok(purged) => {
                info!(object_type = %object_type, embedding = %name, purged, "embedding vectors purged");
                Ok(())
            }
            Err(err) => {
                error!(object_type = %object_type, embedding = %name, error = %err, "orphaned vectors left behind");
                Err(Error::ConsistencyRisk {
                    store: Engine::Vector,
                    id: format!("{object_type}/{name}"),
                    reason: format!("definition removed but vectors not purged: {err}"),
                })
            }
        }
    }

    // Instances

    pub async fn upsert_object(&self, instance: ObjectInstance) -> Result<ObjectInstance> {
        self.coordinator.upsert_object(instance).await
    }

    pub async fn upsert_objects(&self, batch: Vec<ObjectInstance>) -> Result<Vec<ObjectInstance>> {
        self.coordinator.upsert_objects(batch).await
    }

    pub async fn get_object(&self, id: &ObjectId) -> Result<ObjectInstance> {
        self.coordinator.get_object(id).await
    }

    pub async fn delete_object(&self, id: &ObjectId) -> Result<()> {
        self.coordinator.delete_object(id).await
    }

    pub async fn upsert_relation(&self, instance: RelationInstance) -> Result<RelationInstance> {
        self.coordinator.upsert_relation(instance).await
    }

    pub async fn get_relation(&self, id: &RelationId) -> Result<RelationInstance> {
        self.coordinator.get_relation(id).await
    }

    pub async fn delete_relation(&self, id: &RelationId) -> Result<()> {
        self.coordinator.delete_relation(id).await
    }

    // Queries

    pub async fn find_objects(
        &self,
        object_type: &str,
        filters: Vec<RelationalFilter>,
    ) -> Result<Vec<ObjectInstance>> {
        self.executor.find_objects(object_type, filters).await
    }

    pub async fn execute_query(&self, query: &ComplexQuery) -> Result<QueryResult> {
        self.executor.execute(query, QueryOptions::default()).await
    }

    pub async fn execute_query_with(
        &self,
        query: &ComplexQuery,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        self.executor.execute(query, options).await
    }

    /// Validate a query and return its plan without running it.
    pub fn plan_query(&self, query: &ComplexQuery) -> Result<QueryPlan> {
        self.executor.plan(query)
    }
}
