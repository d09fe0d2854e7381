//! Single-writer, multi-reader cache of definitions backed by the relational store.

use super::types::{
    EmbeddingDefinition, EmbeddingSpec, ObjectTypeDefinition, PropertyDefinition,
    RelationTypeDefinition,
};
use super::{EMBEDDINGS_NS, OBJECT_TYPES_NS, RELATION_TYPES_NS};
use crate::embedding::EmbeddingService;
use crate::error::{Error, Result};
use crate::object::{ObjectId, PropertyMap};
use crate::retry::{retry_storage, RetryConfig};
use crate::storage::RelationalAdapter;
use crate::value::{SemanticType, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

const DEFINITION_FIELD: &str = "definition";

/// An immutable view of every definition at one schema version.
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    version: u64,
    object_types: BTreeMap<String, ObjectTypeDefinition>,
    relation_types: BTreeMap<String, RelationTypeDefinition>,
    /// Keyed by object type name
    embeddings: BTreeMap<String, Vec<EmbeddingDefinition>>,
}

impl SchemaSnapshot {
    /// Version token; bumped by every definition change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn object_type(&self, name: &str) -> Option<&ObjectTypeDefinition> {
        self.object_types.get(name)
    }

    pub fn relation_type(&self, name: &str) -> Option<&RelationTypeDefinition> {
        self.relation_types.get(name)
    }

    pub fn object_types(&self) -> impl Iterator<Item = &ObjectTypeDefinition> {
        self.object_types.values()
    }

    pub fn relation_types(&self) -> impl Iterator<Item = &RelationTypeDefinition> {
        self.relation_types.values()
    }

    pub fn embeddings_for(&self, object_type: &str) -> &[EmbeddingDefinition] {
        self.embeddings
            .get(object_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn embedding(&self, object_type: &str, name: &str) -> Option<&EmbeddingDefinition> {
        self.embeddings_for(object_type).iter().find(|e| e.name == name)
    }

    /// Relation types whose source or target is `object_type`.
    pub fn relation_types_touching<'a>(
        &'a self,
        object_type: &'a str,
    ) -> impl Iterator<Item = &'a RelationTypeDefinition> + 'a {
        self.relation_types
            .values()
            .filter(move |r| r.source_type == object_type || r.target_type == object_type)
    }
}

/// Authoritative store of type definitions.
///
/// Readers take a cheap `Arc` snapshot; definers serialize on an async lock,
/// persist first, then publish a new snapshot with a bumped version.
pub struct SchemaRegistry {
    current: RwLock<Arc<SchemaSnapshot>>,
    writer: tokio::sync::Mutex<()>,
    store: Arc<dyn RelationalAdapter>,
    retry: RetryConfig,
}

impl SchemaRegistry {
    /// Load every persisted definition from the relational store.
    pub async fn load(store: Arc<dyn RelationalAdapter>, retry: RetryConfig) -> Result<Self> {
        let mut snapshot = SchemaSnapshot::default();

        for def in load_all::<ObjectTypeDefinition>(store.as_ref(), OBJECT_TYPES_NS).await? {
            snapshot.object_types.insert(def.name.clone(), def);
        }
        for def in load_all::<RelationTypeDefinition>(store.as_ref(), RELATION_TYPES_NS).await? {
            snapshot.relation_types.insert(def.name.clone(), def);
        }
        for def in load_all::<EmbeddingDefinition>(store.as_ref(), EMBEDDINGS_NS).await? {
            snapshot
                .embeddings
                .entry(def.object_type.clone())
                .or_default()
                .push(def);
        }

        info!(
            object_types = snapshot.object_types.len(),
            relation_types = snapshot.relation_types.len(),
            "schema registry loaded"
        );

        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: tokio::sync::Mutex::new(()),
            store,
            retry,
        })
    }

    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    pub fn get_object_type(&self, name: &str) -> Option<ObjectTypeDefinition> {
        self.snapshot().object_type(name).cloned()
    }

    pub fn get_relation_type(&self, name: &str) -> Option<RelationTypeDefinition> {
        self.snapshot().relation_type(name).cloned()
    }

    pub fn get_embedding_definition(
        &self,
        object_type: &str,
        name: &str,
    ) -> Option<EmbeddingDefinition> {
        self.snapshot().embedding(object_type, name).cloned()
    }

    pub fn list_embeddings_for(&self, object_type: &str) -> Vec<EmbeddingDefinition> {
        self.snapshot().embeddings_for(object_type).to_vec()
    }

    pub fn list_object_types(&self) -> Vec<ObjectTypeDefinition> {
        self.snapshot().object_types().cloned().collect()
    }

    pub fn list_relation_types(&self) -> Vec<RelationTypeDefinition> {
        self.snapshot().relation_types().cloned().collect()
    }

    pub async fn define_object_type(
        &self,
        def: ObjectTypeDefinition,
    ) -> Result<ObjectTypeDefinition> {
        let _guard = self.writer.lock().await;
        def.check()?;
        if self.snapshot().object_type(&def.name).is_some() {
            return Err(Error::Schema(format!(
                "object type '{}' already exists",
                def.name
            )));
        }

        self.persist(OBJECT_TYPES_NS, &def.name, &def).await?;
        self.publish(|s| {
            s.object_types.insert(def.name.clone(), def.clone());
        });
        info!(object_type = %def.name, properties = def.properties.len(), "object type defined");
        Ok(def)
    }

    /// Additive evolution: append new nullable properties to an existing type.
    pub async fn extend_object_type(
        &self,
        name: &str,
        additions: Vec<PropertyDefinition>,
    ) -> Result<ObjectTypeDefinition> {
        let _guard = self.writer.lock().await;
        let mut def = self
            .snapshot()
            .object_type(name)
            .cloned()
            .ok_or_else(|| Error::Schema(format!("object type '{name}' is not defined")))?;

        for prop in additions {
            if !prop.nullable || prop.identifier {
                return Err(Error::Schema(format!(
                    "'{name}.{}' must be nullable and not an identifier to be added later",
                    prop.name
                )));
            }
            if def.property(&prop.name).is_some() {
                return Err(Error::Schema(format!(
                    "'{name}.{}' already exists; property types are immutable",
                    prop.name
                )));
            }
            def.properties.push(prop);
        }
        def.check()?;

        self.persist(OBJECT_TYPES_NS, &def.name, &def).await?;
        self.publish(|s| {
            s.object_types.insert(def.name.clone(), def.clone());
        });
        info!(object_type = %def.name, properties = def.properties.len(), "object type extended");
        Ok(def)
    }

    pub async fn define_relation_type(
        &self,
        def: RelationTypeDefinition,
    ) -> Result<RelationTypeDefinition> {
        let _guard = self.writer.lock().await;
        def.check()?;
        let snapshot = self.snapshot();
        if snapshot.relation_type(&def.name).is_some() {
            return Err(Error::Schema(format!(
                "relation type '{}' already exists",
                def.name
            )));
        }
        for endpoint in [&def.source_type, &def.target_type] {
            if snapshot.object_type(endpoint).is_none() {
                return Err(Error::Schema(format!(
                    "relation type '{}' references undefined object type '{endpoint}'",
                    def.name
                )));
            }
        }

        self.persist(RELATION_TYPES_NS, &def.name, &def).await?;
        self.publish(|s| {
            s.relation_types.insert(def.name.clone(), def.clone());
        });
        info!(
            relation_type = %def.name,
            source = %def.source_type,
            target = %def.target_type,
            "relation type defined"
        );
        Ok(def)
    }

    pub async fn define_embedding(
        &self,
        spec: EmbeddingSpec,
        embedder: &dyn EmbeddingService,
    ) -> Result<EmbeddingDefinition> {
        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();
        let object_type = snapshot.object_type(&spec.object_type).ok_or_else(|| {
            Error::Schema(format!(
                "object type '{}' is not defined",
                spec.object_type
            ))
        })?;
        let prop = object_type.property(&spec.source_property).ok_or_else(|| {
            Error::Schema(format!(
                "'{}.{}' does not exist",
                spec.object_type, spec.source_property
            ))
        })?;
        if prop.semantic_type != SemanticType::Text {
            return Err(Error::Schema(format!(
                "'{}.{}' is {}, only TEXT properties can be embedded",
                spec.object_type, spec.source_property, prop.semantic_type
            )));
        }

        let name = spec.name.clone().unwrap_or_else(|| spec.source_property.clone());
        let existing = snapshot.embeddings_for(&spec.object_type);
        if existing.iter().any(|e| e.name == name) {
            return Err(Error::Schema(format!(
                "embedding '{name}' already exists on '{}'",
                spec.object_type
            )));
        }
        if existing.iter().any(|e| e.source_property == spec.source_property) {
            return Err(Error::Schema(format!(
                "'{}.{}' already has an embedding",
                spec.object_type, spec.source_property
            )));
        }

        let dimension = embedder.dimension(&spec.model_id)?;
        let def = EmbeddingDefinition {
            name,
            object_type: spec.object_type,
            source_property: spec.source_property,
            model_id: spec.model_id,
            dimension,
        };

        self.persist(EMBEDDINGS_NS, &embedding_key(&def.object_type, &def.name), &def)
            .await?;
        self.publish(|s| {
            s.embeddings
                .entry(def.object_type.clone())
                .or_default()
                .push(def.clone());
        });
        info!(
            object_type = %def.object_type,
            embedding = %def.name,
            model = %def.model_id,
            dimension,
            "embedding defined"
        );
        Ok(def)
    }

    /// Remove an object type that has no instances and no dependent definitions.
    pub async fn remove_object_type(&self, name: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();
        if snapshot.object_type(name).is_none() {
            return Err(Error::Schema(format!("object type '{name}' is not defined")));
        }
        if let Some(rel) = snapshot.relation_types_touching(name).next() {
            return Err(Error::Schema(format!(
                "relation type '{}' still references '{name}'",
                rel.name
            )));
        }
        if let Some(emb) = snapshot.embeddings_for(name).first() {
            return Err(Error::Schema(format!(
                "embedding '{}' still references '{name}'",
                emb.name
            )));
        }
        let live = retry_storage(&self.retry, "count", || self.store.count(name)).await?;
        if live > 0 {
            return Err(Error::Schema(format!(
                "object type '{name}' still has {live} instances"
            )));
        }

        self.unpersist(OBJECT_TYPES_NS, name).await?;
        self.publish(|s| {
            s.object_types.remove(name);
        });
        info!(object_type = %name, "object type removed");
        Ok(())
    }

    pub async fn remove_relation_type(&self, name: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        if self.snapshot().relation_type(name).is_none() {
            return Err(Error::Schema(format!("relation type '{name}' is not defined")));
        }
        self.unpersist(RELATION_TYPES_NS, name).await?;
        self.publish(|s| {
            s.relation_types.remove(name);
        });
        info!(relation_type = %name, "relation type removed");
        Ok(())
    }

    pub async fn remove_embedding(&self, object_type: &str, name: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        if self.snapshot().embedding(object_type, name).is_none() {
            return Err(Error::Schema(format!(
                "embedding '{name}' is not defined on '{object_type}'"
            )));
        }
        self.unpersist(EMBEDDINGS_NS, &embedding_key(object_type, name))
            .await?;
        self.publish(|s| {
            if let Some(defs) = s.embeddings.get_mut(object_type) {
                defs.retain(|e| e.name != name);
                if defs.is_empty() {
                    s.embeddings.remove(object_type);
                }
            }
        });
        info!(object_type = %object_type, embedding = %name, "embedding removed");
        Ok(())
    }

    async fn persist<T: Serialize>(&self, namespace: &str, key: &str, def: &T) -> Result<()> {
        let json = serde_json::to_value(def)
            .map_err(|e| Error::Schema(format!("cannot encode definition '{key}': {e}")))?;
        let mut props = PropertyMap::new();
        props.insert(DEFINITION_FIELD.to_string(), Value::Json(json));
        let id = ObjectId::new(key);
        retry_storage(&self.retry, "persist definition", || {
            self.store.put(namespace, &id, &props)
        })
        .await?;
        debug!(namespace, key, "definition persisted");
        Ok(())
    }

    async fn unpersist(&self, namespace: &str, key: &str) -> Result<()> {
        let id = ObjectId::new(key);
        match retry_storage(&self.retry, "delete definition", || {
            self.store.delete(namespace, &id)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn publish(&self, apply: impl FnOnce(&mut SchemaSnapshot)) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = SchemaSnapshot::clone(&current);
        apply(&mut next);
        next.version += 1;
        *current = Arc::new(next);
    }
}

fn embedding_key(object_type: &str, name: &str) -> String {
    format!("{object_type}/{name}")
}

async fn load_all<T: DeserializeOwned>(
    store: &dyn RelationalAdapter,
    namespace: &str,
) -> Result<Vec<T>> {
    let mut defs = Vec::new();
    for id in store.scan(namespace, &[]).await? {
        let Some(props) = store.get(namespace, &id).await? else {
            continue;
        };
        let json = match props.get(DEFINITION_FIELD) {
            Some(Value::Json(json)) => json.clone(),
            _ => {
                return Err(Error::Schema(format!(
                    "stored definition '{id}' in {namespace} is malformed"
                )))
            }
        };
        let def = serde_json::from_value(json).map_err(|e| {
            Error::Schema(format!("stored definition '{id}' in {namespace}: {e}"))
        })?;
        defs.push(def);
    }
    Ok(defs)
}
