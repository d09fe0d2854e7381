//! unimem Core Library
//!
//! Schema registry, cross-store write coordination and complex queries over a
//! relational, a vector and a graph store, behind one [`UnifiedMemory`] handle.

pub mod cancel;
pub mod config;
pub mod content_hash;
pub mod coordinator;
pub mod database;
pub mod embedding;
pub mod error;
pub mod locks;
pub mod object;
pub mod query;
pub mod retry;
pub mod schema;
pub mod storage;
pub mod value;

#[cfg(test)]
pub mod testutils;

pub use cancel::{CancelHandle, CancelSignal};
pub use config::{DatabaseLocation, MemoryConfig, QueryConfig, SearchStrategy};
pub use content_hash::ContentHash;
pub use database::UnifiedMemory;
pub use embedding::{Embedding, EmbeddingService, HashingEmbedder};
pub use error::{Engine, Error, Result, StorageError, StorageErrorKind};
pub use object::{ObjectId, ObjectInstance, PropertyMap, RelationId, RelationInstance};
pub use query::{
    ComplexQuery, EmbeddingSearch, FilterOp, QueryComponent, QueryOptions, QueryResult,
    RelationalFilter,
};
pub use retry::RetryConfig;
pub use schema::{
    EmbeddingDefinition, EmbeddingSpec, ObjectTypeDefinition, PropertyDefinition,
    RelationTypeDefinition,
};
pub use storage::Direction;
pub use value::{SemanticType, Value};
