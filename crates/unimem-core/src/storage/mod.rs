//! Storage abstraction layer.
//!
//! Each engine sits behind its own adapter trait; the coordinator and the
//! query executor only ever talk to these traits. The bundled backends keep
//! every engine in its own SQLite database.

mod graph;
mod relational;
mod sqlite;
mod traits;
mod vector;

pub use graph::SqliteGraphStore;
pub use relational::SqliteRelationalStore;
pub use traits::{
    Direction, EdgeRecord, EngineCapabilities, GraphAdapter, RelationalAdapter, SearchRequest,
    SimilarityResult, StoredVector, VectorAdapter,
};
pub use vector::SqliteVectorStore;

use crate::config::InstancePaths;
use crate::error::StorageResult;
use std::sync::Arc;

/// The three adapters one database instance is built from.
#[derive(Clone)]
pub struct Adapters {
    pub relational: Arc<dyn RelationalAdapter>,
    pub vector: Arc<dyn VectorAdapter>,
    pub graph: Arc<dyn GraphAdapter>,
}

impl Adapters {
    /// Open the bundled SQLite stores inside an instance's engine directories.
    pub fn open_sqlite(paths: &InstancePaths) -> StorageResult<Self> {
        Ok(Self {
            relational: Arc::new(SqliteRelationalStore::open(paths.relational_db())?),
            vector: Arc::new(SqliteVectorStore::open(paths.vector_db())?),
            graph: Arc::new(SqliteGraphStore::open(paths.graph_db())?),
        })
    }

    /// In-memory SQLite stores (for testing).
    pub fn in_memory() -> StorageResult<Self> {
        Ok(Self {
            relational: Arc::new(SqliteRelationalStore::in_memory()?),
            vector: Arc::new(SqliteVectorStore::in_memory()?),
            graph: Arc::new(SqliteGraphStore::in_memory()?),
        })
    }
}
