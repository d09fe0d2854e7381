//! SQLite graph adapter: node registry plus typed edge table.

use super::sqlite::SqliteConnection;
use super::traits::{Direction, EdgeRecord, EngineCapabilities, GraphAdapter};
use crate::error::{Engine, StorageError, StorageResult};
use crate::object::{ObjectId, PropertyMap, RelationId};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id              TEXT PRIMARY KEY,
        type_name       TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS edges (
        id              TEXT PRIMARY KEY,
        relation_type   TEXT NOT NULL,
        source_id       TEXT NOT NULL,
        target_id       TEXT NOT NULL,
        properties      TEXT NOT NULL DEFAULT '{}'
    );

    CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(relation_type, source_id);
    CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(relation_type, target_id);
    CREATE INDEX IF NOT EXISTS idx_edges_source_any ON edges(source_id);
    CREATE INDEX IF NOT EXISTS idx_edges_target_any ON edges(target_id);
"#;

/// SQLite-based graph store.
pub struct SqliteGraphStore {
    db: SqliteConnection,
}

impl SqliteGraphStore {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self {
            db: SqliteConnection::open(Engine::Graph, path, SCHEMA)?,
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StorageResult<Self> {
        Ok(Self {
            db: SqliteConnection::in_memory(Engine::Graph, SCHEMA)?,
        })
    }

    fn decode_edge(&self, raw: RawEdge) -> StorageResult<EdgeRecord> {
        let properties: PropertyMap = serde_json::from_str(&raw.properties)
            .map_err(|e| self.db.corrupt("edge properties", e))?;
        Ok(EdgeRecord {
            id: RelationId::new(raw.id),
            relation_type: raw.relation_type,
            source: ObjectId::new(raw.source),
            target: ObjectId::new(raw.target),
            properties,
        })
    }
}

struct RawEdge {
    id: String,
    relation_type: String,
    source: String,
    target: String,
    properties: String,
}

impl RawEdge {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            relation_type: row.get(1)?,
            source: row.get(2)?,
            target: row.get(3)?,
            properties: row.get(4)?,
        })
    }
}

const EDGE_COLUMNS: &str = "id, relation_type, source_id, target_id, properties";

#[async_trait]
impl GraphAdapter for SqliteGraphStore {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::SINGLE_WRITER
    }

    async fn upsert_node(&self, object_type: &str, id: &ObjectId) -> StorageResult<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO nodes (id, type_name) VALUES (?1, ?2)",
                params![id.as_str(), object_type],
            )
        })?;
        Ok(())
    }

    async fn has_node(&self, id: &ObjectId) -> StorageResult<bool> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?1)",
                params![id.as_str()],
                |row| row.get(0),
            )
        })
    }

    async fn delete_node(&self, id: &ObjectId) -> StorageResult<()> {
        let removed = self
            .db
            .with(|conn| conn.execute("DELETE FROM nodes WHERE id = ?1", params![id.as_str()]))?;
        if removed == 0 {
            return Err(StorageError::not_found(Engine::Graph, format!("node '{id}'")));
        }
        Ok(())
    }

    async fn upsert_edge(&self, edge: &EdgeRecord) -> StorageResult<()> {
        let properties = serde_json::to_string(&edge.properties)
            .map_err(|e| self.db.corrupt("edge properties", e))?;
        self.db.with(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO edges (id, relation_type, source_id, target_id, properties)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    edge.id.as_str(),
                    edge.relation_type,
                    edge.source.as_str(),
                    edge.target.as_str(),
                    properties,
                ],
            )
        })?;
        Ok(())
    }

    async fn get_edge(&self, id: &RelationId) -> StorageResult<Option<EdgeRecord>> {
        let raw = self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE id = ?1"),
                params![id.as_str()],
                RawEdge::from_row,
            )
            .optional()
        })?;
        raw.map(|r| self.decode_edge(r)).transpose()
    }

    async fn delete_edge(&self, id: &RelationId) -> StorageResult<()> {
        let removed = self
            .db
            .with(|conn| conn.execute("DELETE FROM edges WHERE id = ?1", params![id.as_str()]))?;
        if removed == 0 {
            return Err(StorageError::not_found(Engine::Graph, format!("edge '{id}'")));
        }
        Ok(())
    }

    async fn incident_edges(&self, id: &ObjectId) -> StorageResult<Vec<EdgeRecord>> {
        let raws = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EDGE_COLUMNS} FROM edges WHERE source_id = ?1 OR target_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![id.as_str()], RawEdge::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raws.into_iter().map(|r| self.decode_edge(r)).collect()
    }

    async fn edges_of_type(&self, relation_type: &str) -> StorageResult<Vec<RelationId>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM edges WHERE relation_type = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![relation_type], |row| {
                    row.get::<_, String>(0).map(RelationId::new)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    async fn neighbors(
        &self,
        relation_type: &str,
        id: &ObjectId,
        direction: Direction,
    ) -> StorageResult<Vec<ObjectId>> {
        let sql = match direction {
            Direction::Outgoing => {
                "SELECT DISTINCT target_id FROM edges WHERE relation_type = ?1 AND source_id = ?2 ORDER BY target_id"
            }
            Direction::Incoming => {
                "SELECT DISTINCT source_id FROM edges WHERE relation_type = ?1 AND target_id = ?2 ORDER BY source_id"
            }
        };
        self.db.with(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let ids = stmt
                .query_map(params![relation_type, id.as_str()], |row| {
                    row.get::<_, String>(0).map(ObjectId::new)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn edge(id: &str, rel: &str, source: &str, target: &str) -> EdgeRecord {
        EdgeRecord {
            id: RelationId::new(id),
            relation_type: rel.to_string(),
            source: ObjectId::new(source),
            target: ObjectId::new(target),
            properties: PropertyMap::new(),
        }
    }

    #[tokio::test]
    async fn test_nodes() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let id = ObjectId::new("A1");
        assert!(!store.has_node(&id).await.unwrap());
        store.upsert_node("Author", &id).await.unwrap();
        store.upsert_node("Author", &id).await.unwrap();
        assert!(store.has_node(&id).await.unwrap());
        store.delete_node(&id).await.unwrap();
        assert!(store.delete_node(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_edges_and_neighbors() {
        let store = SqliteGraphStore::in_memory().unwrap();
        store.upsert_edge(&edge("r1", "WRITTEN_BY", "B1", "A1")).await.unwrap();
        store.upsert_edge(&edge("r2", "WRITTEN_BY", "B2", "A1")).await.unwrap();
        store.upsert_edge(&edge("r3", "CITES", "B2", "B1")).await.unwrap();

        let books = store
            .neighbors("WRITTEN_BY", &ObjectId::new("A1"), Direction::Incoming)
            .await
            .unwrap();
        assert_eq!(books, vec![ObjectId::new("B1"), ObjectId::new("B2")]);

        let authors = store
            .neighbors("WRITTEN_BY", &ObjectId::new("B2"), Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(authors, vec![ObjectId::new("A1")]);

        let incident = store.incident_edges(&ObjectId::new("B1")).await.unwrap();
        let ids: Vec<_> = incident.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["r1", "r3"]);

        let written = store.edges_of_type("WRITTEN_BY").await.unwrap();
        assert_eq!(written, vec![RelationId::new("r1"), RelationId::new("r2")]);
    }

    #[tokio::test]
    async fn test_edge_properties_roundtrip() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let mut e = edge("r1", "REVIEWED", "U1", "B1");
        e.properties.insert("stars".into(), Value::Integer(4));
        store.upsert_edge(&e).await.unwrap();
        assert_eq!(store.get_edge(&e.id).await.unwrap(), Some(e.clone()));

        store.delete_edge(&e.id).await.unwrap();
        assert!(store.get_edge(&e.id).await.unwrap().is_none());
        assert!(store.delete_edge(&e.id).await.unwrap_err().is_not_found());
    }
}
