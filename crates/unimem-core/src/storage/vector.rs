//! SQLite vector adapter with brute-force cosine search.

use super::sqlite::{now_micros, SqliteConnection};
use super::traits::{EngineCapabilities, SearchRequest, SimilarityResult, StoredVector, VectorAdapter};
use crate::content_hash::ContentHash;
use crate::embedding::{cosine_similarity, Embedding};
use crate::error::{Engine, StorageError, StorageResult};
use crate::object::ObjectId;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS vectors (
        type_name       TEXT NOT NULL,
        embedding_name  TEXT NOT NULL,
        id              TEXT NOT NULL,
        model_id        TEXT NOT NULL,
        dimensions      INTEGER NOT NULL,
        vector          BLOB NOT NULL,
        source_hash     TEXT,
        updated_at      INTEGER NOT NULL,
        PRIMARY KEY (type_name, embedding_name, id)
    );
"#;

/// How many rows are scored between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 256;

enum Scan {
    Done(Vec<SimilarityResult>),
    Cancelled,
    DimensionMismatch(usize),
}

/// SQLite-based vector store.
pub struct SqliteVectorStore {
    db: SqliteConnection,
}

impl SqliteVectorStore {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self {
            db: SqliteConnection::open(Engine::Vector, path, SCHEMA)?,
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StorageResult<Self> {
        Ok(Self {
            db: SqliteConnection::in_memory(Engine::Vector, SCHEMA)?,
        })
    }
}

// Vectors are stored as f32 little-endian.
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl VectorAdapter for SqliteVectorStore {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::SINGLE_WRITER
    }

    async fn upsert(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
        vector: &StoredVector,
    ) -> StorageResult<()> {
        let embedding = &vector.embedding;
        if embedding.vector.len() != embedding.dimensions {
            return Err(StorageError::permanent(
                Engine::Vector,
                format!(
                    "vector has {} components but claims {} dimensions",
                    embedding.vector.len(),
                    embedding.dimensions
                ),
            ));
        }
        self.db.with(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO vectors
                (type_name, embedding_name, id, model_id, dimensions, vector, source_hash, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    object_type,
                    embedding_name,
                    id.as_str(),
                    embedding.model_id,
                    embedding.dimensions as i64,
                    encode_vector(&embedding.vector),
                    vector.source_hash.as_ref().map(ContentHash::to_hex),
                    now_micros(),
                ],
            )
        })?;
        Ok(())
    }

    async fn get(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
    ) -> StorageResult<Option<StoredVector>> {
        let row = self.db.with(|conn| {
            conn.query_row(
                r#"
                SELECT model_id, vector, source_hash FROM vectors
                WHERE type_name = ?1 AND embedding_name = ?2 AND id = ?3
                "#,
                params![object_type, embedding_name, id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
        })?;

        let Some((model_id, bytes, hash)) = row else {
            return Ok(None);
        };
        let source_hash = hash
            .map(|h| ContentHash::from_hex(&h).map_err(|e| self.db.corrupt("source hash", e)))
            .transpose()?;
        Ok(Some(StoredVector {
            embedding: Embedding::new(decode_vector(&bytes), model_id),
            source_hash,
        }))
    }

    async fn delete(
        &self,
        object_type: &str,
        embedding_name: &str,
        id: &ObjectId,
    ) -> StorageResult<()> {
        let removed = self.db.with(|conn| {
            conn.execute(
                "DELETE FROM vectors WHERE type_name = ?1 AND embedding_name = ?2 AND id = ?3",
                params![object_type, embedding_name, id.as_str()],
            )
        })?;
        if removed == 0 {
            return Err(StorageError::not_found(
                Engine::Vector,
                format!("{object_type}.{embedding_name} vector for '{id}'"),
            ));
        }
        Ok(())
    }

    async fn search(
        &self,
        object_type: &str,
        embedding_name: &str,
        request: &SearchRequest,
    ) -> StorageResult<Vec<SimilarityResult>> {
        if request.cancel.is_cancelled() {
            return Err(StorageError::cancelled(Engine::Vector));
        }
        if request.top_k == 0 {
            return Ok(Vec::new());
        }
        if request.restrict_to.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }

        // For now a brute-force scan; the contract leaves room for an ANN index.
        let scan = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, vector FROM vectors WHERE type_name = ?1 AND embedding_name = ?2",
            )?;
            let mut rows = stmt.query(params![object_type, embedding_name])?;
            let mut scored = Vec::new();
            let mut seen = 0usize;

            while let Some(row) = rows.next()? {
                seen += 1;
                if seen % CANCEL_CHECK_INTERVAL == 0 && request.cancel.is_cancelled() {
                    return Ok(Scan::Cancelled);
                }
                let id = ObjectId::new(row.get::<_, String>(0)?);
                if let Some(restrict) = &request.restrict_to {
                    if !restrict.contains(&id) {
                        continue;
                    }
                }
                let bytes: Vec<u8> = row.get(1)?;
                let vector = decode_vector(&bytes);
                if vector.len() != request.vector.len() {
                    return Ok(Scan::DimensionMismatch(vector.len()));
                }
                let score = cosine_similarity(&request.vector, &vector);
                if request.min_score.is_some_and(|min| score < min) {
                    continue;
                }
                scored.push(SimilarityResult { id, score });
            }
            Ok(Scan::Done(scored))
        })?;

        let mut results = match scan {
            Scan::Done(results) => results,
            Scan::Cancelled => return Err(StorageError::cancelled(Engine::Vector)),
            Scan::DimensionMismatch(stored) => {
                return Err(StorageError::permanent(
                    Engine::Vector,
                    format!(
                        "{object_type}.{embedding_name} holds {stored}-dimensional vectors, query has {}",
                        request.vector.len()
                    ),
                ))
            }
        };

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        results.truncate(request.top_k);
        Ok(results)
    }

    async fn purge(&self, object_type: &str, embedding_name: &str) -> StorageResult<usize> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM vectors WHERE type_name = ?1 AND embedding_name = ?2",
                params![object_type, embedding_name],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelHandle, CancelSignal};
    use std::collections::HashSet;

    fn stored(vector: Vec<f32>) -> StoredVector {
        StoredVector {
            embedding: Embedding::new(vector, "test"),
            source_hash: None,
        }
    }

    fn request(vector: Vec<f32>, top_k: usize) -> SearchRequest {
        SearchRequest {
            vector,
            top_k,
            min_score: None,
            restrict_to: None,
            cancel: CancelSignal::never(),
        }
    }

    async fn seeded() -> SqliteVectorStore {
        let store = SqliteVectorStore::in_memory().unwrap();
        let rows = [
            ("a", vec![1.0, 0.0, 0.0]),
            ("b", vec![0.9, 0.1, 0.0]),
            ("c", vec![0.0, 1.0, 0.0]),
            ("d", vec![1.0, 0.0, 0.0]),
        ];
        for (id, v) in rows {
            store
                .upsert("Doc", "body", &ObjectId::new(id), &stored(v))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_vector_roundtrip_with_hash() {
        let store = SqliteVectorStore::in_memory().unwrap();
        let id = ObjectId::new("x");
        let hash = ContentHash::of_source("test", "hello");
        let v = StoredVector {
            embedding: Embedding::new(vec![0.25, -1.5], "test"),
            source_hash: Some(hash),
        };
        store.upsert("Doc", "body", &id, &v).await.unwrap();
        assert_eq!(store.get("Doc", "body", &id).await.unwrap(), Some(v));

        store.delete("Doc", "body", &id).await.unwrap();
        assert!(store.delete("Doc", "body", &id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_search_orders_by_score_then_id() {
        let store = seeded().await;
        let results = store
            .search("Doc", "body", &request(vec![1.0, 0.0, 0.0], 3))
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "d", "b"]);
        assert!(results[0].score >= results[2].score);
    }

    #[tokio::test]
    async fn test_search_restrict_and_min_score() {
        let store = seeded().await;
        let mut req = request(vec![1.0, 0.0, 0.0], 10);
        req.restrict_to = Some(HashSet::from([ObjectId::new("b"), ObjectId::new("c")]));
        let ids: Vec<_> = store
            .search("Doc", "body", &req)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![ObjectId::new("b"), ObjectId::new("c")]);

        req.min_score = Some(0.5);
        let results = store.search("Doc", "body", &req).await.unwrap();
        assert_eq!(results.len(), 1);

        req.restrict_to = Some(HashSet::new());
        assert!(store.search("Doc", "body", &req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_cancelled() {
        let store = seeded().await;
        let (handle, signal) = CancelHandle::pair();
        handle.cancel();
        let mut req = request(vec![1.0, 0.0, 0.0], 1);
        req.cancel = signal;
        let err = store.search("Doc", "body", &req).await.unwrap_err();
        assert_eq!(err.kind, crate::error::StorageErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_purge_counts() {
        let store = seeded().await;
        assert_eq!(store.purge("Doc", "body").await.unwrap(), 4);
        assert!(store
            .search("Doc", "body", &request(vec![1.0, 0.0, 0.0], 5))
            .await
            .unwrap()
            .is_empty());
    }
}
