//! SQLite relational adapter: one JSON document per object, filtered with `json_extract`.

use super::sqlite::{now_micros, SqliteConnection};
use super::traits::{EngineCapabilities, RelationalAdapter};
use crate::error::{Engine, StorageError, StorageResult};
use crate::object::{ObjectId, PropertyMap};
use crate::query::{FilterOp, RelationalFilter, ID_FIELD};
use crate::schema::RESERVED_PREFIX;
use crate::value::Value;
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS objects (
        type_name       TEXT NOT NULL,
        id              TEXT NOT NULL,
        properties      TEXT NOT NULL,
        updated_at      INTEGER NOT NULL,
        PRIMARY KEY (type_name, id)
    );

    CREATE INDEX IF NOT EXISTS idx_objects_id ON objects(id);
"#;

/// SQLite-based relational store.
pub struct SqliteRelationalStore {
    db: SqliteConnection,
}

impl SqliteRelationalStore {
    /// Open the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self {
            db: SqliteConnection::open(Engine::Relational, path, SCHEMA)?,
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StorageResult<Self> {
        Ok(Self {
            db: SqliteConnection::in_memory(Engine::Relational, SCHEMA)?,
        })
    }
}

/// Translate filters into a `WHERE` suffix and its bound parameters.
fn build_filters(filters: &[RelationalFilter]) -> StorageResult<(String, Vec<SqlValue>)> {
    let mut sql = String::new();
    let mut args = Vec::new();

    for filter in filters {
        let column = if filter.field == ID_FIELD {
            "id".to_string()
        } else {
            args.push(SqlValue::Text(format!("$.\"{}\".value", filter.field)));
            "json_extract(properties, ?)".to_string()
        };

        match (&filter.op, &filter.value) {
            (FilterOp::In, Value::List(items)) => {
                let placeholders = vec!["?"; items.len()].join(", ");
                sql.push_str(&format!(" AND {column} IN ({placeholders})"));
                for item in items {
                    args.push(to_sql(item)?);
                }
            }
            (op, value) => {
                sql.push_str(&format!(" AND {column} {} ?", op.as_sql()));
                args.push(to_sql(value)?);
            }
        }
    }
    Ok((sql, args))
}

/// The SQLite value `json_extract` yields for a stored property.
fn to_sql(value: &Value) -> StorageResult<SqlValue> {
    Ok(match value {
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Datetime(dt) => SqlValue::Integer(dt.timestamp_micros()),
        Value::Uuid(u) => SqlValue::Text(u.to_string()),
        other => {
            return Err(StorageError::permanent(
                Engine::Relational,
                format!("{} values cannot be used in a filter", other.kind()),
            ))
        }
    })
}

#[async_trait]
impl RelationalAdapter for SqliteRelationalStore {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::SINGLE_WRITER
    }

    async fn put(
        &self,
        object_type: &str,
        id: &ObjectId,
        properties: &PropertyMap,
    ) -> StorageResult<()> {
        let json = serde_json::to_string(properties)
            .map_err(|e| self.db.corrupt("properties", e))?;
        self.db.with(|conn| {
            conn.execute(
                r#"
                INSERT INTO objects (type_name, id, properties, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(type_name, id) DO UPDATE SET
                    properties = excluded.properties,
                    updated_at = excluded.updated_at
                "#,
                params![object_type, id.as_str(), json, now_micros()],
            )
        })?;
        Ok(())
    }

    async fn get(&self, object_type: &str, id: &ObjectId) -> StorageResult<Option<PropertyMap>> {
        let json: Option<String> = self.db.with(|conn| {
            conn.query_row(
                "SELECT properties FROM objects WHERE type_name = ?1 AND id = ?2",
                params![object_type, id.as_str()],
                |row| row.get(0),
            )
            .optional()
        })?;

        json.map(|j| serde_json::from_str(&j).map_err(|e| self.db.corrupt("properties", e)))
            .transpose()
    }

    async fn delete(&self, object_type: &str, id: &ObjectId) -> StorageResult<()> {
        let removed = self.db.with(|conn| {
            conn.execute(
                "DELETE FROM objects WHERE type_name = ?1 AND id = ?2",
                params![object_type, id.as_str()],
            )
        })?;
        if removed == 0 {
            return Err(StorageError::not_found(
                Engine::Relational,
                format!("{object_type} '{id}'"),
            ));
        }
        Ok(())
    }

    async fn scan(
        &self,
        object_type: &str,
        filters: &[RelationalFilter],
    ) -> StorageResult<Vec<ObjectId>> {
        let (clauses, filter_args) = build_filters(filters)?;
        let sql = format!("SELECT id FROM objects WHERE type_name = ?{clauses} ORDER BY id");
        let mut args = vec![SqlValue::Text(object_type.to_string())];
        args.extend(filter_args);

        self.db.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    row.get::<_, String>(0).map(ObjectId::new)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    async fn lookup_type(&self, id: &ObjectId) -> StorageResult<Option<String>> {
        self.db.with(|conn| {
            conn.query_row(
                r#"
                SELECT type_name FROM objects
                WHERE id = ?1 AND substr(type_name, 1, length(?2)) <> ?2
                LIMIT 1
                "#,
                params![id.as_str(), RESERVED_PREFIX],
                |row| row.get(0),
            )
            .optional()
        })
    }

    async fn count(&self, object_type: &str) -> StorageResult<usize> {
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM objects WHERE type_name = ?1",
                params![object_type],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}
