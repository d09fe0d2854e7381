//! Instance configuration and on-disk layout.

use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory under the platform data dir holding named instances.
const APP_DIR: &str = "unimem";

pub const RELATIONAL_DIR: &str = "relational";
pub const VECTOR_DIR: &str = "vector";
pub const GRAPH_DIR: &str = "graph";

/// Where a database instance lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseLocation {
    /// A conventionally located instance, `<data dir>/unimem/<name>`
    Named(String),
    /// An explicit root directory
    Path(PathBuf),
}

impl Default for DatabaseLocation {
    fn default() -> Self {
        DatabaseLocation::Named("default".to_string())
    }
}

impl DatabaseLocation {
    /// Resolve to an absolute root directory.
    pub fn resolve(&self) -> Result<PathBuf> {
        match self {
            DatabaseLocation::Path(path) => Ok(path.clone()),
            DatabaseLocation::Named(name) => {
                let valid = !name.is_empty()
                    && name != "."
                    && name != ".."
                    && !name.contains(['/', '\\']);
                if !valid {
                    return Err(Error::Configuration(format!(
                        "invalid instance name '{name}'"
                    )));
                }
                let data_dir = dirs::data_dir().ok_or_else(|| {
                    Error::Configuration("no data directory on this platform".to_string())
                })?;
                Ok(data_dir.join(APP_DIR).join(name))
            }
        }
    }
}

/// Order of relational filtering and similarity search within one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Scan with filters, search restricted to the survivors, then truncate to `top_k`.
    #[default]
    FilterFirst,
    /// Search the whole type, truncate to `top_k`, then intersect with the filters.
    SearchFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub strategy: SearchStrategy,
    /// Default per-query deadline
    pub deadline_ms: Option<u64>,
}

/// Top-level configuration of one database instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub location: DatabaseLocation,
    /// Create the root and engine directories on first use
    pub create_if_missing: bool,
    pub retry: RetryConfig,
    pub query: QueryConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            location: DatabaseLocation::default(),
            create_if_missing: true,
            retry: RetryConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Configuration for an instance rooted at `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::Path(path.into()),
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            location: DatabaseLocation::Named(name.into()),
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(format!("invalid config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }
}

/// Resolved on-disk layout of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub root: PathBuf,
    pub relational: PathBuf,
    pub vector: PathBuf,
    pub graph: PathBuf,
}

impl InstancePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            relational: root.join(RELATIONAL_DIR),
            vector: root.join(VECTOR_DIR),
            graph: root.join(GRAPH_DIR),
            root,
        }
    }

    /// Resolve the configured location and make sure every directory exists.
    pub fn prepare(config: &MemoryConfig) -> Result<Self> {
        let paths = Self::new(config.location.resolve()?);
        for dir in [&paths.root, &paths.relational, &paths.vector, &paths.graph] {
            ensure_dir(dir, config.create_if_missing)?;
        }
        info!(root = %paths.root.display(), "instance directories ready");
        Ok(paths)
    }

    pub fn relational_db(&self) -> PathBuf {
        self.relational.join("store.db")
    }

    pub fn vector_db(&self) -> PathBuf {
        self.vector.join("vectors.db")
    }

    pub fn graph_db(&self) -> PathBuf {
        self.graph.join("graph.db")
    }
}

fn ensure_dir(dir: &Path, create: bool) -> Result<()> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(Error::Configuration(format!(
            "{} exists but is not a directory",
            dir.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !create {
                return Err(Error::Configuration(format!(
                    "{} does not exist and creation is disabled",
                    dir.display()
                )));
            }
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Configuration(format!("cannot create {}: {e}", dir.display()))
            })
        }
        Err(e) => Err(Error::Configuration(format!(
            "cannot access {}: {e}",
            dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_layout_idempotently() {
        let temp = tempfile::tempdir().unwrap();
        let config = MemoryConfig::at_path(temp.path().join("db"));

        let paths = InstancePaths::prepare(&config).unwrap();
        assert!(paths.relational.is_dir());
        assert!(paths.vector.is_dir());
        assert!(paths.graph.is_dir());
        assert_eq!(InstancePaths::prepare(&config).unwrap(), paths);
    }

    #[test]
    fn test_prepare_rejects_file_root() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let err = InstancePaths::prepare(&MemoryConfig::at_path(&file)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_prepare_respects_create_flag() {
        let temp = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            create_if_missing: false,
            ..MemoryConfig::at_path(temp.path().join("missing"))
        };
        assert!(matches!(
            InstancePaths::prepare(&config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_named_location() {
        assert!(DatabaseLocation::Named("../escape".into()).resolve().is_err());
        if let Ok(root) = DatabaseLocation::Named("notes".into()).resolve() {
            assert!(root.ends_with("unimem/notes"));
        }
    }

    #[test]
    fn test_toml_config() {
        let config = MemoryConfig::from_toml(
            r#"
            create_if_missing = false

            [location]
            path = "/var/lib/unimem/main"

            [retry]
            max_attempts = 2

            [query]
            strategy = "search_first"
            deadline_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(
            config.location,
            DatabaseLocation::Path(PathBuf::from("/var/lib/unimem/main"))
        );
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.min_delay_ms, RetryConfig::default().min_delay_ms);
        assert_eq!(config.query.strategy, SearchStrategy::SearchFirst);
        assert_eq!(config.query.deadline_ms, Some(500));

        assert_eq!(MemoryConfig::from_toml("").unwrap(), MemoryConfig::default());
    }
}
