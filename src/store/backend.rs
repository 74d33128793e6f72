use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::{
    BlobStore, EmbeddingStore, FileBackend, MemoryBackend, MetadataStore, PartIndex,
    PostgresBackend, SqliteBackend, VectorColumn, VectorSearch,
};
use crate::error::{CouncilError, CouncilResult};

/// Parsed connection spec:
/// `memory:`, `sqlite:<path>`, `postgres:<dsn>`, `pgvector:<dsn>`, or a bare path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    Memory,
    File(PathBuf),
    Sqlite(PathBuf),
    Postgres(String),
    PgVector(String),
}

impl FromStr for BackendSpec {
    type Err = CouncilError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(CouncilError::Config("empty store connection".into()));
        }

        let Some((scheme, rest)) = spec.split_once(':') else {
            return Ok(BackendSpec::File(PathBuf::from(spec)));
        };

        let require = |what: &str| {
            if rest.is_empty() {
                Err(CouncilError::Config(format!("{scheme}: backend needs a {what}")))
            } else {
                Ok(rest.to_string())
            }
        };

        match scheme.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendSpec::Memory),
            "sqlite" => Ok(BackendSpec::Sqlite(PathBuf::from(require("path")?))),
            // a bare postgres:// URL is a DSN, not a scheme prefix
            "postgres" | "postgresql" if rest.starts_with("//") => {
                Ok(BackendSpec::Postgres(spec.to_string()))
            }
            "postgres" | "postgresql" => Ok(BackendSpec::Postgres(require("connection string")?)),
            "pgvector" => Ok(BackendSpec::PgVector(require("connection string")?)),
            // anything else, drive letters included, is a file path
            _ => Ok(BackendSpec::File(PathBuf::from(spec))),
        }
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSpec::Memory => write!(f, "memory"),
            BackendSpec::File(path) => write!(f, "file:{}", path.display()),
            BackendSpec::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
            BackendSpec::Postgres(_) => write!(f, "postgres"),
            BackendSpec::PgVector(_) => write!(f, "pgvector"),
        }
    }
}

impl BackendSpec {
    /// Connect the backend. `namespace` scopes rows in shared databases.
    pub async fn open(&self, namespace: &str) -> CouncilResult<StorageBackend> {
        match self {
            BackendSpec::Memory => Ok(StorageBackend::memory()),
            BackendSpec::File(path) => Ok(StorageBackend::uniform(Arc::new(
                FileBackend::open(path).await?,
            ))),
            BackendSpec::Sqlite(path) => Ok(StorageBackend::uniform(Arc::new(
                SqliteBackend::open(path, namespace).await?,
            ))),
            BackendSpec::Postgres(dsn) => Ok(StorageBackend::uniform(Arc::new(
                PostgresBackend::connect(dsn, namespace, VectorColumn::Array).await?,
            ))),
            BackendSpec::PgVector(dsn) => {
                let backend =
                    Arc::new(PostgresBackend::connect(dsn, namespace, VectorColumn::PgVector).await?);
                Ok(StorageBackend::uniform(backend.clone()).with_vector_search(backend))
            }
        }
    }
}

/// The four storage primitives a document store is composed from
#[derive(Clone)]
pub struct StorageBackend {
    pub blobs: Arc<dyn BlobStore>,
    pub embeddings: Arc<dyn EmbeddingStore>,
    pub parts: Arc<dyn PartIndex>,
    pub metadata: Arc<dyn MetadataStore>,
    pub vector_search: Option<Arc<dyn VectorSearch>>,
}

impl StorageBackend {
    /// One object serving every primitive
    pub fn uniform<B>(backend: Arc<B>) -> Self
    where
        B: BlobStore + EmbeddingStore + PartIndex + MetadataStore + 'static,
    {
        Self {
            blobs: backend.clone(),
            embeddings: backend.clone(),
            parts: backend.clone(),
            metadata: backend,
            vector_search: None,
        }
    }

    pub fn memory() -> Self {
        Self::uniform(Arc::new(MemoryBackend::new()))
    }

    pub fn with_vector_search(mut self, search: Arc<dyn VectorSearch>) -> Self {
        self.vector_search = Some(search);
        self
    }
}
