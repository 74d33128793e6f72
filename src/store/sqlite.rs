use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{
    BlobStore, DocumentMetadata, EmbeddingRecord, EmbeddingStore, MetadataStore, PartIndex,
};
use crate::error::CouncilResult;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS council_texts (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        content TEXT NOT NULL,
        PRIMARY KEY (namespace, key)
    )",
    "CREATE TABLE IF NOT EXISTS council_embeddings (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        checksum TEXT NOT NULL,
        vector TEXT NOT NULL,
        PRIMARY KEY (namespace, key)
    )",
    "CREATE TABLE IF NOT EXISTS council_parts (
        namespace TEXT NOT NULL,
        document TEXT NOT NULL,
        position INTEGER NOT NULL,
        chunk TEXT NOT NULL,
        PRIMARY KEY (namespace, document, position)
    )",
    "CREATE INDEX IF NOT EXISTS council_parts_chunk ON council_parts (namespace, chunk)",
    "CREATE TABLE IF NOT EXISTS council_metadata (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (namespace, key)
    )",
];

/// SQLite backend. Several stores can share one database file; rows are
/// scoped by namespace (the store name).
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteBackend {
    pub async fn open(path: impl AsRef<Path>, namespace: impl Into<String>) -> CouncilResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, namespace).await
    }

    pub async fn with_pool(pool: SqlitePool, namespace: impl Into<String>) -> CouncilResult<Self> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            namespace: namespace.into(),
        })
    }
}

#[async_trait]
impl BlobStore for SqliteBackend {
    async fn get_text(&self, key: &str) -> CouncilResult<Option<String>> {
        let row = sqlx::query("SELECT content FROM council_texts WHERE namespace = ?1 AND key = ?2")
            .bind(&self.namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("content")))
    }

    async fn put_text(&self, key: &str, text: &str) -> CouncilResult<()> {
        sqlx::query(
            "INSERT INTO council_texts (namespace, key, content) VALUES (?1, ?2, ?3)
             ON CONFLICT (namespace, key) DO UPDATE SET content = excluded.content",
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_text(&self, key: &str) -> CouncilResult<()> {
        sqlx::query("DELETE FROM council_texts WHERE namespace = ?1 AND key = ?2")
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> CouncilResult<EmbeddingRecord> {
    let vector: String = row.get("vector");
    Ok(EmbeddingRecord::new(
        row.get::<String, _>("key"),
        row.get::<String, _>("checksum"),
        serde_json::from_str(&vector)?,
    ))
}

#[async_trait]
impl EmbeddingStore for SqliteBackend {
    async fn get_embedding(&self, key: &str) -> CouncilResult<Option<EmbeddingRecord>> {
        let row = sqlx::query(
            "SELECT key, checksum, vector FROM council_embeddings WHERE namespace = ?1 AND key = ?2",
        )
        .bind(&self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn put_embedding(&self, record: EmbeddingRecord) -> CouncilResult<()> {
        let vector = serde_json::to_string(&record.vector)?;
        sqlx::query(
            "INSERT INTO council_embeddings (namespace, key, checksum, vector) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (namespace, key) DO UPDATE SET checksum = excluded.checksum, vector = excluded.vector",
        )
        .bind(&self.namespace)
        .bind(&record.key)
        .bind(&record.checksum)
        .bind(vector)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_embedding(&self, key: &str) -> CouncilResult<()> {
        sqlx::query("DELETE FROM council_embeddings WHERE namespace = ?1 AND key = ?2")
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_embeddings(&self) -> CouncilResult<Vec<EmbeddingRecord>> {
        let rows = sqlx::query("SELECT key, checksum, vector FROM council_embeddings WHERE namespace = ?1")
            .bind(&self.namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl PartIndex for SqliteBackend {
    async fn get_parts(&self, document: &str) -> CouncilResult<Option<Vec<String>>> {
        let rows = sqlx::query(
            "SELECT chunk FROM council_parts WHERE namespace = ?1 AND document = ?2 ORDER BY position",
        )
        .bind(&self.namespace)
        .bind(document)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.iter().map(|r| r.get("chunk")).collect()))
    }

    async fn set_parts(&self, document: &str, parts: &[String]) -> CouncilResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM council_parts WHERE namespace = ?1 AND document = ?2")
            .bind(&self.namespace)
            .bind(document)
            .execute(&mut *tx)
            .await?;
        for (position, chunk) in parts.iter().enumerate() {
            sqlx::query(
                "INSERT INTO council_parts (namespace, document, position, chunk) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&self.namespace)
            .bind(document)
            .bind(position as i64)
            .bind(chunk)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_parts(&self, document: &str) -> CouncilResult<()> {
        sqlx::query("DELETE FROM council_parts WHERE namespace = ?1 AND document = ?2")
            .bind(&self.namespace)
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn parent_of(&self, chunk: &str) -> CouncilResult<Option<String>> {
        let row = sqlx::query(
            "SELECT document FROM council_parts WHERE namespace = ?1 AND chunk = ?2 LIMIT 1",
        )
        .bind(&self.namespace)
        .bind(chunk)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("document")))
    }

    async fn documents(&self) -> CouncilResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT document FROM council_parts WHERE namespace = ?1 ORDER BY document",
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("document")).collect())
    }
}

#[async_trait]
impl MetadataStore for SqliteBackend {
    async fn get_metadata(&self, key: &str) -> CouncilResult<Option<DocumentMetadata>> {
        let row = sqlx::query("SELECT data FROM council_metadata WHERE namespace = ?1 AND key = ?2")
            .bind(&self.namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn put_metadata(&self, key: &str, metadata: &DocumentMetadata) -> CouncilResult<()> {
        let data = serde_json::to_string(metadata)?;
        sqlx::query(
            "INSERT INTO council_metadata (namespace, key, data) VALUES (?1, ?2, ?3)
             ON CONFLICT (namespace, key) DO UPDATE SET data = excluded.data",
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_metadata(&self, key: &str) -> CouncilResult<()> {
        sqlx::query("DELETE FROM council_metadata WHERE namespace = ?1 AND key = ?2")
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
