use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{
    BlobStore, DocumentMetadata, EmbeddingRecord, EmbeddingStore, MetadataStore, PartIndex,
    ScoredResult, VectorSearch,
};
use crate::error::{CouncilError, CouncilResult};

/// How embeddings are stored in Postgres
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorColumn {
    /// Plain `REAL[]`; similarity is computed in process
    Array,
    /// pgvector `vector` column; similarity is computed by the database
    PgVector,
}

const COMMON_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS council_texts (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        content TEXT NOT NULL,
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
        data JSONB NOT NULL,
        PRIMARY KEY (namespace, key)
    )",
];

const ARRAY_SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS council_embeddings (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        checksum TEXT NOT NULL,
        embedding REAL[] NOT NULL,
        PRIMARY KEY (namespace, key)
    )"];

const PGVECTOR_SCHEMA: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS vector",
    "CREATE TABLE IF NOT EXISTS council_vectors (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        checksum TEXT NOT NULL,
        embedding vector NOT NULL,
        PRIMARY KEY (namespace, key)
    )",
];

/// Format a vector as a pgvector literal: `[0.1,0.2]`
pub fn vector_literal(vector: &[f32]) -> String {
    let items: Vec<String> = vector.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(","))
}

/// Parse the text form of a pgvector value
pub fn parse_vector_literal(text: &str) -> CouncilResult<Vec<f32>> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| CouncilError::Storage(format!("malformed vector literal: {text}")))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<f32>()
                .map_err(|e| CouncilError::Storage(format!("malformed vector component '{item}': {e}")))
        })
        .collect()
}

/// Postgres backend, optionally with pgvector similarity search
pub struct PostgresBackend {
    pool: PgPool,
    namespace: String,
    column: VectorColumn,
}

impl PostgresBackend {
    pub async fn connect(
        dsn: &str,
        namespace: impl Into<String>,
        column: VectorColumn,
    ) -> CouncilResult<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(dsn).await?;
        Self::with_pool(pool, namespace, column).await
    }

    pub async fn with_pool(
        pool: PgPool,
        namespace: impl Into<String>,
        column: VectorColumn,
    ) -> CouncilResult<Self> {
        let vector_schema = match column {
            VectorColumn::Array => ARRAY_SCHEMA,
            VectorColumn::PgVector => PGVECTOR_SCHEMA,
        };
        for statement in COMMON_SCHEMA.iter().chain(vector_schema) {
            sqlx::query(*statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            namespace: namespace.into(),
            column,
        })
    }

    pub fn column(&self) -> VectorColumn {
        self.column
    }

    fn record_from_row(&self, row: &PgRow) -> CouncilResult<EmbeddingRecord> {
        let vector = match self.column {
            VectorColumn::Array => row.get::<Vec<f32>, _>("embedding"),
            VectorColumn::PgVector => parse_vector_literal(&row.get::<String, _>("embedding"))?,
        };
        Ok(EmbeddingRecord::new(
            row.get::<String, _>("key"),
            row.get::<String, _>("checksum"),
            vector,
        ))
    }

    fn select_embeddings(&self) -> &'static str {
        match self.column {
            VectorColumn::Array => {
                "SELECT key, checksum, embedding FROM council_embeddings WHERE namespace = $1"
            }
            VectorColumn::PgVector => {
                "SELECT key, checksum, embedding::text AS embedding FROM council_vectors WHERE namespace = $1"
            }
        }
    }
}

#[async_trait]
impl BlobStore for PostgresBackend {
    async fn get_text(&self, key: &str) -> CouncilResult<Option<String>> {
        let row = sqlx::query("SELECT content FROM council_texts WHERE namespace = $1 AND key = $2")
            .bind(&self.namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("content")))
    }

    async fn put_text(&self, key: &str, text: &str) -> CouncilResult<()> {
        sqlx::query(
            "INSERT INTO council_texts (namespace, key, content) VALUES ($1, $2, $3)
             ON CONFLICT (namespace, key) DO UPDATE SET content = EXCLUDED.content",
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_text(&self, key: &str) -> CouncilResult<()> {
        sqlx::query("DELETE FROM council_texts WHERE namespace = $1 AND key = $2")
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EmbeddingStore for PostgresBackend {
    async fn get_embedding(&self, key: &str) -> CouncilResult<Option<EmbeddingRecord>> {
        let sql = format!("{} AND key = $2", self.select_embeddings());
        let row = sqlx::query(&sql)
            .bind(&self.namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| self.record_from_row(r)).transpose()
    }

    async fn put_embedding(&self, record: EmbeddingRecord) -> CouncilResult<()> {
        match self.column {
            VectorColumn::Array => {
                sqlx::query(
                    "INSERT INTO council_embeddings (namespace, key, checksum, embedding) VALUES ($1, $2, $3, $4)
                     ON CONFLICT (namespace, key) DO UPDATE SET checksum = EXCLUDED.checksum, embedding = EXCLUDED.embedding",
                )
                .bind(&self.namespace)
                .bind(&record.key)
                .bind(&record.checksum)
                .bind(&record.vector)
                .execute(&self.pool)
                .await?;
            }
            VectorColumn::PgVector => {
                sqlx::query(
                    "INSERT INTO council_vectors (namespace, key, checksum, embedding) VALUES ($1, $2, $3, $4::vector)
                     ON CONFLICT (namespace, key) DO UPDATE SET checksum = EXCLUDED.checksum, embedding = EXCLUDED.embedding",
                )
                .bind(&self.namespace)
                .bind(&record.key)
                .bind(&record.checksum)
                .bind(vector_literal(&record.vector))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn remove_embedding(&self, key: &str) -> CouncilResult<()> {
        let sql = match self.column {
            VectorColumn::Array => "DELETE FROM council_embeddings WHERE namespace = $1 AND key = $2",
            VectorColumn::PgVector => "DELETE FROM council_vectors WHERE namespace = $1 AND key = $2",
        };
        sqlx::query(sql)
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_embeddings(&self) -> CouncilResult<Vec<EmbeddingRecord>> {
        let rows = sqlx::query(self.select_embeddings())
            .bind(&self.namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.record_from_row(r)).collect()
    }
}

#[async_trait]
impl VectorSearch for PostgresBackend {
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> CouncilResult<Vec<ScoredResult>> {
        if self.column != VectorColumn::PgVector {
            return Err(CouncilError::Storage(
                "native vector search requires a pgvector column".into(),
            ));
        }
        let rows = sqlx::query(
            "SELECT key, 1 - (embedding <=> $2::vector) AS similarity
             FROM council_vectors
             WHERE namespace = $1 AND 1 - (embedding <=> $2::vector) >= $3
             ORDER BY embedding <=> $2::vector
             LIMIT $4",
        )
        .bind(&self.namespace)
        .bind(vector_literal(query))
        .bind(min_similarity as f64)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| ScoredResult::new(r.get::<String, _>("key"), r.get::<f64, _>("similarity") as f32))
            .collect())
    }
}

#[async_trait]
impl PartIndex for PostgresBackend {
    async fn get_parts(&self, document: &str) -> CouncilResult<Option<Vec<String>>> {
        let rows = sqlx::query(
            "SELECT chunk FROM council_parts WHERE namespace = $1 AND document = $2 ORDER BY position",
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
        sqlx::query("DELETE FROM council_parts WHERE namespace = $1 AND document = $2")
            .bind(&self.namespace)
            .bind(document)
            .execute(&mut *tx)
            .await?;
        for (position, chunk) in parts.iter().enumerate() {
            sqlx::query(
                "INSERT INTO council_parts (namespace, document, position, chunk) VALUES ($1, $2, $3, $4)",
            )
            .bind(&self.namespace)
            .bind(document)
            .bind(position as i32)
            .bind(chunk)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_parts(&self, document: &str) -> CouncilResult<()> {
        sqlx::query("DELETE FROM council_parts WHERE namespace = $1 AND document = $2")
            .bind(&self.namespace)
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn parent_of(&self, chunk: &str) -> CouncilResult<Option<String>> {
        let row = sqlx::query(
            "SELECT document FROM council_parts WHERE namespace = $1 AND chunk = $2 LIMIT 1",
        )
        .bind(&self.namespace)
        .bind(chunk)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("document")))
    }

    async fn documents(&self) -> CouncilResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT document FROM council_parts WHERE namespace = $1 ORDER BY document",
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("document")).collect())
    }
}

#[async_trait]
impl MetadataStore for PostgresBackend {
    async fn get_metadata(&self, key: &str) -> CouncilResult<Option<DocumentMetadata>> {
        let row = sqlx::query("SELECT data::text AS data FROM council_metadata WHERE namespace = $1 AND key = $2")
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
            "INSERT INTO council_metadata (namespace, key, data) VALUES ($1, $2, $3::jsonb)
             ON CONFLICT (namespace, key) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_metadata(&self, key: &str) -> CouncilResult<()> {
        sqlx::query("DELETE FROM council_metadata WHERE namespace = $1 AND key = $2")
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_format() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn parse_vector_literal_accepts_database_output() {
        assert_eq!(parse_vector_literal("[1,-0.5,0.25]").unwrap(), vec![1.0, -0.5, 0.25]);
        assert_eq!(parse_vector_literal(" [ 0.1 , 0.2 ] ").unwrap(), vec![0.1, 0.2]);
        assert!(parse_vector_literal("[]").unwrap().is_empty());
    }

    #[test]
    fn parse_vector_literal_rejects_garbage() {
        assert!(parse_vector_literal("1,2").is_err());
        assert!(parse_vector_literal("[1,x]").is_err());
    }
}
