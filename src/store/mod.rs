//! Document store.
//!
//! Text, embeddings, the part index and document metadata live behind four
//! storage traits so any backend can be combined with the same chunking,
//! checksum-gated embedding and ranked retrieval logic.

mod backend;
mod chunking;
mod file;
mod memory;
mod postgres;
mod retrieval;
mod retry;
mod sqlite;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CouncilError, CouncilResult};
use crate::provider::LlmClient;

pub use backend::{BackendSpec, StorageBackend};
pub use chunking::{chunk_text, metadata_key, part_key, ChunkPolicy};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use postgres::{PostgresBackend, VectorColumn};
pub use retrieval::{
    cosine_similarity, select_within_budget, RetrievalConfig, ScoredResult, SearchStrategy,
};
pub use retry::RetryPolicy;
pub use sqlite::SqliteBackend;

const QUERY_CACHE_LIMIT: usize = 256;

/// Hex SHA-256 of a text
pub fn checksum(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ─── Records ────────────────────────────────────────────────────────────────

/// Descriptive data for one stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub path: String,
    pub content_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl DocumentMetadata {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content_type: content_type_for(&path).to_string(),
            path,
            size: 0,
            created_at: Utc::now(),
            tags: BTreeMap::new(),
            binary: false,
            summary: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Human-readable block stored as the document's metadata chunk
    pub fn render(&self) -> String {
        let mut out = format!(
            "Document: {}\nId: {}\nContent type: {}\nSize: {} bytes\nCreated: {}\nBinary: {}\n",
            self.path,
            self.id,
            self.content_type,
            self.size,
            self.created_at.to_rfc3339(),
            if self.binary { "yes" } else { "no" },
        );
        if let Some(summary) = &self.summary {
            out.push_str(&format!("Summary: {summary}\n"));
        }
        if !self.tags.is_empty() {
            out.push_str("Tags:\n");
            for (k, v) in &self.tags {
                out.push_str(&format!("  {k}: {v}\n"));
            }
        }
        out
    }
}

fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("md") | Some("markdown") => "text/markdown",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("rs") => "text/x-rust",
        Some("py") => "text/x-python",
        Some("ts") | Some("js") => "text/javascript",
        Some("csv") => "text/csv",
        Some("toml") | Some("yaml") | Some("yml") => "text/x-config",
        _ => "text/plain",
    }
}

/// Embedding of one chunk plus the checksum of the text it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub key: String,
    pub checksum: String,
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    pub fn new(key: impl Into<String>, checksum: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            key: key.into(),
            checksum: checksum.into(),
            vector,
        }
    }
}

// ─── Storage traits ─────────────────────────────────────────────────────────

/// Raw text by key. A missing key is `None`, not an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_text(&self, key: &str) -> CouncilResult<Option<String>>;
    async fn put_text(&self, key: &str, text: &str) -> CouncilResult<()>;
    async fn remove_text(&self, key: &str) -> CouncilResult<()>;
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn get_embedding(&self, key: &str) -> CouncilResult<Option<EmbeddingRecord>>;
    async fn put_embedding(&self, record: EmbeddingRecord) -> CouncilResult<()>;
    async fn remove_embedding(&self, key: &str) -> CouncilResult<()>;
    async fn all_embeddings(&self) -> CouncilResult<Vec<EmbeddingRecord>>;
}

/// Document key → ordered chunk keys, with reverse lookup
#[async_trait]
pub trait PartIndex: Send + Sync {
    async fn get_parts(&self, document: &str) -> CouncilResult<Option<Vec<String>>>;
    async fn set_parts(&self, document: &str, parts: &[String]) -> CouncilResult<()>;
    async fn remove_parts(&self, document: &str) -> CouncilResult<()>;
    async fn parent_of(&self, chunk: &str) -> CouncilResult<Option<String>>;
    async fn documents(&self) -> CouncilResult<Vec<String>>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_metadata(&self, key: &str) -> CouncilResult<Option<DocumentMetadata>>;
    async fn put_metadata(&self, key: &str, metadata: &DocumentMetadata) -> CouncilResult<()>;
    async fn remove_metadata(&self, key: &str) -> CouncilResult<()>;
}

/// Backend-native similarity search
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Up to `top_k` chunk keys scoring at least `min_similarity`, best first
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> CouncilResult<Vec<ScoredResult>>;
}

/// Turns text into an embedding vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> CouncilResult<Vec<f32>>;
}

/// Embedder backed by an LLM client
pub struct ClientEmbedder(pub Arc<dyn LlmClient>);

#[async_trait]
impl Embedder for ClientEmbedder {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> CouncilResult<Vec<f32>> {
        self.0.generate_embedding(text, cancel).await
    }
}

// ─── Document store ─────────────────────────────────────────────────────────

/// Path of `key` below `folder`, or `None` when it lives elsewhere.
/// `docs` matches `docs/a.md` but not `docs2/a.md`.
fn folder_relative<'a>(key: &'a str, folder: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(folder)?;
    if folder.is_empty() || folder.ends_with(['/', '\\']) {
        return Some(rest);
    }
    if rest.is_empty() || rest.starts_with(['/', '\\']) {
        return Some(rest.trim_start_matches(['/', '\\']));
    }
    None
}

/// Chunked, checksum-gated, embeddable document storage
pub struct DocumentStore {
    name: String,
    backend: StorageBackend,
    embedder: Arc<dyn Embedder>,
    strategy: SearchStrategy,
    chunking: ChunkPolicy,
    retrieval: RetrievalConfig,
    retry: RetryPolicy,
    query_cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl DocumentStore {
    /// Build a store; the search strategy follows the backend's capabilities
    pub fn new(name: impl Into<String>, backend: StorageBackend, embedder: Arc<dyn Embedder>) -> Self {
        let strategy = match &backend.vector_search {
            Some(search) => SearchStrategy::Native(search.clone()),
            None => SearchStrategy::Scan,
        };
        Self {
            name: name.into(),
            backend,
            embedder,
            strategy,
            chunking: ChunkPolicy::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryPolicy::default(),
            query_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Open a store from a connection spec such as `sqlite:docs.db`
    pub async fn open(
        name: impl Into<String>,
        connection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> CouncilResult<Self> {
        let name = name.into();
        let spec: BackendSpec = connection.parse()?;
        let backend = spec.open(&name).await?;
        tracing::info!(store = %name, backend = %spec, "document store opened");
        Ok(Self::new(name, backend, embedder))
    }

    pub fn with_chunking(mut self, chunking: ChunkPolicy) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &SearchStrategy {
        &self.strategy
    }

    pub fn retrieval(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// Store a document: text and metadata are always rewritten, chunks are
    /// re-embedded only when their checksum changed.
    pub async fn store(
        &self,
        key: &str,
        content: &str,
        metadata: Option<DocumentMetadata>,
        split: bool,
        cancel: &CancellationToken,
    ) -> CouncilResult<()> {
        let existing = self.backend.metadata.get_metadata(key).await?;
        let mut metadata = match (metadata, existing) {
            (Some(metadata), _) => metadata,
            (None, Some(existing)) => existing,
            (None, None) => DocumentMetadata::new(key),
        };
        metadata.size = content.len() as u64;

        self.backend.blobs.put_text(key, content).await?;
        self.backend.metadata.put_metadata(key, &metadata).await?;

        let meta_key = metadata_key(key);
        let meta_text = metadata.render();
        self.backend.blobs.put_text(&meta_key, &meta_text).await?;
        self.embed_if_changed(&meta_key, &meta_text, cancel).await?;

        let mut parts = vec![meta_key];
        if split && self.chunking.needs_split(content) {
            for (i, chunk) in chunk_text(content, self.chunking.max_chars).iter().enumerate() {
                let chunk_key = part_key(key, i + 1);
                self.backend.blobs.put_text(&chunk_key, chunk).await?;
                self.embed_if_changed(&chunk_key, chunk, cancel).await?;
                parts.push(chunk_key);
            }
        } else {
            self.embed_if_changed(key, content, cancel).await?;
            parts.push(key.to_string());
        }

        if let Some(previous) = self.backend.parts.get_parts(key).await? {
            let current: HashSet<&String> = parts.iter().collect();
            for stale in previous.iter().filter(|p| !current.contains(p)) {
                self.backend.embeddings.remove_embedding(stale).await?;
                if stale != key {
                    self.backend.blobs.remove_text(stale).await?;
                }
            }
        }
        self.backend.parts.set_parts(key, &parts).await?;

        tracing::debug!(store = %self.name, key, chunks = parts.len() - 1, "document stored");
        Ok(())
    }

    /// Embed `text` under `key` unless the stored checksum already matches.
    /// Returns whether a new embedding was generated.
    async fn embed_if_changed(
        &self,
        key: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<bool> {
        let sum = checksum(text);
        if let Some(record) = self.backend.embeddings.get_embedding(key).await? {
            if record.checksum == sum {
                return Ok(false);
            }
        }

        let vector = self
            .retry
            .run("generate embedding", cancel, || self.embedder.embed(text, cancel))
            .await?;
        self.backend
            .embeddings
            .put_embedding(EmbeddingRecord::new(key, sum, vector))
            .await?;
        Ok(true)
    }

    pub async fn get(&self, key: &str) -> CouncilResult<Option<String>> {
        self.backend.blobs.get_text(key).await
    }

    /// Raw text of a single chunk key
    pub async fn get_chunk(&self, key: &str) -> CouncilResult<Option<String>> {
        self.backend.blobs.get_text(key).await
    }

    pub async fn get_metadata(&self, key: &str) -> CouncilResult<Option<DocumentMetadata>> {
        self.backend.metadata.get_metadata(key).await
    }

    pub async fn get_parts(&self, key: &str) -> CouncilResult<Option<Vec<String>>> {
        self.backend.parts.get_parts(key).await
    }

    /// Document a chunk key belongs to
    pub async fn get_parent_document(&self, chunk: &str) -> CouncilResult<Option<String>> {
        self.backend.parts.parent_of(chunk).await
    }

    /// Delete a document with its metadata, chunks and embeddings
    pub async fn remove(&self, key: &str) -> CouncilResult<()> {
        let parts = self.backend.parts.get_parts(key).await?.unwrap_or_default();
        for part in &parts {
            self.backend.embeddings.remove_embedding(part).await?;
            if part != key {
                self.backend.blobs.remove_text(part).await?;
            }
        }
        self.backend.embeddings.remove_embedding(key).await?;
        self.backend.blobs.remove_text(key).await?;
        self.backend.metadata.remove_metadata(key).await?;
        self.backend.parts.remove_parts(key).await?;

        tracing::debug!(store = %self.name, key, "document removed");
        Ok(())
    }

    /// Store under `new_key`, then remove `key`. Not atomic: an interruption
    /// between the two steps leaves both keys present.
    pub async fn move_document(
        &self,
        key: &str,
        new_key: &str,
        split: bool,
        cancel: &CancellationToken,
    ) -> CouncilResult<()> {
        let content = self
            .get(key)
            .await?
            .ok_or_else(|| CouncilError::Storage(format!("document '{key}' not found")))?;
        if key == new_key {
            return Ok(());
        }
        let metadata = self.get_metadata(key).await?.map(|mut m| {
            m.path = new_key.to_string();
            m
        });

        self.store(new_key, &content, metadata, split, cancel).await?;
        self.remove(key).await
    }

    /// Document keys under `folder`. Non-recursive listings skip keys with a
    /// path separator after the prefix.
    pub async fn list(&self, folder: &str, recursive: bool) -> CouncilResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .backend
            .parts
            .documents()
            .await?
            .into_iter()
            .filter(|key| match folder_relative(key, folder) {
                Some(rest) => recursive || !rest.contains(['/', '\\']),
                None => false,
            })
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn query_embedding(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<Vec<f32>> {
        let query = retrieval::truncate_query(query, self.retrieval.max_query_chars);
        let sum = checksum(query);
        if let Some(vector) = self.query_cache.lock().await.get(&sum) {
            return Ok(vector.clone());
        }

        let vector = self
            .retry
            .run("generate query embedding", cancel, || self.embedder.embed(query, cancel))
            .await?;

        let mut cache = self.query_cache.lock().await;
        if cache.len() >= QUERY_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(sum, vector.clone());
        Ok(vector)
    }

    /// Every candidate chunk for `query`, best first, with parent and text
    /// attached. No token budget is applied.
    pub async fn embeddings(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<Vec<ScoredResult>> {
        let vector = self.query_embedding(query, cancel).await?;

        let ranked = match &self.strategy {
            SearchStrategy::Native(search) => {
                search
                    .search(&vector, self.retrieval.top_k, self.retrieval.min_similarity)
                    .await?
            }
            SearchStrategy::Scan => {
                let records = self.backend.embeddings.all_embeddings().await?;
                retrieval::scan(&vector, &records)
            }
        };

        let mut results = Vec::with_capacity(ranked.len());
        for mut hit in ranked {
            let Some(text) = self.backend.blobs.get_text(&hit.key).await? else {
                continue;
            };
            hit.parent = self.backend.parts.parent_of(&hit.key).await?;
            hit.text = Some(text);
            results.push(hit);
        }
        retrieval::sort_descending(&mut results);
        Ok(results)
    }

    /// Ranked chunks for `query` that fit the token budget
    pub async fn relevant_items(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> CouncilResult<Vec<ScoredResult>> {
        let candidates = self.embeddings(query, cancel).await?;
        Ok(select_within_budget(candidates, self.retrieval.token_budget))
    }
}
