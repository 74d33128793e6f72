//! File-system backend.
//!
//! Layout under the root folder:
//!
//! ```text
//! <root>/<sanitized key>.txt        raw text blobs
//! <root>/parts.json                 document key -> ordered chunk keys
//! <root>/embeddings.json            chunk key -> { checksum, vector }
//! <root>/metadata/<sanitized>.json  document metadata
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{
    BlobStore, DocumentMetadata, EmbeddingRecord, EmbeddingStore, MetadataStore, PartIndex,
};
use crate::error::CouncilResult;

const PARTS_FILE: &str = "parts.json";
const EMBEDDINGS_FILE: &str = "embeddings.json";
const METADATA_DIR: &str = "metadata";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEmbedding {
    checksum: String,
    vector: Vec<f32>,
}

/// Encode a key into a single portable file name. Unambiguous and reversible.
pub fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b' ' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    // leading dots would hide or escape
    if out.starts_with('.') {
        out.replace_range(..1, "%2E");
    }
    out
}

/// Backend persisting to plain files under a root folder
pub struct FileBackend {
    root: PathBuf,
    parts: RwLock<BTreeMap<String, Vec<String>>>,
    embeddings: RwLock<HashMap<String, StoredEmbedding>>,
}

impl FileBackend {
    /// Open (or create) a backend rooted at `root`, loading both sidecars
    pub async fn open(root: impl Into<PathBuf>) -> CouncilResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(METADATA_DIR)).await?;

        let parts = read_json(&root.join(PARTS_FILE)).await?.unwrap_or_default();
        let embeddings = read_json(&root.join(EMBEDDINGS_FILE))
            .await?
            .unwrap_or_default();

        Ok(Self {
            root,
            parts: RwLock::new(parts),
            embeddings: RwLock::new(embeddings),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.txt", sanitize_key(key)))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(format!("{}.json", sanitize_key(key)))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> CouncilResult<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file so a crash never leaves a torn sidecar
async fn write_json<T: Serialize>(path: &Path, value: &T) -> CouncilResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> CouncilResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl BlobStore for FileBackend {
    async fn get_text(&self, key: &str) -> CouncilResult<Option<String>> {
        match tokio::fs::read_to_string(self.blob_path(key)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_text(&self, key: &str, text: &str) -> CouncilResult<()> {
        tokio::fs::write(self.blob_path(key), text).await?;
        Ok(())
    }

    async fn remove_text(&self, key: &str) -> CouncilResult<()> {
        remove_if_exists(&self.blob_path(key)).await
    }
}

#[async_trait]
impl EmbeddingStore for FileBackend {
    async fn get_embedding(&self, key: &str) -> CouncilResult<Option<EmbeddingRecord>> {
        Ok(self
            .embeddings
            .read()
            .await
            .get(key)
            .map(|e| EmbeddingRecord::new(key, &e.checksum, e.vector.clone())))
    }

    async fn put_embedding(&self, record: EmbeddingRecord) -> CouncilResult<()> {
        let mut embeddings = self.embeddings.write().await;
        embeddings.insert(
            record.key,
            StoredEmbedding {
                checksum: record.checksum,
                vector: record.vector,
            },
        );
        write_json(&self.root.join(EMBEDDINGS_FILE), &*embeddings).await
    }

    async fn remove_embedding(&self, key: &str) -> CouncilResult<()> {
        let mut embeddings = self.embeddings.write().await;
        if embeddings.remove(key).is_some() {
            write_json(&self.root.join(EMBEDDINGS_FILE), &*embeddings).await?;
        }
        Ok(())
    }

    async fn all_embeddings(&self) -> CouncilResult<Vec<EmbeddingRecord>> {
        Ok(self
            .embeddings
            .read()
            .await
            .iter()
            .map(|(key, e)| EmbeddingRecord::new(key, &e.checksum, e.vector.clone()))
            .collect())
    }
}

#[async_trait]
impl PartIndex for FileBackend {
    async fn get_parts(&self, document: &str) -> CouncilResult<Option<Vec<String>>> {
        Ok(self.parts.read().await.get(document).cloned())
    }

    async fn set_parts(&self, document: &str, parts: &[String]) -> CouncilResult<()> {
        let mut index = self.parts.write().await;
        index.insert(document.to_string(), parts.to_vec());
        write_json(&self.root.join(PARTS_FILE), &*index).await
    }

    async fn remove_parts(&self, document: &str) -> CouncilResult<()> {
        let mut index = self.parts.write().await;
        if index.remove(document).is_some() {
            write_json(&self.root.join(PARTS_FILE), &*index).await?;
        }
        Ok(())
    }

    async fn parent_of(&self, chunk: &str) -> CouncilResult<Option<String>> {
        Ok(self
            .parts
            .read()
            .await
            .iter()
            .find(|(_, parts)| parts.iter().any(|p| p == chunk))
            .map(|(doc, _)| doc.clone()))
    }

    async fn documents(&self) -> CouncilResult<Vec<String>> {
        Ok(self.parts.read().await.keys().cloned().collect())
    }
}

#[async_trait]
impl MetadataStore for FileBackend {
    async fn get_metadata(&self, key: &str) -> CouncilResult<Option<DocumentMetadata>> {
        read_json(&self.metadata_path(key)).await
    }

    async fn put_metadata(&self, key: &str, metadata: &DocumentMetadata) -> CouncilResult<()> {
        write_json(&self.metadata_path(key), metadata).await
    }

    async fn remove_metadata(&self, key: &str) -> CouncilResult<()> {
        remove_if_exists(&self.metadata_path(key)).await
    }
}
