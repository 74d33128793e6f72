use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    BlobStore, DocumentMetadata, EmbeddingRecord, EmbeddingStore, MetadataStore, PartIndex,
};
use crate::error::CouncilResult;

#[derive(Default)]
struct Parts {
    forward: HashMap<String, Vec<String>>,
    reverse: HashMap<String, String>,
}

/// Process-local backend; everything is lost on drop
#[derive(Default)]
pub struct MemoryBackend {
    texts: RwLock<HashMap<String, String>>,
    embeddings: RwLock<HashMap<String, EmbeddingRecord>>,
    parts: RwLock<Parts>,
    metadata: RwLock<HashMap<String, DocumentMetadata>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn get_text(&self, key: &str) -> CouncilResult<Option<String>> {
        Ok(self.texts.read().await.get(key).cloned())
    }

    async fn put_text(&self, key: &str, text: &str) -> CouncilResult<()> {
        self.texts.write().await.insert(key.to_string(), text.to_string());
        Ok(())
    }

    async fn remove_text(&self, key: &str) -> CouncilResult<()> {
        self.texts.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl EmbeddingStore for MemoryBackend {
    async fn get_embedding(&self, key: &str) -> CouncilResult<Option<EmbeddingRecord>> {
        Ok(self.embeddings.read().await.get(key).cloned())
    }

    async fn put_embedding(&self, record: EmbeddingRecord) -> CouncilResult<()> {
        self.embeddings.write().await.insert(record.key.clone(), record);
        Ok(())
    }

    async fn remove_embedding(&self, key: &str) -> CouncilResult<()> {
        self.embeddings.write().await.remove(key);
        Ok(())
    }

    async fn all_embeddings(&self) -> CouncilResult<Vec<EmbeddingRecord>> {
        Ok(self.embeddings.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl PartIndex for MemoryBackend {
    async fn get_parts(&self, document: &str) -> CouncilResult<Option<Vec<String>>> {
        Ok(self.parts.read().await.forward.get(document).cloned())
    }

    async fn set_parts(&self, document: &str, parts: &[String]) -> CouncilResult<()> {
        let mut index = self.parts.write().await;
        if let Some(old) = index.forward.remove(document) {
            for chunk in old {
                index.reverse.remove(&chunk);
            }
        }
        for chunk in parts {
            index.reverse.insert(chunk.clone(), document.to_string());
        }
        index.forward.insert(document.to_string(), parts.to_vec());
        Ok(())
    }

    async fn remove_parts(&self, document: &str) -> CouncilResult<()> {
        let mut index = self.parts.write().await;
        if let Some(old) = index.forward.remove(document) {
            for chunk in old {
                index.reverse.remove(&chunk);
            }
        }
        Ok(())
    }

    async fn parent_of(&self, chunk: &str) -> CouncilResult<Option<String>> {
        Ok(self.parts.read().await.reverse.get(chunk).cloned())
    }

    async fn documents(&self) -> CouncilResult<Vec<String>> {
        Ok(self.parts.read().await.forward.keys().cloned().collect())
    }
}

#[async_trait]
impl MetadataStore for MemoryBackend {
    async fn get_metadata(&self, key: &str) -> CouncilResult<Option<DocumentMetadata>> {
        Ok(self.metadata.read().await.get(key).cloned())
    }

    async fn put_metadata(&self, key: &str, metadata: &DocumentMetadata) -> CouncilResult<()> {
        self.metadata
            .write()
            .await
            .insert(key.to_string(), metadata.clone());
        Ok(())
    }

    async fn remove_metadata(&self, key: &str) -> CouncilResult<()> {
        self.metadata.write().await.remove(key);
        Ok(())
    }
}
