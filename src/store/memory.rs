//! In-memory [`Store`] for tests and `:memory:` configurations.
//!
//! All state sits behind one `RwLock`, so a document commit is a single
//! critical section and readers see either the old chunks or the new ones.
//! Keyword candidates are found by scanning chunk text.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{HarnessError, Lookup, Result};
use crate::models::{ChunkRecord, DocumentVersion};
use crate::retrieve::tokenize;

use super::{MetadataStore, StagedDocument, Store, StoredVector, VectorStore};

#[derive(Default)]
struct Inner {
    chunks: BTreeMap<String, ChunkRecord>,
    vectors: BTreeMap<String, StoredVector>,
    versions: HashMap<String, Vec<DocumentVersion>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn upsert(&self, record: &ChunkRecord) -> Result<()> {
        self.write()
            .chunks
            .insert(record.chunk_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, chunk_id: &str) -> Result<Lookup<ChunkRecord>> {
        Ok(self.read().chunks.get(chunk_id).cloned().into())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let mut inner = self.write();
        let before = inner.chunks.len();
        inner.chunks.retain(|_, r| r.document_id != document_id);
        Ok(before - inner.chunks.len())
    }

    async fn list_by_tag(&self, tag: &str) -> Result<Vec<ChunkRecord>> {
        Ok(self
            .read()
            .chunks
            .values()
            .filter(|r| r.tags.iter().any(|t| t == tag))
            .cloned()
            .collect())
    }

    async fn chunk_ids(&self) -> Result<Vec<String>> {
        Ok(self.read().chunks.keys().cloned().collect())
    }

    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        Ok(self
            .read()
            .chunks
            .values()
            .filter(|r| r.document_id == document_id)
            .map(|r| r.chunk_id.clone())
            .collect())
    }

    async fn keyword_candidates(&self, terms: &[String], limit: usize) -> Result<Vec<String>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = terms.iter().map(String::as_str).collect();

        let inner = self.read();
        let mut hits: Vec<(usize, &String)> = inner
            .chunks
            .values()
            .filter_map(|r| {
                let tokens = tokenize(&r.text);
                let matched = tokens
                    .iter()
                    .map(String::as_str)
                    .filter(|t| wanted.contains(t))
                    .collect::<HashSet<_>>()
                    .len();
                (matched > 0).then_some((matched, &r.chunk_id))
            })
            .collect();

        hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect())
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn put_vector(&self, chunk_id: &str, document_id: &str, vector: &[f32]) -> Result<()> {
        self.write().vectors.insert(
            chunk_id.to_string(),
            StoredVector {
                chunk_id: chunk_id.to_string(),
                document_id: document_id.to_string(),
                vector: vector.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete_vector(&self, chunk_id: &str) -> Result<()> {
        self.write().vectors.remove(chunk_id);
        Ok(())
    }

    async fn load_vectors(&self) -> Result<Vec<StoredVector>> {
        Ok(self.read().vectors.values().cloned().collect())
    }

    async fn vector_ids(&self) -> Result<Vec<String>> {
        Ok(self.read().vectors.keys().cloned().collect())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn latest_version(&self, document_id: &str) -> Result<Lookup<DocumentVersion>> {
        Ok(self
            .read()
            .versions
            .get(document_id)
            .and_then(|v| v.last())
            .cloned()
            .into())
    }

    async fn documents(&self) -> Result<Vec<DocumentVersion>> {
        let inner = self.read();
        let live: HashSet<&str> = inner
            .chunks
            .values()
            .map(|r| r.document_id.as_str())
            .collect();
        let mut docs: Vec<DocumentVersion> = inner
            .versions
            .iter()
            .filter(|(id, _)| live.contains(id.as_str()))
            .filter_map(|(_, versions)| versions.last().cloned())
            .collect();
        docs.sort_by(|a, b| a.document.id.cmp(&b.document.id));
        Ok(docs)
    }

    async fn commit_document(
        &self,
        staged: &StagedDocument,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        if cancel.is_cancelled() {
            return Err(HarnessError::Cancelled {
                operation: format!("ingest of {}", staged.document.id),
            });
        }

        let doc_id = staged.document.id.as_str();
        let mut inner = self.write();

        inner.chunks.retain(|_, r| r.document_id != doc_id);
        inner.vectors.retain(|_, v| v.document_id != doc_id);

        for (record, vector) in staged.records.iter().zip(staged.vectors.iter()) {
            inner.chunks.insert(record.chunk_id.clone(), record.clone());
            inner.vectors.insert(
                record.chunk_id.clone(),
                StoredVector {
                    chunk_id: record.chunk_id.clone(),
                    document_id: doc_id.to_string(),
                    vector: vector.clone(),
                },
            );
        }

        let versions = inner.versions.entry(doc_id.to_string()).or_default();
        let version = versions.last().map(|v| v.version + 1).unwrap_or(1);
        versions.push(DocumentVersion {
            document: staged.document.clone(),
            version,
            content_hash: staged.content_hash.clone(),
        });

        Ok(version)
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let mut inner = self.write();
        let before = inner.chunks.len();
        inner.chunks.retain(|_, r| r.document_id != document_id);
        inner.vectors.retain(|_, v| v.document_id != document_id);
        Ok(before - inner.chunks.len())
    }
}
