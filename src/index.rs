//! In-memory nearest-neighbor index over chunk embeddings.
//!
//! Exact brute-force cosine search. Every query scans all entries, so a
//! rebuild from the durable vector table returns exactly the same answers
//! as the incremental build it replaces; there is no approximation to
//! account for. Providers L2-normalize their output, so the score is also
//! the inner product.
//!
//! Writes for one document are applied under a single write lock
//! ([`VectorIndex::replace_document`]), so a concurrent search sees either
//! all of a document's old chunks or all of its new ones.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::cosine_similarity;
use crate::store::StoredVector;

#[derive(Debug, Clone)]
struct Entry {
    document_id: String,
    vector: Vec<f32>,
}

#[derive(Default)]
pub struct VectorIndex {
    entries: RwLock<HashMap<String, Entry>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from durable vectors.
    pub fn from_vectors(vectors: Vec<StoredVector>) -> Self {
        let index = Self::new();
        index.rebuild(vectors);
        index
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, chunk_id: &str, document_id: &str, vector: Vec<f32>) {
        self.write().insert(
            chunk_id.to_string(),
            Entry {
                document_id: document_id.to_string(),
                vector,
            },
        );
    }

    pub fn remove(&self, chunk_id: &str) -> bool {
        self.write().remove(chunk_id).is_some()
    }

    /// Swap every entry of `document_id` for `vectors` atomically.
    pub fn replace_document(&self, document_id: &str, vectors: Vec<(String, Vec<f32>)>) {
        let mut entries = self.write();
        entries.retain(|_, e| e.document_id != document_id);
        for (chunk_id, vector) in vectors {
            entries.insert(
                chunk_id,
                Entry {
                    document_id: document_id.to_string(),
                    vector,
                },
            );
        }
    }

    pub fn remove_document(&self, document_id: &str) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, e| e.document_id != document_id);
        before - entries.len()
    }

    /// Discard everything and load `vectors`.
    pub fn rebuild(&self, vectors: Vec<StoredVector>) {
        let fresh: HashMap<String, Entry> = vectors
            .into_iter()
            .map(|v| {
                (
                    v.chunk_id,
                    Entry {
                        document_id: v.document_id,
                        vector: v.vector,
                    },
                )
            })
            .collect();
        *self.write() = fresh;
    }

    /// Top `k` chunk ids by descending cosine similarity. Equal scores are
    /// ordered by chunk id so results are stable. An empty index yields an
    /// empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let entries = self.read();
        let mut scored: Vec<(String, f32)> = entries
            .iter()
            .map(|(id, e)| (id.clone(), cosine_similarity(query, &e.vector)))
            .collect();
        drop(entries);

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    /// Similarity between `query` and one indexed chunk, if present.
    pub fn score(&self, chunk_id: &str, query: &[f32]) -> Option<f32> {
        self.read()
            .get(chunk_id)
            .map(|e| cosine_similarity(query, &e.vector))
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read().contains_key(chunk_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
