//! Ingestion pipeline: document → chunks → vectors → store + index.
//!
//! For one document the steps run in a fixed order:
//!
//! 1. Validate the id and text.
//! 2. Skip the document if its latest stored version has identical
//!    content, tags, and topic (re-ingest is a no-op).
//! 3. Chunk the text.
//! 4. Embed every chunk. Any embedding failure aborts before a single write.
//! 5. Commit: one store transaction removes the document's old chunks from
//!    both tables and writes the new ones.
//! 6. Swap the document's entries in the in-memory index.
//!
//! Ingests of the same document id are serialized through a per-id lock;
//! different documents proceed concurrently up to `ingest_concurrency`.

use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::error::{HarnessError, Lookup, Result};
use crate::index::VectorIndex;
use crate::models::{ChunkRecord, Document};
use crate::store::{StagedDocument, Store};

/// What an ingest did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Indexed {
        document_id: String,
        version: i64,
        chunks: usize,
    },
    Unchanged {
        document_id: String,
    },
}

impl IngestOutcome {
    pub fn document_id(&self) -> &str {
        match self {
            IngestOutcome::Indexed { document_id, .. }
            | IngestOutcome::Unchanged { document_id } => document_id,
        }
    }
}

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    ingest_concurrency: usize,
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        ingest_concurrency: usize,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            chunking,
            ingest_concurrency: ingest_concurrency.max(1),
            doc_locks: DashMap::new(),
        }
    }

    /// Ingest one document and return its id.
    pub async fn ingest(&self, doc: Document) -> Result<String> {
        let outcome = self.ingest_with(doc, &CancellationToken::new()).await?;
        Ok(outcome.document_id().to_string())
    }

    pub async fn ingest_with(
        &self,
        doc: Document,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        validate(&doc)?;

        let lock = self.lock_for(&doc.id);
        let outcome = {
            let _guard = lock.lock().await;
            self.ingest_locked(doc.clone(), cancel).await
        };
        drop(lock);
        self.release_lock(&doc.id);
        outcome
    }

    /// Ingest many documents concurrently. Results come back in input
    /// order; one failure does not stop the others.
    pub async fn ingest_many(
        &self,
        docs: Vec<Document>,
        cancel: &CancellationToken,
    ) -> Vec<Result<IngestOutcome>> {
        stream::iter(docs)
            .map(|doc| self.ingest_with(doc, cancel))
            .buffered(self.ingest_concurrency)
            .collect()
            .await
    }

    /// Remove a document's chunks from the store and the index.
    pub async fn delete(&self, document_id: &str) -> Result<usize> {
        let lock = self.lock_for(document_id);
        let removed = {
            let _guard = lock.lock().await;
            let removed = self.store.remove_document(document_id).await?;
            self.index.remove_document(document_id);
            removed
        };
        drop(lock);
        self.release_lock(document_id);
        tracing::info!(document_id, chunks = removed, "document removed");
        Ok(removed)
    }

    async fn ingest_locked(
        &self,
        doc: Document,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        let content_hash = doc.content_hash();

        if let Lookup::Found(latest) = self.store.latest_version(&doc.id).await? {
            let prev = &latest.document;
            let has_chunks = !self.store.document_chunk_ids(&doc.id).await?.is_empty();
            if latest.content_hash == content_hash
                && prev.tags == doc.tags
                && prev.topic == doc.topic
                && has_chunks
            {
                tracing::debug!(document_id = %doc.id, "content unchanged, skipping");
                return Ok(IngestOutcome::Unchanged { document_id: doc.id });
            }
        }

        let chunks = chunk_text(
            &doc.id,
            &doc.text,
            self.chunking.chunk_size,
            self.chunking.overlap,
        );
        tracing::debug!(document_id = %doc.id, chunks = chunks.len(), "chunked");

        if cancel.is_cancelled() {
            return Err(cancelled(&doc.id));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await.map_err(|e| match e {
            HarnessError::EmbeddingFailure { reason, .. } => {
                HarnessError::embedding(format!("ingest of {}", doc.id), reason)
            }
            other => HarnessError::embedding(format!("ingest of {}", doc.id), other),
        })?;
        if vectors.len() != chunks.len() {
            return Err(HarnessError::embedding(
                format!("ingest of {}", doc.id),
                format!("{} vectors for {} chunks", vectors.len(), chunks.len()),
            ));
        }

        let staged = StagedDocument {
            records: chunks
                .iter()
                .map(|c| ChunkRecord::from_chunk(c, &doc))
                .collect(),
            vectors,
            content_hash,
            document: doc,
        };

        let version = self.store.commit_document(&staged, cancel).await?;

        let document_id = staged.document.id.clone();
        let entries = staged
            .records
            .iter()
            .map(|r| r.chunk_id.clone())
            .zip(staged.vectors)
            .collect();
        self.index.replace_document(&document_id, entries);

        tracing::info!(
            document_id = %document_id,
            version,
            chunks = staged.records.len(),
            "document indexed"
        );

        Ok(IngestOutcome::Indexed {
            document_id,
            version,
            chunks: staged.records.len(),
        })
    }

    fn lock_for(&self, document_id: &str) -> Arc<Mutex<()>> {
        self.doc_locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock once nobody else holds or waits on it.
    fn release_lock(&self, document_id: &str) {
        self.doc_locks
            .remove_if(document_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn validate(doc: &Document) -> Result<()> {
    if doc.id.trim().is_empty() {
        return Err(HarnessError::InvalidDocument {
            id: doc.id.clone(),
            reason: "document id is empty".into(),
        });
    }
    if doc.text.trim().is_empty() {
        return Err(HarnessError::InvalidDocument {
            id: doc.id.clone(),
            reason: "document text is empty".into(),
        });
    }
    Ok(())
}

fn cancelled(document_id: &str) -> HarnessError {
    HarnessError::Cancelled {
        operation: format!("ingest of {}", document_id),
    }
}
