//! Durable storage for chunk metadata, chunk vectors, and document versions.
//!
//! Two contracts live side by side, both keyed by chunk id:
//!
//! - [`MetadataStore`]: one [`ChunkRecord`] per chunk.
//! - [`VectorStore`]: the durable vector artifact the in-memory
//!   [`VectorIndex`](crate::index::VectorIndex) is loaded from.
//!
//! [`Store`] ties them together and adds the document-level operations the
//! ingestion pipeline needs. [`Store::commit_document`] is the only way a
//! document's chunks change in bulk: old chunks are removed and new ones
//! written in both tables inside one transaction, so a reader never sees a
//! chunk with metadata but no vector (or the reverse) because of an ingest.
//!
//! Backends:
//!
//! | Type | Use |
//! |------|-----|
//! | [`SqliteStore`] | Default; the `[db] path` file. |
//! | [`InMemoryStore`] | Tests and `:memory:` configs. |

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Lookup, Result};
use crate::models::{ChunkRecord, Document, DocumentVersion};

/// Chunk-id-keyed metadata rows.
///
/// Writes are atomic per chunk id; concurrent upserts to the same id are
/// serialized and the last writer wins.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert(&self, record: &ChunkRecord) -> Result<()>;

    async fn get(&self, chunk_id: &str) -> Result<Lookup<ChunkRecord>>;

    /// Remove every chunk row of a document, all or nothing. Returns the
    /// number of rows removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    /// Records carrying `tag`, ordered by chunk id.
    async fn list_by_tag(&self, tag: &str) -> Result<Vec<ChunkRecord>>;

    /// Every chunk id with a metadata row.
    async fn chunk_ids(&self) -> Result<Vec<String>>;

    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>>;

    /// Up to `limit` chunk ids whose text contains at least one of `terms`.
    async fn keyword_candidates(&self, terms: &[String], limit: usize) -> Result<Vec<String>>;
}

/// Durable chunk vectors.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn put_vector(&self, chunk_id: &str, document_id: &str, vector: &[f32]) -> Result<()>;

    async fn delete_vector(&self, chunk_id: &str) -> Result<()>;

    /// `(chunk_id, document_id, vector)` for every stored vector.
    async fn load_vectors(&self) -> Result<Vec<StoredVector>>;

    async fn vector_ids(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub chunk_id: String,
    pub document_id: String,
    pub vector: Vec<f32>,
}

/// Everything a document ingest will write, prepared before any write
/// happens.
#[derive(Debug, Clone)]
pub struct StagedDocument {
    pub document: Document,
    pub content_hash: String,
    pub records: Vec<ChunkRecord>,
    pub vectors: Vec<Vec<f32>>,
}

impl StagedDocument {
    pub fn chunk_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
pub trait Store: MetadataStore + VectorStore {
    /// Newest stored version of a document.
    async fn latest_version(&self, document_id: &str) -> Result<Lookup<DocumentVersion>>;

    /// Newest version of every document that still has chunks, ordered by id.
    async fn documents(&self) -> Result<Vec<DocumentVersion>>;

    /// Replace the document's chunks in both tables and record a new
    /// version. Returns the version number written.
    ///
    /// If `cancel` fires before the commit point, every staged write is
    /// rolled back and `Cancelled` is returned.
    async fn commit_document(
        &self,
        staged: &StagedDocument,
        cancel: &CancellationToken,
    ) -> Result<i64>;

    /// Drop the document's chunks and vectors. Stored versions are kept as
    /// history. Returns the number of chunks removed.
    async fn remove_document(&self, document_id: &str) -> Result<usize>;

    /// Flush and release resources.
    async fn close(&self) {}
}
