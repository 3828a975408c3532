//! Core data models that flow through ingestion and retrieval.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Origin label for documents that did not come from the web.
pub const LOCAL_SOURCE: &str = "local";

/// A document as handed to the ingestion pipeline.
///
/// Documents are never mutated in place: re-ingesting the same id with new
/// text records a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Origin URL, or [`LOCAL_SOURCE`].
    pub source_url: String,
    pub topic: Option<String>,
    pub tags: Vec<String>,
    pub ingested_at: DateTime<Utc>,
    pub text: String,
}

impl Document {
    /// Build a document whose id is derived from `source_key` (a URL or a
    /// file path), so the same source always maps to the same id.
    pub fn new(source_key: &str, source_url: &str, text: impl Into<String>) -> Self {
        Self {
            id: document_id_for(source_key),
            source_url: source_url.to_string(),
            topic: None,
            tags: Vec::new(),
            // Millisecond precision is what the SQLite backend persists.
            ingested_at: Utc::now().trunc_subsecs(3),
            text: text.into(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn content_hash(&self) -> String {
        hash_text(&self.text)
    }
}

/// A stored version of a document, as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentVersion {
    pub document: Document,
    pub version: i64,
    pub content_hash: String,
}

/// A bounded, overlapping passage of a document.
///
/// `start`/`end` are character (not byte) offsets into the parent text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub seq: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hash: String,
}

/// One MetadataStore row, keyed by chunk id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub seq: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub tags: Vec<String>,
    pub ingested_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn from_chunk(chunk: &Chunk, doc: &Document) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            seq: chunk.seq,
            start: chunk.start,
            end: chunk.end,
            text: chunk.text.clone(),
            tags: doc.tags.clone(),
            ingested_at: doc.ingested_at,
        }
    }
}

/// A retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Fused hybrid score in `[0.0, 1.0]`, normalized within the candidate set.
    pub score: f64,
    /// Raw cosine similarity to the query, in `[-1.0, 1.0]`.
    pub vector_score: f64,
    /// `vector_score` clamped to `[0.0, 1.0]`; what gap coverage compares
    /// against its threshold.
    pub similarity: f64,
    /// Fraction of query terms present in the chunk.
    pub keyword_overlap: f64,
    pub ingested_at: DateTime<Utc>,
}

/// Stable document id: first 32 hex chars of SHA-256 over the source key.
pub fn document_id_for(source_key: &str) -> String {
    let mut id = hash_text(source_key);
    id.truncate(32);
    id
}

/// Chunk id: parent document id plus a zero-padded sequence number.
pub fn chunk_id_for(document_id: &str, seq: usize) -> String {
    format!("{}:{:05}", document_id, seq)
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
