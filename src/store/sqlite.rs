//! SQLite-backed [`Store`].
//!
//! Tables (see [`migrate`](crate::migrate)):
//! - `chunk_meta`: MetadataStore rows, mirrored into `chunks_fts` for
//!   keyword candidate lookup.
//! - `chunk_vectors`: durable vectors as little-endian `f32` BLOBs.
//! - `documents`: every committed document version.
//!
//! Timestamps are stored as Unix milliseconds.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{HarnessError, Lookup, Result};
use crate::migrate;
use crate::models::{ChunkRecord, Document, DocumentVersion};

use super::{MetadataStore, StagedDocument, Store, StoredVector, VectorStore};

const RECORD_COLUMNS: &str =
    "chunk_id, document_id, seq, start_offset, end_offset, text, tags_json, ingested_at";

const DOCUMENT_COLUMNS: &str =
    "id, version, source_url, topic, tags_json, ingested_at, body, content_hash";

pub struct SqliteStore {
    pool: SqlitePool,
    /// Serializes this process's writers; `BEGIN IMMEDIATE` covers other processes.
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Connect to (or create) the database file and apply migrations.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// A deferred transaction whose first statement is a read holds a WAL
    /// snapshot, and upgrading it to a writer after another commit fails
    /// with SQLITE_BUSY without waiting. Take the write lock up front.
    async fn begin_write(&self) -> std::result::Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }
}

fn tags_to_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_record(row: &SqliteRow) -> std::result::Result<ChunkRecord, sqlx::Error> {
    Ok(ChunkRecord {
        chunk_id: row.try_get("chunk_id")?,
        document_id: row.try_get("document_id")?,
        seq: row.try_get::<i64, _>("seq")? as usize,
        start: row.try_get::<i64, _>("start_offset")? as usize,
        end: row.try_get::<i64, _>("end_offset")? as usize,
        text: row.try_get("text")?,
        tags: tags_from_json(&row.try_get::<String, _>("tags_json")?),
        ingested_at: from_millis(row.try_get("ingested_at")?),
    })
}

fn row_to_version(row: &SqliteRow) -> std::result::Result<DocumentVersion, sqlx::Error> {
    Ok(DocumentVersion {
        document: Document {
            id: row.try_get("id")?,
            source_url: row.try_get("source_url")?,
            topic: row.try_get("topic")?,
            tags: tags_from_json(&row.try_get::<String, _>("tags_json")?),
            ingested_at: from_millis(row.try_get("ingested_at")?),
            text: row.try_get("body")?,
        },
        version: row.try_get("version")?,
        content_hash: row.try_get("content_hash")?,
    })
}

/// FTS5 query matching any of `terms`. Each term is quoted so punctuation
/// and FTS operators in user input are taken literally.
fn fts_any_of(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

async fn insert_record<'c, E>(executor: E, record: &ChunkRecord) -> std::result::Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO chunk_meta (chunk_id, document_id, seq, start_offset, end_offset, text, tags_json, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            seq = excluded.seq,
            start_offset = excluded.start_offset,
            end_offset = excluded.end_offset,
            text = excluded.text,
            tags_json = excluded.tags_json,
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(&record.chunk_id)
    .bind(&record.document_id)
    .bind(record.seq as i64)
    .bind(record.start as i64)
    .bind(record.end as i64)
    .bind(&record.text)
    .bind(tags_to_json(&record.tags))
    .bind(record.ingested_at.timestamp_millis())
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_vector<'c, E>(
    executor: E,
    chunk_id: &str,
    document_id: &str,
    vector: &[f32],
) -> std::result::Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(chunk_id)
    .bind(document_id)
    .bind(vector.len() as i64)
    .bind(vec_to_blob(vector))
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn upsert(&self, record: &ChunkRecord) -> Result<()> {
        let op = "upsert chunk metadata";
        let _writer = self.write_lock.lock().await;
        let mut tx = self
            .begin_write()
            .await
            .map_err(|e| HarnessError::storage(op, e))?;

        insert_record(&mut *tx, record)
            .await
            .map_err(|e| HarnessError::storage(op, e))?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&record.chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| HarnessError::storage(op, e))?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&record.chunk_id)
            .bind(&record.document_id)
            .bind(&record.text)
            .execute(&mut *tx)
            .await
            .map_err(|e| HarnessError::storage(op, e))?;

        tx.commit().await.map_err(|e| HarnessError::storage(op, e))
    }

    async fn get(&self, chunk_id: &str) -> Result<Lookup<ChunkRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chunk_meta WHERE chunk_id = ?",
            RECORD_COLUMNS
        ))
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| HarnessError::storage("get chunk metadata", e))?;

        row.as_ref()
            .map(row_to_record)
            .transpose()
            .map(Lookup::from)
            .map_err(|e| HarnessError::storage("decode chunk metadata", e))
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let op = "delete document metadata";
        let _writer = self.write_lock.lock().await;
        let mut tx = self
            .begin_write()
            .await
            .map_err(|e| HarnessError::storage(op, e))?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| HarnessError::storage(op, e))?;
        let removed = sqlx::query("DELETE FROM chunk_meta WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| HarnessError::storage(op, e))?
            .rows_affected();

        tx.commit().await.map_err(|e| HarnessError::storage(op, e))?;
        Ok(removed as usize)
    }

    async fn list_by_tag(&self, tag: &str) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunk_meta \
             WHERE EXISTS (SELECT 1 FROM json_each(chunk_meta.tags_json) WHERE json_each.value = ?) \
             ORDER BY chunk_id",
            RECORD_COLUMNS
        ))
        .bind(tag)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HarnessError::storage("list chunks by tag", e))?;

        rows.iter()
            .map(row_to_record)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HarnessError::storage("decode chunk metadata", e))
    }

    async fn chunk_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT chunk_id FROM chunk_meta ORDER BY chunk_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HarnessError::storage("list chunk ids", e))
    }

    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT chunk_id FROM chunk_meta WHERE document_id = ? ORDER BY chunk_id")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HarnessError::storage("list document chunks", e))
    }

    async fn keyword_candidates(&self, terms: &[String], limit: usize) -> Result<Vec<String>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        sqlx::query_scalar(
            "SELECT chunk_id FROM chunks_fts WHERE chunks_fts MATCH ? ORDER BY rank LIMIT ?",
        )
        .bind(fts_any_of(terms))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HarnessError::storage("keyword candidates", e))
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn put_vector(&self, chunk_id: &str, document_id: &str, vector: &[f32]) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        insert_vector(&self.pool, chunk_id, document_id, vector)
            .await
            .map_err(|e| HarnessError::storage("store vector", e))
    }

    async fn delete_vector(&self, chunk_id: &str) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(|e| HarnessError::storage("delete vector", e))?;
        Ok(())
    }

    async fn load_vectors(&self) -> Result<Vec<StoredVector>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, embedding FROM chunk_vectors ORDER BY chunk_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HarnessError::storage("load vectors", e))?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.try_get("embedding")?;
                Ok(StoredVector {
                    chunk_id: row.try_get("chunk_id")?,
                    document_id: row.try_get("document_id")?,
                    vector: blob_to_vec(&blob),
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| HarnessError::storage("decode vectors", e))
    }

    async fn vector_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT chunk_id FROM chunk_vectors ORDER BY chunk_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HarnessError::storage("list vector ids", e))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn latest_version(&self, document_id: &str) -> Result<Lookup<DocumentVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ? ORDER BY version DESC LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| HarnessError::storage("latest document version", e))?;

        row.as_ref()
            .map(row_to_version)
            .transpose()
            .map(Lookup::from)
            .map_err(|e| HarnessError::storage("decode document", e))
    }

    async fn documents(&self) -> Result<Vec<DocumentVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents d \
             WHERE d.version = (SELECT MAX(version) FROM documents WHERE id = d.id) \
               AND EXISTS (SELECT 1 FROM chunk_meta c WHERE c.document_id = d.id) \
             ORDER BY d.id",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HarnessError::storage("list documents", e))?;

        rows.iter()
            .map(row_to_version)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HarnessError::storage("decode document", e))
    }

    async fn commit_document(
        &self,
        staged: &StagedDocument,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let doc = &staged.document;
        let op = format!("commit document {}", doc.id);
        let storage = |e: sqlx::Error| HarnessError::storage(op.clone(), e);
        let cancelled = || HarnessError::Cancelled {
            operation: format!("ingest of {}", doc.id),
        };

        let _writer = self.write_lock.lock().await;
        let mut tx = self.begin_write().await.map_err(storage)?;

        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) + 1 FROM documents WHERE id = ?")
                .bind(&doc.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage)?;

        sqlx::query(&format!(
            "INSERT INTO documents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            DOCUMENT_COLUMNS
        ))
        .bind(&doc.id)
        .bind(version)
        .bind(&doc.source_url)
        .bind(&doc.topic)
        .bind(tags_to_json(&doc.tags))
        .bind(doc.ingested_at.timestamp_millis())
        .bind(&doc.text)
        .bind(&staged.content_hash)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        // Drop every prior chunk of this document from all three tables.
        for table in ["chunk_vectors", "chunks_fts", "chunk_meta"] {
            sqlx::query(&format!("DELETE FROM {} WHERE document_id = ?", table))
                .bind(&doc.id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        for (record, vector) in staged.records.iter().zip(staged.vectors.iter()) {
            if cancel.is_cancelled() {
                tx.rollback().await.map_err(storage)?;
                return Err(cancelled());
            }

            insert_record(&mut *tx, record).await.map_err(storage)?;
            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&record.chunk_id)
                .bind(&record.document_id)
                .bind(&record.text)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            insert_vector(&mut *tx, &record.chunk_id, &doc.id, vector)
                .await
                .map_err(storage)?;
        }

        if cancel.is_cancelled() {
            tx.rollback().await.map_err(storage)?;
            return Err(cancelled());
        }

        tx.commit().await.map_err(storage)?;
        Ok(version)
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let op = format!("remove document {}", document_id);
        let storage = |e: sqlx::Error| HarnessError::storage(op.clone(), e);

        let _writer = self.write_lock.lock().await;
        let mut tx = self.begin_write().await.map_err(storage)?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        let removed = sqlx::query("DELETE FROM chunk_meta WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?
            .rows_affected();
        tx.commit().await.map_err(storage)?;

        Ok(removed as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{chunk_id_for, hash_text, Chunk};

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("rh.sqlite")).await.unwrap();
        (dir, store)
    }

    fn staged(doc: &Document, texts: &[&str]) -> StagedDocument {
        let records = texts
            .iter()
            .enumerate()
            .map(|(seq, text)| {
                let chunk = Chunk {
                    id: chunk_id_for(&doc.id, seq),
                    document_id: doc.id.clone(),
                    seq,
                    start: 0,
                    end: text.chars().count(),
                    text: text.to_string(),
                    hash: hash_text(text),
                };
                ChunkRecord::from_chunk(&chunk, doc)
            })
            .collect();
        StagedDocument {
            document: doc.clone(),
            content_hash: doc.content_hash(),
            records,
            vectors: texts.iter().map(|_| vec![0.6, 0.8]).collect(),
        }
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let (_dir, store) = open_temp().await;
        let doc = Document::new("notes/a.md", "local", "alpha beta")
            .with_tags(["physics", "gap"])
            .with_topic("quantum");
        let cancel = CancellationToken::new();

        let version = store
            .commit_document(&staged(&doc, &["alpha", "beta"]), &cancel)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let record = store
            .get(&chunk_id_for(&doc.id, 1))
            .await
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(record.text, "beta");
        assert_eq!(record.tags, vec!["physics", "gap"]);
        assert_eq!(record.ingested_at, doc.ingested_at);

        let vectors = store.load_vectors().await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].vector, vec![0.6, 0.8]);

        let latest = store.latest_version(&doc.id).await.unwrap().found().unwrap();
        assert_eq!(latest.document, doc);
    }

    #[tokio::test]
    async fn test_versions_are_additive_chunks_are_replaced() {
        let (_dir, store) = open_temp().await;
        let cancel = CancellationToken::new();
        let doc = Document::new("a", "local", "first");
        store
            .commit_document(&staged(&doc, &["one", "two", "three"]), &cancel)
            .await
            .unwrap();

        let mut doc2 = doc.clone();
        doc2.text = "second".into();
        let version = store
            .commit_document(&staged(&doc2, &["four"]), &cancel)
            .await
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(store.chunk_ids().await.unwrap().len(), 1);
        assert_eq!(store.vector_ids().await.unwrap().len(), 1);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(store.documents().await.unwrap()[0].document.text, "second");
    }

    #[tokio::test]
    async fn test_cancel_rolls_back() {
        let (_dir, store) = open_temp().await;
        let cancel = CancellationToken::new();
        let doc = Document::new("a", "local", "x");
        store
            .commit_document(&staged(&doc, &["kept"]), &cancel)
            .await
            .unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = store
            .commit_document(&staged(&doc, &["new1", "new2"]), &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled { .. }));

        // Prior state is untouched.
        let ids = store.chunk_ids().await.unwrap();
        assert_eq!(ids, vec![chunk_id_for(&doc.id, 0)]);
        assert_eq!(store.get(&ids[0]).await.unwrap().found().unwrap().text, "kept");
        assert_eq!(store.latest_version(&doc.id).await.unwrap().found().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_keyword_candidates_and_tags() {
        let (_dir, store) = open_temp().await;
        let cancel = CancellationToken::new();
        let doc = Document::new("a", "local", "x").with_tags(["physics"]);
        store
            .commit_document(
                &staged(&doc, &["quantum entanglement", "classical bits", "sourdough"]),
                &cancel,
            )
            .await
            .unwrap();

        let hits = store
            .keyword_candidates(&["entanglement".to_string(), "bits".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(store.list_by_tag("physics").await.unwrap().len(), 3);
        assert!(store.list_by_tag("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_document_clears_both_tables() {
        let (_dir, store) = open_temp().await;
        let cancel = CancellationToken::new();
        let doc = Document::new("a", "local", "x");
        store
            .commit_document(&staged(&doc, &["a", "b"]), &cancel)
            .await
            .unwrap();

        assert_eq!(store.remove_document(&doc.id).await.unwrap(), 2);
        assert!(store.chunk_ids().await.unwrap().is_empty());
        assert!(store.vector_ids().await.unwrap().is_empty());
        assert!(store.documents().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_all_land() {
        let (_dir, store) = open_temp().await;
        let store = std::sync::Arc::new(store);
        let cancel = CancellationToken::new();

        let writers: Vec<_> = (0..12)
            .map(|i| {
                let store = store.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut doc = Document::new(&format!("doc{}", i), "local", "x");
                    for round in 0..3 {
                        doc.text = format!("round {}", round);
                        store.commit_document(&staged(&doc, &["a", "b"]), &cancel).await?;
                    }
                    Ok::<_, HarnessError>(())
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(store.chunk_ids().await.unwrap().len(), 24);
        assert_eq!(store.vector_ids().await.unwrap().len(), 24);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 36);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        let q = fts_any_of(&["a\"b".to_string(), "c".to_string()]);
        assert_eq!(q, "\"a\"\"b\" OR \"c\"");
    }
}
