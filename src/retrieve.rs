//! Hybrid retrieval: vector similarity fused with keyword overlap.
//!
//! # Algorithm
//!
//! 1. Embed the query.
//! 2. Candidates: the top `max(k, candidate_k)` chunks from the vector
//!    index, plus up to `candidate_k` keyword matches from the metadata
//!    store. A keyword candidate that is not in the index is skipped, so
//!    nothing that failed to commit fully can surface.
//! 3. Score every candidate twice:
//!    - vector: cosine similarity to the query embedding;
//!    - keyword: fraction of distinct query terms present in the chunk.
//! 4. Min-max normalize each score over the candidate set
//!    (all-equal sets normalize to 1.0).
//! 5. `fused = (1 - alpha) * keyword + alpha * vector`.
//! 6. Order by fused score, then raw vector score, then earlier ingestion
//!    time, then chunk id. Truncate to `k`.
//!
//! Fewer than `k` results means the index holds fewer than `k` chunks.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{Lookup, Result};
use crate::index::VectorIndex;
use crate::models::{ChunkRecord, ScoredChunk};
use crate::store::Store;

/// Lowercase alphanumeric word tokens, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Distinct query tokens, first occurrence order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of `terms` present in `text`, in `[0.0, 1.0]`.
pub fn keyword_overlap(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let tokens: HashSet<String> = tokenize(text).into_iter().collect();
    let hits = terms.iter().filter(|t| tokens.contains(*t)).count();
    hits as f64 / terms.len() as f64
}

/// Min-max normalize to `[0.0, 1.0]`. If every value is equal, all map
/// to 1.0.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let s_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    raw.iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

pub struct Retriever {
    store: Arc<dyn Store>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            config,
        }
    }

    pub fn default_k(&self) -> usize {
        self.config.default_k
    }

    /// Ranked chunks for `text`, at most `k`.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embedder.embed(text).await?;
        let terms = query_terms(text);
        let pool_size = k.max(self.config.candidate_k);

        let vector_hits: HashMap<String, f32> =
            self.index.search(&query_vec, pool_size).into_iter().collect();

        let mut candidate_ids: BTreeSet<String> = vector_hits.keys().cloned().collect();
        candidate_ids.extend(
            self.store
                .keyword_candidates(&terms, self.config.candidate_k)
                .await?,
        );

        let mut candidates: Vec<(ChunkRecord, f64)> = Vec::with_capacity(candidate_ids.len());
        for chunk_id in candidate_ids {
            let vector_score = match vector_hits.get(&chunk_id) {
                Some(s) => *s,
                None => match self.index.score(&chunk_id, &query_vec) {
                    Some(s) => s,
                    None => {
                        tracing::debug!(chunk_id = %chunk_id, "keyword hit not in index, skipping");
                        continue;
                    }
                },
            };
            match self.store.get(&chunk_id).await? {
                Lookup::Found(record) => candidates.push((record, vector_score as f64)),
                Lookup::NotFound => {
                    tracing::warn!(chunk_id = %chunk_id, "indexed chunk has no metadata row");
                }
            }
        }

        let raw_vector: Vec<f64> = candidates.iter().map(|(_, v)| *v).collect();
        let raw_keyword: Vec<f64> = candidates
            .iter()
            .map(|(r, _)| keyword_overlap(&terms, &r.text))
            .collect();
        let norm_vector = normalize_scores(&raw_vector);
        let norm_keyword = normalize_scores(&raw_keyword);

        let alpha = self.config.hybrid_alpha;
        let mut results: Vec<ScoredChunk> = candidates
            .into_iter()
            .enumerate()
            .map(|(i, (record, vector_score))| ScoredChunk {
                score: (1.0 - alpha) * norm_keyword[i] + alpha * norm_vector[i],
                vector_score,
                similarity: vector_score.clamp(0.0, 1.0),
                keyword_overlap: raw_keyword[i],
                chunk_id: record.chunk_id,
                document_id: record.document_id,
                text: record.text,
                ingested_at: record.ingested_at,
            })
            .collect();

        results.sort_by(rank_order);
        results.truncate(k);
        Ok(results)
    }
}

/// Fused score desc, raw cosine desc, older first, then chunk id.
fn rank_order(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.vector_score
                .partial_cmp(&a.vector_score)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.ingested_at.cmp(&b.ingested_at))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
