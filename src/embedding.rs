//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: deterministic feature-hashed bag of words; offline, no model.
//! - **[`OpenAiEmbedder`]**: OpenAI `/v1/embeddings`.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: fastembed, behind the `local-embeddings-fastembed` feature.
//! - **[`DisabledEmbedder`]**: always fails with `EmbeddingFailure`.
//!
//! [`GuardedEmbedder`] wraps any of them with the shared throttle, bounded
//! retry, and batch splitting; this is what the pipeline actually calls.
//!
//! # Vector conventions
//!
//! Every vector returned by a provider is L2-normalized, so cosine
//! similarity and inner product agree. Input text is normalized
//! (trimmed, whitespace collapsed) before embedding, so texts that differ
//! only in spacing get identical vectors.
//!
//! Also provides the vector utilities used by the stores:
//! - [`cosine_similarity`]
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{HarnessError, Result, Stage};
use crate::retry::{self, RetryPolicy};
use crate::throttle::Throttle;

/// Maps text to a fixed-length vector.
///
/// `embed_batch` must return the same vectors as repeated `embed` calls;
/// batching only saves round trips.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| HarnessError::embedding("embed", "empty embedding response"))
    }
}

/// Trim and collapse runs of whitespace to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ============ Hash Embedder ============

/// Deterministic embedder using signed feature hashing of lowercase word
/// tokens (plus adjacent-word bigrams at half weight).
///
/// Texts sharing vocabulary land close together; texts with disjoint
/// vocabulary are near-orthogonal. Good enough for offline use and tests,
/// and byte-for-byte reproducible across runs and machines.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let normalized = normalize_text(text);
        let tokens = crate::retrieve::tokenize(&normalized);
        let mut v = vec![0.0f32; self.dims];
        for token in &tokens {
            self.accumulate(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut v, bigram.as_bytes(), 0.5);
        }
        l2_normalize(&mut v);
        v
    }

    fn accumulate(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let h = fnv1a(feature);
        let slot = (h % self.dims as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[slot] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Disabled Embedder ============

/// Used when `embedding.provider = "disabled"`; every call fails.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(HarnessError::embedding(
            "embed",
            "embedding provider is disabled; set [embedding] provider in config",
        ))
    }
}

// ============ OpenAI Embedder ============

/// Calls `POST https://api.openai.com/v1/embeddings`.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let input: Vec<String> = texts.iter().map(|t| normalize_text(t)).collect();
        let body = serde_json::json!({ "model": self.model, "input": input });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| HarnessError::unavailable(Stage::Embed, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(retry::classify_status(Stage::Embed, status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HarnessError::embedding("embed", e))?;
        parse_embedding_arrays(
            json.get("data")
                .and_then(|d| d.as_array())
                .map(|items| items.iter().filter_map(|i| i.get("embedding")).collect()),
            "OpenAI",
        )
    }
}

// ============ Ollama Embedder ============

/// Calls `POST /api/embed` on a local Ollama instance
/// (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let input: Vec<String> = texts.iter().map(|t| normalize_text(t)).collect();
        let body = serde_json::json!({ "model": self.model, "input": input });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                HarnessError::unavailable(
                    Stage::Embed,
                    format!("is Ollama running at {}? {}", self.url, e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(retry::classify_status(Stage::Embed, status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HarnessError::embedding("embed", e))?;
        parse_embedding_arrays(
            json.get("embeddings")
                .and_then(|e| e.as_array())
                .map(|items| items.iter().collect()),
            "Ollama",
        )
    }
}

/// Turn a list of JSON number arrays into unit-length vectors.
fn parse_embedding_arrays(
    items: Option<Vec<&serde_json::Value>>,
    backend: &str,
) -> Result<Vec<Vec<f32>>> {
    let items = items.ok_or_else(|| {
        HarnessError::embedding("embed", format!("invalid {} response: missing embeddings", backend))
    })?;

    items
        .into_iter()
        .map(|item| {
            let values = item.as_array().ok_or_else(|| {
                HarnessError::embedding(
                    "embed",
                    format!("invalid {} response: embedding is not an array", backend),
                )
            })?;
            let mut v: Vec<f32> = values
                .iter()
                .map(|x| x.as_f64().unwrap_or(0.0) as f32)
                .collect();
            l2_normalize(&mut v);
            Ok(v)
        })
        .collect()
}

// ============ Local Embedder (fastembed) ============

/// Runs an ONNX model in-process via fastembed. The model is downloaded on
/// first use and cached; afterwards no network calls are made.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (model_id, default_dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => anyhow::bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        };
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model_id).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let input: Vec<String> = texts.iter().map(|t| normalize_text(t)).collect();
        let model = self.model.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| HarnessError::embedding("embed", "local model lock poisoned"))?;
            guard
                .embed(input, None)
                .map_err(|e| HarnessError::embedding("embed", e))
        })
        .await
        .map_err(|e| HarnessError::embedding("embed", e))?;

        let mut vectors = joined?;
        for v in vectors.iter_mut() {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}

/// Instantiate the configured provider.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings-fastembed`) |
/// | `"disabled"` | [`DisabledEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims.unwrap_or(384)))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => anyhow::bail!(
            "Local embedding provider requires --features local-embeddings-fastembed"
        ),
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Guarded Embedder ============

/// Throttled, retrying, batch-splitting front for an [`Embedder`].
///
/// Any failure that survives the retry budget is reported as
/// `EmbeddingFailure`, which callers treat as fatal for the current
/// operation.
pub struct GuardedEmbedder {
    inner: Arc<dyn Embedder>,
    throttle: Throttle,
    policy: RetryPolicy,
    batch_size: usize,
}

impl GuardedEmbedder {
    pub fn new(
        inner: Arc<dyn Embedder>,
        throttle: Throttle,
        policy: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            inner,
            throttle,
            policy,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Embedder for GuardedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = retry::with_backoff(&self.policy, "embed", || async {
                let _permit = self.throttle.acquire().await;
                self.inner.embed_batch(batch).await
            })
            .await
            .map_err(|e| match e {
                HarnessError::EmbeddingFailure { .. } => e,
                other => HarnessError::embedding("embed", other),
            })?;

            if vectors.len() != batch.len() {
                return Err(HarnessError::embedding(
                    "embed",
                    format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        batch.len()
                    ),
                ));
            }
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use research_harness::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
