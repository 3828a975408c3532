//! The knowledge base and the workflows that run against it.
//!
//! [`KnowledgeBase`] is the process-wide state: opened once at startup
//! (store connected, vector index loaded from the durable vectors) and
//! closed on shutdown. It owns the single [`Throttle`] every embedding
//! and collaborator call draws from.
//!
//! Workflows:
//!
//! | Method | Flow |
//! |--------|------|
//! | [`ask`](KnowledgeBase::ask) | retrieve top-k → complete with numbered context |
//! | [`research`](KnowledgeBase::research) | related lookup → search → fetch → summarize → save report → ingest |
//! | [`research_large`](KnowledgeBase::research_large) | research → follow-up questions → answer each → weave one report |
//! | [`feedback`](KnowledgeBase::feedback) | append a dated correction → re-ingest that one document |
//! | [`ingest_path`](KnowledgeBase::ingest_path) | ingest a report file or a directory of them |
//! | [`refresh`](KnowledgeBase::refresh) | re-ingest every saved report |
//! | [`expand`](KnowledgeBase::expand) | taxonomy gaps → research the weakest |
//! | [`run_task`](KnowledgeBase::run_task) | route a [`Task`] and run its handler |

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{SubsecRound, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::collab::Collaborators;
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder, GuardedEmbedder};
use crate::error::{HarnessError, Lookup, Result};
use crate::gap::GapAnalyzer;
use crate::index::VectorIndex;
use crate::ingest::{IngestOutcome, IngestionPipeline};
use crate::models::{document_id_for, ScoredChunk, LOCAL_SOURCE};
use crate::reports::{self, Report, ReportMeta};
use crate::retrieve::Retriever;
use crate::retry::RetryPolicy;
use crate::router::{self, Handler};
use crate::store::{InMemoryStore, MetadataStore, SqliteStore, Store, VectorStore};
use crate::task::{Task, GAP_TAG};
use crate::throttle::Throttle;

/// Chunks of existing knowledge shown to the summarizer during research.
const RELATED_CONTEXT_K: usize = 3;

pub const RESEARCH_TAG: &str = "research";
pub const FALLBACK_TAG: &str = "fallback";
pub const LARGE_TAG: &str = "large";

/// Follow-up questions asked during large research.
const FOLLOW_UP_QUESTIONS: usize = 3;

/// Drift between the metadata table, the durable vectors, and the
/// in-memory index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Durable vectors with no metadata row.
    pub orphan_vectors: Vec<String>,
    /// Metadata rows with no durable vector.
    pub orphan_metadata: Vec<String>,
    /// Consistent chunks missing from the in-memory index.
    pub index_missing: Vec<String>,
    /// In-memory entries with no consistent backing rows.
    pub index_extra: Vec<String>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.orphan_vectors.is_empty()
            && self.orphan_metadata.is_empty()
            && self.index_missing.is_empty()
            && self.index_extra.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} orphan vectors, {} orphan metadata rows, {} missing from index, {} stale in index",
            self.orphan_vectors.len(),
            self.orphan_metadata.len(),
            self.index_missing.len(),
            self.index_extra.len()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum Answer {
    Answered {
        text: String,
        sources: Vec<ScoredChunk>,
    },
    /// The index had nothing to offer.
    NoResults,
}

#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub query: String,
    pub report_path: PathBuf,
    pub fetched: Vec<String>,
    pub failed: Vec<String>,
    pub fallback: bool,
    /// Follow-up questions answered by [`research_large`](KnowledgeBase::research_large).
    pub follow_ups: Vec<String>,
    pub ingest: IngestOutcome,
}

/// What one research run gathered before summarizing.
struct Material {
    related: Vec<ScoredChunk>,
    pages: Vec<(String, String)>,
    failed: Vec<String>,
}

impl Material {
    fn is_empty(&self) -> bool {
        self.related.is_empty() && self.pages.is_empty()
    }
}

/// A finished report body waiting to be saved.
struct Draft {
    body: String,
    follow_ups: Vec<String>,
    /// Appended to the file name, e.g. `_large`.
    suffix: Option<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshSummary {
    pub indexed: usize,
    pub unchanged: usize,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug)]
pub enum TaskOutput {
    Answer(Answer),
    Research(ResearchOutcome),
    Feedback(IngestOutcome),
    Ingest(RefreshSummary),
}

pub struct KnowledgeBase {
    config: Config,
    store: Arc<dyn Store>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    pipeline: Arc<IngestionPipeline>,
    retriever: Arc<Retriever>,
    gaps: GapAnalyzer,
    throttle: Throttle,
    repaired_on_open: Option<ReconcileReport>,
}

impl KnowledgeBase {
    /// Open the configured store and embedder and load the vector index.
    /// A `[db] path` of `:memory:` uses the in-memory store.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = if config.db.path.as_os_str() == ":memory:" {
            Arc::new(InMemoryStore::new())
        } else {
            Arc::new(SqliteStore::open(&config.db.path).await?)
        };
        let embedder = create_embedder(&config.embedding)?;
        Ok(Self::with_parts(config, store, embedder).await?)
    }

    /// Assemble from an explicit store and raw embedder. The embedder is
    /// wrapped with the shared throttle, retry policy, and batch size.
    pub async fn with_parts(
        config: Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let throttle = Throttle::from_config(&config.limits);
        let embedder: Arc<dyn Embedder> = Arc::new(GuardedEmbedder::new(
            embedder,
            throttle.clone(),
            RetryPolicy::from_config(&config.retry),
            config.embedding.batch_size,
        ));
        let index = Arc::new(VectorIndex::new());

        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            config.chunking.clone(),
            config.limits.ingest_concurrency,
        ));
        let retriever = Arc::new(Retriever::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            config.retrieval.clone(),
        ));
        let gaps = GapAnalyzer::new(retriever.clone(), config.gaps.clone());

        let mut kb = Self {
            config,
            store,
            index,
            embedder,
            pipeline,
            retriever,
            gaps,
            throttle,
            repaired_on_open: None,
        };

        let loaded = kb.rebuild_index().await?;
        tracing::info!(chunks = loaded, "vector index loaded");
        let drift = kb.reconcile().await?;
        if !drift.is_consistent() {
            kb.repair_on_open(&drift).await?;
            kb.repaired_on_open = Some(drift);
        }
        Ok(kb)
    }

    /// Drift found while opening is rebuilt from the stored chunk text
    /// before anything else runs. If that cannot finish, opening fails.
    async fn repair_on_open(&self, drift: &ReconcileReport) -> Result<()> {
        self.repair()
            .await
            .map_err(|e| HarnessError::IndexCorruption {
                detail: format!("{}; rebuild from stored text failed: {}", drift.summary(), e),
            })?;
        let after = self.reconcile().await?;
        if !after.is_consistent() {
            return Err(HarnessError::IndexCorruption {
                detail: format!("drift remains after rebuild: {}", after.summary()),
            });
        }
        tracing::info!(drift = %drift.summary(), "store drift repaired on open");
        Ok(())
    }

    /// Flush and release the store.
    pub async fn close(self) {
        self.store.close().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }
    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }
    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }
    pub fn gaps(&self) -> &GapAnalyzer {
        &self.gaps
    }
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }
    /// Drift that was found and repaired while opening, if any.
    pub fn repaired_on_open(&self) -> Option<&ReconcileReport> {
        self.repaired_on_open.as_ref()
    }

    /// Collaborators built from config, sharing this knowledge base's
    /// throttle.
    pub fn collaborators(&self) -> anyhow::Result<Collaborators> {
        Collaborators::from_config(&self.config, &self.throttle)
    }

    // ============ Reconciliation ============

    /// Compare the metadata table, the durable vectors, and the index.
    /// Read-only.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let meta: BTreeSet<String> = self.store.chunk_ids().await?.into_iter().collect();
        let vectors: BTreeSet<String> = self.store.vector_ids().await?.into_iter().collect();
        let indexed: BTreeSet<String> = self.index.ids().into_iter().collect();
        let consistent: BTreeSet<String> = meta.intersection(&vectors).cloned().collect();

        Ok(ReconcileReport {
            orphan_vectors: vectors.difference(&meta).cloned().collect(),
            orphan_metadata: meta.difference(&vectors).cloned().collect(),
            index_missing: consistent.difference(&indexed).cloned().collect(),
            index_extra: indexed.difference(&consistent).cloned().collect(),
        })
    }

    /// Fix drift: drop orphan vectors, re-embed orphan metadata rows from
    /// their stored text, then rebuild the index. Returns what was found.
    pub async fn repair(&self) -> Result<ReconcileReport> {
        let report = self.reconcile().await?;
        if report.is_consistent() {
            return Ok(report);
        }
        tracing::warn!(drift = %report.summary(), "repairing store drift");

        for chunk_id in &report.orphan_vectors {
            self.store.delete_vector(chunk_id).await?;
        }

        let mut records = Vec::new();
        for chunk_id in &report.orphan_metadata {
            if let Lookup::Found(record) = self.store.get(chunk_id).await? {
                records.push(record);
            }
        }
        if !records.is_empty() {
            let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| HarnessError::embedding("repair", e))?;
            for (record, vector) in records.iter().zip(vectors.iter()) {
                self.store
                    .put_vector(&record.chunk_id, &record.document_id, vector)
                    .await?;
            }
        }

        self.rebuild_index().await?;
        Ok(report)
    }

    /// Reload the in-memory index from the durable vectors. Vectors without
    /// a metadata row are left out. Returns the number of entries loaded.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let meta: BTreeSet<String> = self.store.chunk_ids().await?.into_iter().collect();
        let vectors: Vec<_> = self
            .store
            .load_vectors()
            .await?
            .into_iter()
            .filter(|v| meta.contains(&v.chunk_id))
            .collect();

        let dims = self.embedder.dims();
        if dims > 0 {
            let mismatched = vectors.iter().filter(|v| v.vector.len() != dims).count();
            if mismatched > 0 {
                tracing::warn!(
                    mismatched,
                    expected = dims,
                    "stored vectors have a different dimension than the embedder; re-ingest to fix"
                );
            }
        }

        let count = vectors.len();
        self.index.rebuild(vectors);
        Ok(count)
    }

    // ============ Ask ============

    pub async fn ask(&self, question: &str, collab: &Collaborators) -> Result<Answer> {
        let hits = self
            .retriever
            .query(question, self.retriever.default_k())
            .await?;
        if hits.is_empty() {
            return Ok(Answer::NoResults);
        }

        let context = numbered_context(&hits);
        let prompt = format!(
            "You are a knowledgeable assistant. Use the numbered context first, \
             then your own knowledge, and cite context by number.\n\nQuestion: {}",
            question
        );
        let text = collab.completion.complete(&prompt, &context).await?;
        Ok(Answer::Answered {
            text,
            sources: hits,
        })
    }

    // ============ Research ============

    /// Research `query` on the web, save a report, and ingest it.
    ///
    /// Per-URL fetch failures are logged and skipped. If neither the index
    /// nor the web yields anything, the model is asked directly and the
    /// report is tagged `fallback`.
    pub async fn research(
        &self,
        query: &str,
        extra_tags: &[String],
        collab: &Collaborators,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ResearchOutcome> {
        let material = self.gather(query, collab, cancel).await?;
        let summary = self.summarize(query, &material, collab).await?;
        let draft = Draft {
            body: summary,
            follow_ups: Vec::new(),
            suffix: None,
        };
        self.save_research(query, extra_tags, material, draft, cancel)
            .await
    }

    /// The long form of [`research`](Self::research): after the first
    /// summary the model writes follow-up questions, answers each from the
    /// knowledge base, and weaves everything into one detailed report.
    /// Saved with a `_large` file-name suffix and tagged `large`.
    pub async fn research_large(
        &self,
        query: &str,
        extra_tags: &[String],
        collab: &Collaborators,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ResearchOutcome> {
        let material = self.gather(query, collab, cancel).await?;
        let summary = self.summarize(query, &material, collab).await?;

        let raw = collab
            .completion
            .complete(
                "You are an inquisitive assistant. Based on the summary above, write three \
                 insightful follow-up questions that deepen understanding, one per line.",
                &summary,
            )
            .await?;
        let questions = follow_up_questions(&raw);
        tracing::info!(query, questions = questions.len(), "follow-up questions drafted");

        let background = summary.as_str();
        let answers: Vec<(String, String)> = stream::iter(questions)
            .map(|question| async move {
                let answer = self.answer_follow_up(&question, background, collab).await?;
                Ok::<_, anyhow::Error>((question, answer))
            })
            .buffered(self.config.limits.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<anyhow::Result<_>>()?;

        if cancel.is_cancelled() {
            return Err(cancelled_research(query).into());
        }

        let report = collab
            .completion
            .complete(
                &format!(
                    "You are a comprehensive research assistant. Weave the summary and the \
                     follow-up answers above into one cohesive, detailed markdown report on \"{}\".",
                    query
                ),
                &large_report_context(query, &summary, &answers),
            )
            .await?;

        let draft = Draft {
            body: report,
            follow_ups: answers.into_iter().map(|(q, _)| q).collect(),
            suffix: Some(LARGE_TAG),
        };
        let mut tags = extra_tags.to_vec();
        tags.push(LARGE_TAG.to_string());
        self.save_research(query, &tags, material, draft, cancel)
            .await
    }

    /// Related lookup, web search, and page fetches for one query.
    async fn gather(
        &self,
        query: &str,
        collab: &Collaborators,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Material> {
        let related = self.retriever.query(query, RELATED_CONTEXT_K).await?;
        if related.is_empty() {
            tracing::info!(query, "no related knowledge in the index");
        }

        let urls = collab
            .search
            .search(query, self.config.search.num_results)
            .await?;
        tracing::info!(query, results = urls.len(), "search complete");

        let fetched: Vec<(String, Result<String>)> = stream::iter(urls)
            .map(|url| async move {
                let page = collab.fetcher.fetch(&url).await;
                (url, page)
            })
            .buffered(self.config.limits.max_concurrency.max(1))
            .collect()
            .await;

        let mut pages = Vec::new();
        let mut failed = Vec::new();
        for (url, page) in fetched {
            match page {
                Ok(text) if !text.trim().is_empty() => pages.push((url, text)),
                Ok(_) => {
                    tracing::warn!(url = %url, "fetched page has no text, skipping");
                    failed.push(url);
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "fetch failed, skipping");
                    failed.push(url);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(cancelled_research(query).into());
        }

        Ok(Material {
            related,
            pages,
            failed,
        })
    }

    async fn summarize(
        &self,
        query: &str,
        material: &Material,
        collab: &Collaborators,
    ) -> Result<String> {
        if material.is_empty() {
            tracing::warn!(query, "nothing found; asking the model directly");
            return collab.completion.complete(query, "").await;
        }
        let context = research_context(query, &material.related, &material.pages);
        let prompt = format!(
            "You are a concise research summarizer. Write a markdown report on \
             \"{}\" from the material above, keeping the facts and citing source URLs.",
            query
        );
        collab.completion.complete(&prompt, &context).await
    }

    /// Answer one follow-up from the knowledge base, with the first
    /// summary as background.
    async fn answer_follow_up(
        &self,
        question: &str,
        summary: &str,
        collab: &Collaborators,
    ) -> Result<String> {
        let hits = self.retriever.query(question, RELATED_CONTEXT_K).await?;
        let mut context = format!("## Summary so far\n\n{}", summary.trim());
        if !hits.is_empty() {
            context.push_str("\n\n## Existing knowledge\n\n");
            context.push_str(&numbered_context(&hits));
        }
        let prompt = format!(
            "You are a detailed assistant. Answer the following question thoroughly, \
             using any relevant context.\n\nQuestion: {}",
            question
        );
        collab.completion.complete(&prompt, &context).await
    }

    async fn save_research(
        &self,
        query: &str,
        extra_tags: &[String],
        material: Material,
        draft: Draft,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ResearchOutcome> {
        let fallback = material.is_empty();

        let mut meta = ReportMeta::new(
            material
                .pages
                .first()
                .map(|(url, _)| url.clone())
                .unwrap_or_else(|| LOCAL_SOURCE.to_string()),
        );
        meta.topic = Some(query.to_string());
        meta.sources = material.pages.iter().map(|(url, _)| url.clone()).collect();
        meta.tags = research_tags(extra_tags, fallback);

        let report = Report::new(meta, draft.body);
        let file_name = match draft.suffix {
            Some(suffix) => reports::suffixed_report_file_name(query, report.meta.created_at, suffix),
            None => reports::report_file_name(query, report.meta.created_at),
        };
        let dir = &self.config.reports.dir;
        let report_path = reports::write_report(dir, &file_name, &report)?;

        let doc = report.to_document(&reports::source_key(dir, &report_path));
        let ingest = self.pipeline.ingest_with(doc, cancel).await?;

        tracing::info!(
            query,
            report = %report_path.display(),
            pages = material.pages.len(),
            follow_ups = draft.follow_ups.len(),
            fallback,
            "research complete"
        );

        Ok(ResearchOutcome {
            query: query.to_string(),
            report_path,
            fetched: material.pages.into_iter().map(|(url, _)| url).collect(),
            failed: material.failed,
            fallback,
            follow_ups: draft.follow_ups,
            ingest,
        })
    }

    // ============ Feedback ============

    /// Append a dated correction to a document and re-ingest it.
    ///
    /// `target` is a report path or a document id. When the document is
    /// backed by a saved report, the file is rewritten too.
    pub async fn feedback(&self, target: &str, correction: &str) -> anyhow::Result<IngestOutcome> {
        let correction = correction.trim();
        if correction.is_empty() {
            anyhow::bail!("correction text is empty");
        }
        let heading = format!("## Correction ({})", Utc::now().format("%Y-%m-%d"));

        let path = match Path::new(target) {
            p if p.is_file() => Some(p.to_path_buf()),
            _ => self.find_report(target)?,
        };
        if let Some(path) = path.as_deref() {
            let mut report = reports::read_report(path)?;
            report.body = format!("{}\n\n{}\n\n{}", report.body.trim_end(), heading, correction);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("report path has no file name")?;
            reports::write_report(dir, &file_name, &report)?;

            let doc = report.to_document(&self.report_key(path));
            return Ok(self.pipeline.ingest_with(doc, &CancellationToken::new()).await?);
        }

        let latest = match self.store.latest_version(target).await? {
            Lookup::Found(v) => v,
            Lookup::NotFound => {
                return Err(HarnessError::InvalidDocument {
                    id: target.to_string(),
                    reason: "no such document or report file".into(),
                }
                .into())
            }
        };
        let mut doc = latest.document;
        doc.text = format!("{}\n\n{}\n\n{}", doc.text.trim_end(), heading, correction);
        doc.ingested_at = Utc::now().trunc_subsecs(3);
        Ok(self.pipeline.ingest_with(doc, &CancellationToken::new()).await?)
    }

    // ============ Ingest / refresh ============

    /// Ingest one report file, or every matching report under a directory.
    pub async fn ingest_path(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RefreshSummary> {
        let loaded = if path.is_dir() {
            reports::load_reports(path, &self.config.reports.include_globs)?
        } else {
            vec![(path.to_path_buf(), reports::read_report(path)?)]
        };

        let keys: Vec<PathBuf> = loaded.iter().map(|(p, _)| p.clone()).collect();
        let docs = loaded
            .iter()
            .map(|(p, report)| report.to_document(&self.report_key(p)))
            .collect();

        let results = self.pipeline.ingest_many(docs, cancel).await;

        let mut summary = RefreshSummary::default();
        for (path, result) in keys.into_iter().zip(results) {
            match result {
                Ok(IngestOutcome::Indexed { .. }) => summary.indexed += 1,
                Ok(IngestOutcome::Unchanged { .. }) => summary.unchanged += 1,
                Err(HarnessError::EmbeddingFailure { operation, reason }) => {
                    // Nothing can be indexed without vectors; stop here.
                    return Err(HarnessError::EmbeddingFailure { operation, reason }.into());
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ingest failed");
                    summary.failed.push((path, e.to_string()));
                }
            }
        }
        Ok(summary)
    }

    /// Re-ingest every saved report.
    pub async fn refresh(&self) -> anyhow::Result<RefreshSummary> {
        let dir = self.config.reports.dir.clone();
        self.ingest_path(&dir, &CancellationToken::new()).await
    }

    // ============ Expand ============

    /// Research the `top_n` weakest-covered taxonomy labels. A failure on one
    /// label is reported and does not stop the others.
    pub async fn expand(
        &self,
        labels: &[String],
        top_n: usize,
        collab: &Collaborators,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, anyhow::Result<ResearchOutcome>)>> {
        let gaps = self.gaps.taxonomy_gaps(labels).await?;
        let tags = vec![GAP_TAG.to_string(), "expansion".to_string()];

        let mut results = Vec::new();
        for gap in gaps.into_iter().take(top_n) {
            let topic = gap.section.text.clone();
            tracing::info!(topic = %topic, similarity = gap.similarity, "expanding gap");
            let outcome = self.research(&topic, &tags, collab, cancel).await;
            results.push((topic, outcome));
        }
        Ok(results)
    }

    // ============ Tasks ============

    /// Route `task`, run its handler, and move it to `done` or `failed`.
    pub async fn run_task(
        &self,
        task: &mut Task,
        collab: &Collaborators,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TaskOutput> {
        let handler = router::dispatch(task)?;

        let result = self.run_handler(handler, task, collab, cancel).await;
        match &result {
            Ok(_) => task.complete()?,
            Err(e) => task.fail(format!("{:#}", e))?,
        }
        result
    }

    async fn run_handler(
        &self,
        handler: Handler,
        task: &Task,
        collab: &Collaborators,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TaskOutput> {
        match handler {
            Handler::Retriever => {
                let question = text_payload(task)?;
                Ok(TaskOutput::Answer(self.ask(question, collab).await?))
            }
            Handler::Research => {
                let query = text_payload(task)?;
                let outcome = self.research(query, &task.tags, collab, cancel).await?;
                Ok(TaskOutput::Research(outcome))
            }
            Handler::Feedback => {
                let field = |name: &str| {
                    task.payload
                        .get(name)
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| HarnessError::InvalidPayload {
                            task_id: task.id,
                            reason: format!("feedback needs a string '{}' field", name),
                        })
                };
                let target = field("document")?;
                let correction = field("correction")?;
                Ok(TaskOutput::Feedback(self.feedback(target, correction).await?))
            }
            Handler::Ingest => {
                let path = text_payload(task)?;
                Ok(TaskOutput::Ingest(
                    self.ingest_path(Path::new(path), cancel).await?,
                ))
            }
        }
    }

    /// The saved report whose document id is `document_id`, if any.
    fn find_report(&self, document_id: &str) -> anyhow::Result<Option<PathBuf>> {
        let dir = &self.config.reports.dir;
        if !dir.is_dir() {
            return Ok(None);
        }
        let found = reports::load_reports(dir, &self.config.reports.include_globs)?
            .into_iter()
            .map(|(path, _)| path)
            .find(|path| document_id_for(&self.report_key(path)) == document_id);
        Ok(found)
    }

    fn report_key(&self, path: &Path) -> String {
        let dir = &self.config.reports.dir;
        match (path.canonicalize(), dir.canonicalize()) {
            (Ok(p), Ok(d)) if p.starts_with(&d) => reports::source_key(&d, &p),
            _ => reports::source_key(dir, path),
        }
    }
}

fn text_payload(task: &Task) -> Result<&str> {
    task.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HarnessError::InvalidPayload {
            task_id: task.id,
            reason: format!("'{}' task needs a non-empty text payload", task.kind),
        })
}

fn cancelled_research(query: &str) -> HarnessError {
    HarnessError::Cancelled {
        operation: format!("research of '{}'", query),
    }
}

/// Question lines from a model reply, list markers stripped. When some
/// lines end in `?`, preamble lines that don't are dropped.
fn follow_up_questions(raw: &str) -> Vec<String> {
    let lines: Vec<&str> = raw
        .lines()
        .map(strip_list_marker)
        .filter(|line| !line.is_empty())
        .collect();
    let asks = lines.iter().any(|line| line.ends_with('?'));
    lines
        .into_iter()
        .filter(|line| !asks || line.ends_with('?'))
        .take(FOLLOW_UP_QUESTIONS)
        .map(str::to_string)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let unnumbered = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = match unnumbered.strip_prefix(['.', ')']) {
        Some(rest) if unnumbered.len() < line.len() => rest,
        _ => line.trim_start_matches(['-', '*']),
    };
    rest.trim()
}

fn large_report_context(query: &str, summary: &str, answers: &[(String, String)]) -> String {
    let mut out = format!(
        "# Final research report on {}

## Initial summary

{}

## Follow-up questions",
        query,
        summary.trim()
    );
    for (question, answer) in answers {
        out.push_str(&format!("

### {}

{}", question, answer.trim()));
    }
    out
}

fn research_tags(extra: &[String], fallback: bool) -> Vec<String> {
    let mut tags = vec![RESEARCH_TAG.to_string()];
    for tag in extra {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    if fallback {
        tags.push(FALLBACK_TAG.to_string());
    }
    tags
}

/// `[1] chunk text` blocks, one per retrieved chunk.
pub fn numbered_context(hits: &[ScoredChunk]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| format!("[{}] {}", i + 1, hit.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn research_context(query: &str, related: &[ScoredChunk], pages: &[(String, String)]) -> String {
    let mut out = format!("# Research material on {}\n\n", query);
    if !related.is_empty() {
        out.push_str("## Existing knowledge\n\n");
        out.push_str(&numbered_context(related));
        out.push_str("\n\n");
    }
    if !pages.is_empty() {
        out.push_str("## Web findings\n\n");
        let findings: Vec<String> = pages
            .iter()
            .map(|(url, text)| format!("Source: {}\n\n{}", url, text.trim()))
            .collect();
        out.push_str(&findings.join("\n\n---\n\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_research_tags_dedup_and_fallback() {
        let tags = research_tags(&["gap".into(), "research".into()], true);
        assert_eq!(tags, vec!["research", "gap", "fallback"]);
    }

    #[test]
    fn test_follow_up_questions_strip_markers_and_preamble() {
        let raw = "Here are three questions:\n\n1. How is entanglement verified?\n\
                   2) What breaks it?\n- Can it carry information?\n4. One too many?";
        assert_eq!(
            follow_up_questions(raw),
            vec![
                "How is entanglement verified?",
                "What breaks it?",
                "Can it carry information?",
            ]
        );
        assert_eq!(follow_up_questions("2024 results so far"), vec!["2024 results so far"]);
        assert!(follow_up_questions("\n  \n").is_empty());
    }

    #[test]
    fn test_reconcile_report_summary() {
        let report = ReconcileReport {
            orphan_vectors: vec!["a".into()],
            ..Default::default()
        };
        assert!(!report.is_consistent());
        assert!(report.summary().starts_with("1 orphan vectors"));
        assert!(ReconcileReport::default().is_consistent());
    }
}
