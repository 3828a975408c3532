//! End-to-end tests for the knowledge-base workflows.
//!
//! Search, fetch, and completion are scripted fakes; embeddings use the
//! offline hash embedder. Nothing here touches the network.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use research_harness::collab::{Collaborators, Completion, Fetcher, SearchClient};
use research_harness::config::Config;
use research_harness::error::{ExitCode, HarnessError, Lookup, Result, Stage};
use research_harness::ingest::IngestOutcome;
use research_harness::reports::{self, Report, ReportMeta};
use research_harness::store::{MetadataStore, Store, VectorStore};
use research_harness::task::{Task, TaskKind, TaskStatus};
use research_harness::workflow::{Answer, KnowledgeBase, TaskOutput};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ─── Fakes ──────────────────────────────────────────────────────────

struct FakeSearch {
    urls: Vec<String>,
    down: bool,
}

#[async_trait]
impl SearchClient for FakeSearch {
    async fn search(&self, _query: &str, num_results: usize) -> Result<Vec<String>> {
        if self.down {
            return Err(HarnessError::unavailable(Stage::Search, "connection refused"));
        }
        Ok(self.urls.iter().take(num_results).cloned().collect())
    }
}

/// Serves canned pages; unknown URLs fail like a dead host.
struct FakeFetcher {
    pages: HashMap<String, String>,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| HarnessError::unavailable(Stage::Fetch, format!("{} timed out", url)))
    }
}

/// Echoes its context back, so saved reports carry the fetched text.
/// With no context it answers from "its own knowledge".
#[derive(Default)]
struct EchoCompletion {
    calls: AtomicUsize,
}

#[async_trait]
impl Completion for EchoCompletion {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if context.is_empty() {
            Ok(format!("Direct answer about {}.", prompt))
        } else {
            Ok(format!("Summary.\n\n{}", context))
        }
    }
}

const QUANTUM_URL: &str = "https://physics.example/entanglement";
const DEAD_URL: &str = "https://dead.example/page";
const QUANTUM_PAGE: &str = "Quantum entanglement links the measurement outcomes of particles \
    that interacted in the past. Bell inequality experiments confirm entanglement.";

fn collaborators(urls: &[&str], down: bool) -> (Collaborators, Arc<EchoCompletion>) {
    let mut pages = HashMap::new();
    pages.insert(QUANTUM_URL.to_string(), QUANTUM_PAGE.to_string());
    pages.insert(
        "https://bread.example/sourdough".to_string(),
        "Sourdough fermentation relies on wild yeast and a patient proof.".to_string(),
    );
    let completion = Arc::new(EchoCompletion::default());
    let collab = Collaborators {
        search: Arc::new(FakeSearch {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            down,
        }),
        fetcher: Arc::new(FakeFetcher { pages }),
        completion: completion.clone(),
    };
    (collab, completion)
}

fn test_config(tmp: &TempDir, db: &str) -> Config {
    let mut config = Config::minimal();
    config.reports.dir = tmp.path().join("reports");
    config.retry.max_attempts = 1;
    config.retry.base_delay_ms = 1;
    if db != ":memory:" {
        config.db.path = tmp.path().join(db);
    }
    config
}

async fn open_kb(tmp: &TempDir) -> KnowledgeBase {
    KnowledgeBase::open(test_config(tmp, ":memory:")).await.unwrap()
}

fn report_files(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

// ─── Research and ask ───────────────────────────────────────────────

#[tokio::test]
async fn test_research_skips_failed_fetch_and_ingests_report() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, _) = collaborators(&[QUANTUM_URL, DEAD_URL], false);

    let outcome = kb
        .research("quantum entanglement", &[], &collab, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.fetched, vec![QUANTUM_URL]);
    assert_eq!(outcome.failed, vec![DEAD_URL]);
    assert!(!outcome.fallback);
    assert!(outcome.follow_ups.is_empty());
    assert!(matches!(outcome.ingest, IngestOutcome::Indexed { version: 1, .. }));

    let report = reports::read_report(&outcome.report_path).unwrap();
    assert_eq!(report.meta.source_url, QUANTUM_URL);
    assert_eq!(report.meta.topic.as_deref(), Some("quantum entanglement"));
    assert_eq!(report.meta.tags, vec!["research"]);
    assert!(report.body.contains("Bell inequality"));

    let answer = kb.ask("what is quantum entanglement?", &collab).await.unwrap();
    match answer {
        Answer::Answered { sources, .. } => {
            assert!(!sources.is_empty());
            assert_eq!(sources[0].document_id, outcome.ingest.document_id());
        }
        Answer::NoResults => panic!("expected an answer"),
    }
}

/// Plays each role of the large research flow by recognizing its prompt.
#[derive(Default)]
struct ScriptedCompletion {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Completion for ScriptedCompletion {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), context.to_string()));
        let reply = if prompt.contains("follow-up questions") {
            "Three questions worth asking:\n\
             1. How is entanglement verified?\n\
             2. What breaks entanglement?\n\
             3. Can entanglement carry information?"
                .to_string()
        } else if let Some((_, question)) = prompt.rsplit_once("Question: ") {
            format!("Answer to: {}", question)
        } else if prompt.contains("Weave") {
            format!("Woven report.\n\n{}", context)
        } else {
            "Entanglement summary.".to_string()
        };
        Ok(reply)
    }
}

#[tokio::test]
async fn test_large_research_answers_follow_ups_and_weaves_one_report() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (mut collab, _) = collaborators(&[QUANTUM_URL], false);
    let scripted = Arc::new(ScriptedCompletion::default());
    collab.completion = scripted.clone();

    let outcome = kb
        .research_large("quantum entanglement", &[], &collab, &CancellationToken::new())
        .await
        .unwrap();

    let name = outcome.report_path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.ends_with("_quantum_entanglement_large.md"), "{}", name);
    assert_eq!(
        outcome.follow_ups,
        vec![
            "How is entanglement verified?",
            "What breaks entanglement?",
            "Can entanglement carry information?",
        ]
    );
    assert!(matches!(outcome.ingest, IngestOutcome::Indexed { version: 1, .. }));

    let report = reports::read_report(&outcome.report_path).unwrap();
    assert!(report.body.starts_with("Woven report."));
    assert!(report.body.contains("## Initial summary\n\nEntanglement summary."));
    assert!(report
        .body
        .contains("### What breaks entanglement?\n\nAnswer to: What breaks entanglement?"));
    assert_eq!(report.meta.tags, vec!["research", "large"]);
    assert_eq!(report.meta.sources, vec![QUANTUM_URL]);

    // Summary, questions, three answers, final weave.
    let calls = scripted.calls.lock().unwrap();
    assert_eq!(calls.len(), 6);
    let answers: Vec<_> = calls
        .iter()
        .filter(|(prompt, _)| prompt.contains("Question: "))
        .collect();
    assert_eq!(answers.len(), 3);
    assert!(answers
        .iter()
        .all(|(_, context)| context.contains("Entanglement summary.")));
}

#[tokio::test]
async fn test_large_research_stops_on_search_outage() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (mut collab, _) = collaborators(&[QUANTUM_URL], true);
    let scripted = Arc::new(ScriptedCompletion::default());
    collab.completion = scripted.clone();

    assert!(kb
        .research_large("quantum entanglement", &[], &collab, &CancellationToken::new())
        .await
        .is_err());
    assert!(scripted.calls.lock().unwrap().is_empty());
    assert!(report_files(&kb.config().reports.dir).is_empty());
}

#[tokio::test]
async fn test_research_falls_back_to_model_when_nothing_found() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, completion) = collaborators(&[DEAD_URL], false);

    let outcome = kb
        .research("topological qubits", &[], &collab, &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.fallback);
    assert!(outcome.fetched.is_empty());
    assert_eq!(completion.calls.load(Ordering::SeqCst), 1);

    let report = reports::read_report(&outcome.report_path).unwrap();
    assert_eq!(report.meta.source_url, "local");
    assert!(report.meta.tags.contains(&"fallback".to_string()));
    assert!(report.body.contains("Direct answer about topological qubits"));
}

#[tokio::test]
async fn test_search_outage_is_an_error_and_saves_nothing() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, completion) = collaborators(&[], true);

    let err = kb
        .research("anything", &[], &collab, &CancellationToken::new())
        .await
        .unwrap_err();

    let harness = err.downcast_ref::<HarnessError>().expect("typed error");
    assert_eq!(harness.stage(), Stage::Search);
    assert_eq!(harness.exit_code(), ExitCode::CollaboratorUnreachable);
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    assert!(report_files(&kb.config().reports.dir).is_empty());
    assert!(kb.index().is_empty());
}

#[tokio::test]
async fn test_ask_with_empty_index_has_no_results() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, completion) = collaborators(&[], false);

    let answer = kb.ask("what is entanglement?", &collab).await.unwrap();
    assert!(matches!(answer, Answer::NoResults));
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
}

// ─── Feedback ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_feedback_by_id_rewrites_report_and_bumps_version() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, _) = collaborators(&[QUANTUM_URL], false);

    let outcome = kb
        .research("quantum entanglement", &[], &collab, &CancellationToken::new())
        .await
        .unwrap();
    let doc_id = outcome.ingest.document_id().to_string();

    let after = kb
        .feedback(&doc_id, "Entanglement does not allow faster-than-light signalling.")
        .await
        .unwrap();
    assert!(matches!(
        after,
        IngestOutcome::Indexed { version: 2, ref document_id, .. } if *document_id == doc_id
    ));

    let text = std::fs::read_to_string(&outcome.report_path).unwrap();
    assert!(text.contains("## Correction ("));
    assert!(text.contains("faster-than-light"));

    let latest = kb.store().latest_version(&doc_id).await.unwrap();
    match latest {
        Lookup::Found(v) => {
            assert_eq!(v.version, 2);
            assert!(v.document.text.contains("faster-than-light"));
        }
        Lookup::NotFound => panic!("document vanished"),
    }
}

#[tokio::test]
async fn test_feedback_on_unknown_document_is_invalid() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;

    let err = kb.feedback("0123456789abcdef", "fix").await.unwrap_err();
    let harness = err.downcast_ref::<HarnessError>().expect("typed error");
    assert!(matches!(harness, HarnessError::InvalidDocument { .. }));
}

// ─── Refresh ────────────────────────────────────────────────────────

fn write_note(dir: &Path, name: &str, topic: &str, body: &str) {
    let mut meta = ReportMeta::new("local");
    meta.topic = Some(topic.to_string());
    meta.tags = vec!["notes".to_string()];
    reports::write_report(dir, name, &Report::new(meta, body)).unwrap();
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let dir = kb.config().reports.dir.clone();
    write_note(&dir, "a.md", "qubits", QUANTUM_PAGE);
    write_note(&dir, "b.md", "bread", "Sourdough needs a lively starter.");

    let first = kb.refresh().await.unwrap();
    assert_eq!((first.indexed, first.unchanged), (2, 0));
    let chunks = kb.index().len();

    let second = kb.refresh().await.unwrap();
    assert_eq!((second.indexed, second.unchanged), (0, 2));
    assert_eq!(kb.index().len(), chunks);
    assert!(kb.reconcile().await.unwrap().is_consistent());
}

// ─── Reconcile and persistence ──────────────────────────────────────

#[tokio::test]
async fn test_reconcile_finds_and_repairs_drift() {
    let tmp = TempDir::new().unwrap();
    let kb = KnowledgeBase::open(test_config(&tmp, "rh.sqlite"))
        .await
        .unwrap();
    let dir = kb.config().reports.dir.clone();
    write_note(&dir, "a.md", "qubits", QUANTUM_PAGE);
    kb.refresh().await.unwrap();

    let doc_id = kb.store().documents().await.unwrap()[0].document.id.clone();
    let chunk_id = kb.store().document_chunk_ids(&doc_id).await.unwrap()[0].clone();
    kb.store().delete_vector(&chunk_id).await.unwrap();
    kb.store()
        .put_vector("ghost:00000", "ghost", &[0.5; 384])
        .await
        .unwrap();

    let drift = kb.reconcile().await.unwrap();
    assert_eq!(drift.orphan_metadata, vec![chunk_id.clone()]);
    assert_eq!(drift.orphan_vectors, vec!["ghost:00000".to_string()]);
    assert_eq!(drift.index_extra, vec![chunk_id.clone()]);

    let found = kb.repair().await.unwrap();
    assert_eq!(found, drift);
    assert!(kb.reconcile().await.unwrap().is_consistent());
    assert!(kb.index().contains(&chunk_id));
    assert!(!kb.index().contains("ghost:00000"));
    kb.close().await;
}

/// Leaves one chunk without its vector and one vector without its chunk,
/// the state a crash between the two tables would leave behind.
async fn plant_drift(tmp: &TempDir) -> String {
    let kb = KnowledgeBase::open(test_config(tmp, "rh.sqlite"))
        .await
        .unwrap();
    let dir = kb.config().reports.dir.clone();
    write_note(&dir, "a.md", "qubits", QUANTUM_PAGE);
    kb.refresh().await.unwrap();

    let doc_id = kb.store().documents().await.unwrap()[0].document.id.clone();
    let chunk_id = kb.store().document_chunk_ids(&doc_id).await.unwrap()[0].clone();
    kb.store().delete_vector(&chunk_id).await.unwrap();
    kb.store()
        .put_vector("ghost:00000", "ghost", &[0.5; 384])
        .await
        .unwrap();
    kb.close().await;
    chunk_id
}

#[tokio::test]
async fn test_open_rebuilds_drift_from_stored_text() {
    let tmp = TempDir::new().unwrap();
    let chunk_id = plant_drift(&tmp).await;

    let kb = KnowledgeBase::open(test_config(&tmp, "rh.sqlite"))
        .await
        .unwrap();
    let repaired = kb.repaired_on_open().unwrap();
    assert_eq!(repaired.orphan_metadata, vec![chunk_id.clone()]);
    assert_eq!(repaired.orphan_vectors, vec!["ghost:00000".to_string()]);

    assert!(kb.reconcile().await.unwrap().is_consistent());
    assert!(kb.index().contains(&chunk_id));
    assert!(!kb.store().vector_ids().await.unwrap().contains(&"ghost:00000".to_string()));
    kb.close().await;

    // A clean store opens without any repair.
    let kb = KnowledgeBase::open(test_config(&tmp, "rh.sqlite"))
        .await
        .unwrap();
    assert!(kb.repaired_on_open().is_none());
    kb.close().await;
}

#[tokio::test]
async fn test_open_reports_corruption_when_rebuild_cannot_embed() {
    let tmp = TempDir::new().unwrap();
    plant_drift(&tmp).await;

    let mut config = test_config(&tmp, "rh.sqlite");
    config.embedding.provider = "disabled".to_string();
    let err = match KnowledgeBase::open(config).await {
        Ok(_) => panic!("open should fail on unrepairable drift"),
        Err(e) => e,
    };
    let harness = err
        .chain()
        .find_map(|e| e.downcast_ref::<HarnessError>())
        .unwrap();
    assert!(matches!(harness, HarnessError::IndexCorruption { .. }));
    assert_eq!(harness.exit_code(), ExitCode::IndexCorrupted);
}

#[tokio::test]
async fn test_reopen_rebuilds_identical_index() {
    let tmp = TempDir::new().unwrap();
    let (collab, _) = collaborators(&[], false);

    let kb = KnowledgeBase::open(test_config(&tmp, "rh.sqlite"))
        .await
        .unwrap();
    let dir = kb.config().reports.dir.clone();
    write_note(&dir, "a.md", "qubits", QUANTUM_PAGE);
    write_note(&dir, "b.md", "bread", "Sourdough needs a lively starter.");
    kb.refresh().await.unwrap();
    let before = kb.retriever().query("entanglement", 5).await.unwrap();
    let indexed = kb.index().len();
    kb.close().await;

    let kb = KnowledgeBase::open(test_config(&tmp, "rh.sqlite"))
        .await
        .unwrap();
    assert_eq!(kb.index().len(), indexed);
    let after = kb.retriever().query("entanglement", 5).await.unwrap();
    let ids = |hits: &[research_harness::models::ScoredChunk]| {
        hits.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&before), ids(&after));
    assert!(matches!(
        kb.ask("entanglement", &collab).await.unwrap(),
        Answer::Answered { .. }
    ));
    kb.close().await;
}

// ─── Tasks ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_task_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, _) = collaborators(&[QUANTUM_URL], false);
    let cancel = CancellationToken::new();

    let mut research =
        Task::from_json(r#"{"type":"ask","payload":"quantum entanglement","tags":["gap"]}"#)
            .unwrap();
    let output = kb.run_task(&mut research, &collab, &cancel).await.unwrap();
    assert!(matches!(output, TaskOutput::Research(_)));
    assert_eq!(research.status, TaskStatus::Done);

    let mut ask = Task::new(TaskKind::Ask, "quantum entanglement");
    let output = kb.run_task(&mut ask, &collab, &cancel).await.unwrap();
    assert!(matches!(output, TaskOutput::Answer(Answer::Answered { .. })));
    assert_eq!(ask.status, TaskStatus::Done);

    let mut unknown = Task::from_json(r#"{"type":"translate","payload":"hola"}"#).unwrap();
    let err = kb.run_task(&mut unknown, &collab, &cancel).await.unwrap_err();
    let harness = err.downcast_ref::<HarnessError>().expect("typed error");
    assert_eq!(harness.exit_code(), ExitCode::InvalidInput);
    assert_eq!(unknown.status, TaskStatus::Failed);

    let mut bad = Task::new(TaskKind::Ask, serde_json::json!(42));
    let err = kb.run_task(&mut bad, &collab, &cancel).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::InvalidPayload { .. })
    ));
    assert_eq!(bad.status, TaskStatus::Failed);
    assert!(bad.failure.is_some());

    let retry = bad.retry().unwrap();
    assert_eq!(retry.caused_by, Some(bad.id));
}

#[tokio::test]
async fn test_feedback_task_needs_both_fields() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, _) = collaborators(&[], false);

    let mut task = Task::new(
        TaskKind::Feedback,
        serde_json::json!({ "document": "abc" }),
    );
    let err = kb
        .run_task(&mut task, &collab, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("correction"));
    assert_eq!(task.status, TaskStatus::Failed);
}

// ─── Expansion ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_expand_researches_weakest_topics() {
    let tmp = TempDir::new().unwrap();
    let kb = open_kb(&tmp).await;
    let (collab, _) = collaborators(&["https://bread.example/sourdough"], false);

    let labels = vec!["sourdough baking".to_string(), "tapestry weaving".to_string()];
    let results = kb
        .expand(&labels, 1, &collab, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let (topic, outcome) = &results[0];
    assert_eq!(topic, "sourdough baking");
    let outcome = outcome.as_ref().unwrap();
    let report = reports::read_report(&outcome.report_path).unwrap();
    assert!(report.meta.tags.contains(&"gap".to_string()));
    assert!(report.meta.tags.contains(&"expansion".to_string()));
    assert_eq!(kb.store().documents().await.unwrap().len(), 1);
}
