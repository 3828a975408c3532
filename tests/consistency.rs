//! The metadata table, the durable vectors, and the in-memory index must
//! always name the same chunk ids, whatever mix of ingests, rewrites, and
//! deletes ran before. Checked on both storage backends.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use research_harness::config::ChunkingConfig;
use research_harness::embedding::HashEmbedder;
use research_harness::index::VectorIndex;
use research_harness::ingest::{IngestOutcome, IngestionPipeline};
use research_harness::models::{document_id_for, Document};
use research_harness::store::{InMemoryStore, MetadataStore, SqliteStore, Store, VectorStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SOURCES: [&str; 4] = ["notes/qubits.md", "notes/bread.md", "notes/tides.md", "notes/moss.md"];

fn pipeline(store: Arc<dyn Store>) -> (Arc<VectorIndex>, IngestionPipeline) {
    let index = Arc::new(VectorIndex::new());
    let pipeline = IngestionPipeline::new(
        store,
        index.clone(),
        Arc::new(HashEmbedder::default()),
        ChunkingConfig {
            chunk_size: 40,
            overlap: 10,
        },
        4,
    );
    (index, pipeline)
}

/// Variants differ in length so a rewrite changes the chunk count.
fn body(source: usize, variant: usize) -> String {
    format!(
        "Entry {} revision {}. {}",
        source,
        variant,
        "Measurements drift with temperature and humidity. ".repeat(variant + 1)
    )
}

async fn snapshot(store: &dyn Store, index: &VectorIndex) -> (Vec<String>, Vec<String>, Vec<String>) {
    (
        store.chunk_ids().await.unwrap(),
        store.vector_ids().await.unwrap(),
        index.ids(),
    )
}

#[derive(Debug, Clone)]
enum Op {
    Ingest { source: usize, variant: usize },
    Batch(Vec<(usize, usize)>),
    Delete { source: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SOURCES.len(), 0..3usize)
            .prop_map(|(source, variant)| Op::Ingest { source, variant }),
        1 => prop::collection::vec((0..SOURCES.len(), 0..3usize), 1..6).prop_map(Op::Batch),
        2 => (0..SOURCES.len()).prop_map(|source| Op::Delete { source }),
    ]
}

async fn apply(pipeline: &IngestionPipeline, ops: &[Op]) {
    let cancel = CancellationToken::new();
    for op in ops {
        match op {
            Op::Ingest { source, variant } => {
                let doc = Document::new(SOURCES[*source], "local", body(*source, *variant));
                pipeline.ingest_with(doc, &cancel).await.unwrap();
            }
            Op::Batch(items) => {
                let docs = items
                    .iter()
                    .map(|(source, variant)| {
                        Document::new(SOURCES[*source], "local", body(*source, *variant))
                    })
                    .collect();
                for result in pipeline.ingest_many(docs, &cancel).await {
                    result.unwrap();
                }
            }
            Op::Delete { source } => {
                pipeline.delete(&document_id_for(SOURCES[*source])).await.unwrap();
            }
        }
    }
}

/// Documents whose last operation was an ingest.
fn expected_live(ops: &[Op]) -> BTreeSet<String> {
    let mut live = BTreeSet::new();
    for op in ops {
        match op {
            Op::Ingest { source, .. } => {
                live.insert(document_id_for(SOURCES[*source]));
            }
            Op::Batch(items) => {
                live.extend(items.iter().map(|(source, _)| document_id_for(SOURCES[*source])));
            }
            Op::Delete { source } => {
                live.remove(&document_id_for(SOURCES[*source]));
            }
        }
    }
    live
}

fn documents_of(chunk_ids: &[String]) -> BTreeSet<String> {
    chunk_ids
        .iter()
        .filter_map(|id| id.rsplit_once(':').map(|(doc, _)| doc.to_string()))
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn memory_store_and_index_agree(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let (meta, vectors, index_ids) = runtime().block_on(async {
            let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
            let (index, pipeline) = pipeline(store.clone());
            apply(&pipeline, &ops).await;
            snapshot(store.as_ref(), &index).await
        });
        prop_assert_eq!(&meta, &vectors);
        prop_assert_eq!(&meta, &index_ids);
        prop_assert_eq!(documents_of(&meta), expected_live(&ops));
    }

    #[test]
    fn sqlite_store_and_index_agree(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let tmp = TempDir::new().unwrap();
        let (meta, vectors, index_ids, reloaded) = runtime().block_on(async {
            let store: Arc<dyn Store> =
                Arc::new(SqliteStore::open(&tmp.path().join("rh.sqlite")).await.unwrap());
            let (index, pipeline) = pipeline(store.clone());
            apply(&pipeline, &ops).await;
            let (meta, vectors, index_ids) = snapshot(store.as_ref(), &index).await;
            let reloaded = VectorIndex::from_vectors(store.load_vectors().await.unwrap()).ids();
            store.close().await;
            (meta, vectors, index_ids, reloaded)
        });
        prop_assert_eq!(&meta, &vectors);
        prop_assert_eq!(&meta, &index_ids);
        prop_assert_eq!(&meta, &reloaded);
        prop_assert_eq!(documents_of(&meta), expected_live(&ops));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_on_sqlite_commits_every_document() {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&tmp.path().join("rh.sqlite")).await.unwrap());
    let (index, pipeline) = pipeline(store.clone());
    let cancel = CancellationToken::new();

    for round in 0..5usize {
        let docs = (0..16)
            .map(|i| {
                let text = format!("{} Round {}.", body(i, round % 3), round);
                Document::new(&format!("notes/{}.md", i), "local", text)
            })
            .collect();
        let results = pipeline.ingest_many(docs, &cancel).await;

        let failures: Vec<String> = results
            .iter()
            .filter_map(|r| r.as_ref().err().map(|e| e.to_string()))
            .collect();
        assert!(failures.is_empty(), "round {}: {:?}", round, failures);
        assert!(results.iter().all(|r| matches!(
            r,
            Ok(IngestOutcome::Indexed { version, .. }) if *version == round as i64 + 1
        )));
    }

    let (meta, vectors, index_ids) = snapshot(store.as_ref(), &index).await;
    assert!(!meta.is_empty());
    assert_eq!(meta, vectors);
    assert_eq!(meta, index_ids);

    let latest = store
        .latest_version(&document_id_for("notes/7.md"))
        .await
        .unwrap()
        .found()
        .unwrap();
    assert_eq!(latest.version, 5);
}
