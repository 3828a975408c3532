//! # Research Harness CLI (`rh`)
//!
//! ## Usage
//!
//! ```bash
//! rh --config ./config/rh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rh init` | Create the database and the reports directory |
//! | `rh generate "<query>"` | Search, fetch, summarize, save a report, ingest it |
//! | `rh generate --large "<query>"` | Same, plus follow-up questions woven into a longer report |
//! | `rh refresh` | Re-ingest every saved report |
//! | `rh ask "<question>"` | Answer from the knowledge base |
//! | `rh ingest <path>` | Ingest a report file or directory |
//! | `rh gaps <draft.md>` | List draft sections the knowledge base covers poorly |
//! | `rh expand <taxonomy>` | Research the weakest taxonomy topics |
//! | `rh reconcile [--repair]` | Check (and fix) store/index drift; drift found at startup is repaired on open |
//! | `rh task '<json>'` | Route and run a task |
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error |
//! | 2 | A collaborator (search, fetch, completion) is unreachable |
//! | 3 | No results |
//! | 4 | Index corruption |
//! | 5 | Invalid input or unroutable task |

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use research_harness::config::{load_config, Config};
use research_harness::error::{ExitCode, HarnessError};
use research_harness::gap::{split_sections, taxonomy_labels};
use research_harness::task::Task;
use research_harness::workflow::{Answer, KnowledgeBase, RefreshSummary, ResearchOutcome, TaskOutput};

/// Research Harness: web research into saved reports, hybrid retrieval,
/// and knowledge-gap detection.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rh",
    about = "Research Harness: a local-first research assistant",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and the reports directory. Safe to rerun.
    Init,

    /// Research a query on the web, save a report, and ingest it.
    Generate {
        query: String,

        /// Extra tags for the saved report.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Ask follow-up questions, answer each, and save one longer
        /// report with a `_large` suffix.
        #[arg(long)]
        large: bool,
    },

    /// Re-ingest every saved report. Unchanged reports are skipped.
    Refresh,

    /// Answer a question from the knowledge base.
    Ask { question: String },

    /// Ingest a report file, or every report under a directory.
    Ingest { path: PathBuf },

    /// Report the sections of a markdown draft that the knowledge base
    /// covers poorly.
    Gaps { draft: PathBuf },

    /// Research the weakest-covered topics of a taxonomy file
    /// (one topic per line).
    Expand {
        taxonomy: PathBuf,

        /// How many of the weakest topics to research.
        #[arg(long, default_value_t = 5)]
        top_n: usize,
    },

    /// Compare the metadata store, the durable vectors, and the in-memory
    /// index. Exits with code 4 on drift unless `--repair` fixes it.
    Reconcile {
        #[arg(long)]
        repair: bool,
    },

    /// Route and run a task given as JSON, e.g.
    /// `{"type": "ask", "payload": "what is entanglement?"}`.
    Task { json: String },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    std::process::exit(code.into());
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn report_error(err: &anyhow::Error) -> ExitCode {
    match err.chain().find_map(|e| e.downcast_ref::<HarnessError>()) {
        Some(harness) => {
            eprintln!("error [{}]: {:#}", harness.stage(), err);
            harness.exit_code()
        }
        None => {
            eprintln!("error: {:#}", err);
            ExitCode::GeneralError
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        return init(config).await;
    }

    let kb = KnowledgeBase::open(config).await?;
    let code = dispatch(&kb, cli.command).await;
    kb.close().await;
    code
}

async fn init(config: Config) -> anyhow::Result<ExitCode> {
    std::fs::create_dir_all(&config.reports.dir).with_context(|| {
        format!(
            "Failed to create reports dir: {}",
            config.reports.dir.display()
        )
    })?;
    let db_path = config.db.path.clone();
    let reports_dir = config.reports.dir.clone();
    let kb = KnowledgeBase::open(config).await?;
    kb.close().await;
    println!("Database initialized at {}", db_path.display());
    println!("Reports directory: {}", reports_dir.display());
    Ok(ExitCode::Success)
}

async fn dispatch(kb: &KnowledgeBase, command: Commands) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match command {
        Commands::Init => Ok(ExitCode::Success),
        Commands::Generate { query, tags, large } => {
            let collab = kb.collaborators()?;
            let outcome = if large {
                kb.research_large(&query, &tags, &collab, &cancel).await?
            } else {
                kb.research(&query, &tags, &collab, &cancel).await?
            };
            print_research(&outcome);
            Ok(ExitCode::Success)
        }
        Commands::Refresh => {
            let summary = kb.refresh().await?;
            print_refresh(&summary);
            Ok(summary_code(&summary))
        }
        Commands::Ask { question } => {
            let collab = kb.collaborators()?;
            let answer = kb.ask(&question, &collab).await?;
            Ok(print_answer(&answer))
        }
        Commands::Ingest { path } => {
            let summary = kb.ingest_path(&path, &cancel).await?;
            print_refresh(&summary);
            Ok(summary_code(&summary))
        }
        Commands::Gaps { draft } => gaps(kb, &draft).await,
        Commands::Expand { taxonomy, top_n } => expand(kb, &taxonomy, top_n, &cancel).await,
        Commands::Reconcile { repair } => reconcile(kb, repair).await,
        Commands::Task { json } => {
            let mut task = match Task::from_json(&json) {
                Ok(task) => task,
                Err(e) => {
                    eprintln!("error [route]: invalid task JSON: {}", e);
                    return Ok(ExitCode::InvalidInput);
                }
            };
            let collab = kb.collaborators()?;
            let result = kb.run_task(&mut task, &collab, &cancel).await;
            println!("task {} [{}] {}", task.id, task.kind, task.status);
            match result? {
                TaskOutput::Answer(answer) => Ok(print_answer(&answer)),
                TaskOutput::Research(outcome) => {
                    print_research(&outcome);
                    Ok(ExitCode::Success)
                }
                TaskOutput::Feedback(outcome) => {
                    println!("Re-ingested document {}", outcome.document_id());
                    Ok(ExitCode::Success)
                }
                TaskOutput::Ingest(summary) => {
                    print_refresh(&summary);
                    Ok(summary_code(&summary))
                }
            }
        }
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

async fn gaps(kb: &KnowledgeBase, draft: &Path) -> anyhow::Result<ExitCode> {
    let text = std::fs::read_to_string(draft)
        .with_context(|| format!("Failed to read draft: {}", draft.display()))?;
    let sections = split_sections(&text);
    if sections.is_empty() {
        println!("Draft has no sections.");
        return Ok(ExitCode::Success);
    }

    let reports = kb.gaps().analyze(&sections).await?;
    if reports.is_empty() {
        println!("No gaps: all {} sections are covered.", sections.len());
        return Ok(ExitCode::Success);
    }

    println!("{} of {} sections are gaps:\n", reports.len(), sections.len());
    for gap in &reports {
        let title = gap.section.heading.as_deref().unwrap_or("(untitled)");
        println!(
            "{}. [coverage {:.2}] {}",
            gap.section.index + 1,
            gap.similarity,
            title
        );
        println!("    suggested research: {}", gap.query);
    }
    Ok(ExitCode::Success)
}

async fn expand(
    kb: &KnowledgeBase,
    taxonomy: &Path,
    top_n: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<ExitCode> {
    let text = std::fs::read_to_string(taxonomy)
        .with_context(|| format!("Failed to read taxonomy: {}", taxonomy.display()))?;
    let labels = taxonomy_labels(&text);
    let collab = kb.collaborators()?;

    let results = kb.expand(&labels, top_n, &collab, cancel).await?;
    if results.is_empty() {
        println!("No expansion topics identified; the knowledge base covers the taxonomy.");
        return Ok(ExitCode::Success);
    }

    let mut failures = 0;
    for (topic, result) in &results {
        match result {
            Ok(outcome) => print_research(outcome),
            Err(e) => {
                failures += 1;
                eprintln!("expansion of '{}' failed: {:#}", topic, e);
            }
        }
    }
    println!(
        "Expanded {} of {} topics.",
        results.len() - failures,
        results.len()
    );
    Ok(if failures == results.len() {
        ExitCode::GeneralError
    } else {
        ExitCode::Success
    })
}

async fn reconcile(kb: &KnowledgeBase, repair: bool) -> anyhow::Result<ExitCode> {
    if let Some(found) = kb.repaired_on_open() {
        println!("Repaired on open: {}", found.summary());
    }
    if repair {
        let found = kb.repair().await?;
        if found.is_consistent() {
            println!("Consistent.");
        } else {
            println!("Repaired: {}", found.summary());
        }
        let after = kb.reconcile().await?;
        if !after.is_consistent() {
            return Err(HarnessError::IndexCorruption {
                detail: format!("drift remains after repair: {}", after.summary()),
            }
            .into());
        }
        return Ok(ExitCode::Success);
    }

    let report = kb.reconcile().await?;
    if report.is_consistent() {
        println!("Consistent: {} chunks indexed.", kb.index().len());
        Ok(ExitCode::Success)
    } else {
        for id in &report.orphan_vectors {
            println!("orphan vector: {}", id);
        }
        for id in &report.orphan_metadata {
            println!("orphan metadata: {}", id);
        }
        Err(HarnessError::IndexCorruption {
            detail: report.summary(),
        }
        .into())
    }
}

fn print_answer(answer: &Answer) -> ExitCode {
    match answer {
        Answer::Answered { text, sources } => {
            println!("{}\n", text.trim());
            println!("Sources:");
            for (i, source) in sources.iter().enumerate() {
                println!(
                    "  [{}] {} (score {:.3})",
                    i + 1,
                    source.chunk_id,
                    source.score
                );
            }
            ExitCode::Success
        }
        Answer::NoResults => {
            println!("No results: the knowledge base has nothing on this yet.");
            ExitCode::NoResults
        }
    }
}

fn print_research(outcome: &ResearchOutcome) {
    println!("Report saved: {}", outcome.report_path.display());
    println!(
        "  query: {} | pages: {} | failed: {}{}",
        outcome.query,
        outcome.fetched.len(),
        outcome.failed.len(),
        if outcome.fallback { " | fallback" } else { "" }
    );
    for (i, question) in outcome.follow_ups.iter().enumerate() {
        println!("  follow-up {}: {}", i + 1, question);
    }
    println!("  document: {}", outcome.ingest.document_id());
}

fn print_refresh(summary: &RefreshSummary) {
    println!(
        "Indexed {} | unchanged {} | failed {}",
        summary.indexed,
        summary.unchanged,
        summary.failed.len()
    );
    for (path, reason) in &summary.failed {
        println!("  {}: {}", path.display(), reason);
    }
}

fn summary_code(summary: &RefreshSummary) -> ExitCode {
    if summary.failed.is_empty() || summary.indexed + summary.unchanged > 0 {
        ExitCode::Success
    } else {
        ExitCode::GeneralError
    }
}
