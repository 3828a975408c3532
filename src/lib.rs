//! # Research Harness
//!
//! A local-first research assistant. It researches topics on the web,
//! saves the findings as markdown reports, indexes them for hybrid
//! (keyword + semantic) retrieval, and tells you where your knowledge base
//! is thin.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │  Search  │──▶│  Fetch   │──▶│ Summarize │──▶│ reports/*.md │
//! └──────────┘   └──────────┘   └───────────┘   └──────┬───────┘
//!                                                      │ ingest
//!                                                      ▼
//!  ┌──────────┐   ┌─────────────┐   ┌──────────────────────────┐
//!  │  Router  │──▶│  Retriever  │◀──│ SQLite (meta+FTS5+vectors)│
//!  │  (tasks) │   │ hybrid rank │   │ + in-memory vector index │
//!  └──────────┘   └──────┬──────┘   └──────────────────────────┘
//!                        ▼
//!                 ┌─────────────┐
//!                 │ Gap analyzer│
//!                 └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rh init                                # create database and reports dir
//! rh generate "quantum entanglement"     # research, save, ingest
//! rh generate --large "bell tests"       # plus follow-up questions
//! rh ask "what is entanglement?"         # answer from the knowledge base
//! rh gaps draft.md                       # find thinly covered sections
//! rh reconcile --repair                  # fix store/index drift
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Documents, chunks, scored results |
//! | [`chunk`] | Overlapping character-window chunking |
//! | [`embedding`] | Embedding providers and the guarded front |
//! | [`store`] | Metadata and vector stores (SQLite, in-memory) |
//! | [`index`] | In-memory cosine index |
//! | [`ingest`] | Chunk → embed → commit pipeline |
//! | [`retrieve`] | Hybrid retrieval |
//! | [`gap`] | Knowledge-gap analysis |
//! | [`task`] / [`router`] | Task lifecycle and routing |
//! | [`collab`] | Search, fetch, and completion collaborators |
//! | [`reports`] | Markdown reports with TOML frontmatter |
//! | [`workflow`] | The knowledge base and its workflows |
//! | [`db`] / [`migrate`] | SQLite connection and schema |

pub mod chunk;
pub mod collab;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod gap;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod reports;
pub mod retrieve;
pub mod retry;
pub mod router;
pub mod store;
pub mod task;
pub mod throttle;
pub mod workflow;
