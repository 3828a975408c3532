//! Knowledge-gap detection for drafts and taxonomies.
//!
//! Each section of a draft is run through the [`Retriever`]; when the best
//! match's similarity is below the configured threshold, a [`GapReport`]
//! carries a keyword query that research can use to fill the gap.
//!
//! The analyzer only reads from the index.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::GapConfig;
use crate::error::Result;
use crate::retrieve::{tokenize, Retriever};

/// A span of draft text, usually one markdown heading and its body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub index: usize,
    pub heading: Option<String>,
    pub text: String,
}

/// A section whose best index match fell below the threshold.
#[derive(Debug, Clone, Serialize)]
pub struct GapReport {
    pub section: Section,
    /// Similarity of the best match in `[0.0, 1.0]`; 0.0 with an empty index.
    pub similarity: f64,
    pub best_chunk: Option<String>,
    pub query: String,
}

fn flush_section(heading: &Option<String>, body: &mut String, sections: &mut Vec<Section>) {
    let text = body.trim();
    if !text.is_empty() || heading.is_some() {
        // A heading with no body stands in for its own text.
        let text = match (heading, text.is_empty()) {
            (Some(h), true) => h.clone(),
            _ => text.to_string(),
        };
        sections.push(Section {
            index: sections.len(),
            heading: heading.clone(),
            text,
        });
    }
    body.clear();
}

/// Split markdown into sections at heading lines. Text before the first
/// heading forms its own untitled section; sections with no text are
/// dropped.
pub fn split_sections(markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut heading: Option<String> = None;
    let mut body = String::new();

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            flush_section(&heading, &mut body, &mut sections);
            heading = Some(trimmed.trim_start_matches('#').trim().to_string())
                .filter(|h| !h.is_empty());
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    flush_section(&heading, &mut body, &mut sections);
    sections
}

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "do", "does", "each", "for", "from", "had", "has", "have", "how",
    "if", "in", "into", "is", "it", "its", "may", "more", "most", "no", "not", "of", "on", "one",
    "or", "other", "our", "over", "should", "so", "some", "such", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "those", "through", "to", "under", "up",
    "use", "used", "using", "was", "we", "were", "what", "when", "where", "which", "while", "who",
    "why", "will", "with", "would", "you", "your",
];

/// Up to `max` salient terms of `text`: stopwords, short tokens, and bare
/// numbers removed; ordered by frequency, then first appearance.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, token) in tokenize(text).into_iter().enumerate() {
        if token.chars().count() < 3
            || token.chars().all(|c| c.is_ascii_digit())
            || STOPWORDS.contains(&token.as_str())
        {
            continue;
        }
        counts.entry(token).or_insert((0, pos)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(max).map(|(t, _)| t).collect()
}

/// Labels from a taxonomy file: one per line, optional `-`/`*` list
/// markers, blank lines and `#` comments skipped, duplicates dropped.
pub fn taxonomy_labels(text: &str) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let label = line.trim_start_matches(['-', '*']).trim();
        if !label.is_empty() && !labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            labels.push(label.to_string());
        }
    }
    labels
}

pub struct GapAnalyzer {
    retriever: Arc<Retriever>,
    config: GapConfig,
}

impl GapAnalyzer {
    pub fn new(retriever: Arc<Retriever>, config: GapConfig) -> Self {
        Self { retriever, config }
    }

    /// Highest similarity among the section's retrieval results.
    pub async fn coverage(&self, section: &Section) -> Result<(f64, Option<String>)> {
        let hits = self
            .retriever
            .query(&section.text, self.retriever.default_k().max(1))
            .await?;
        Ok(hits
            .into_iter()
            .max_by(|a, b| {
                a.similarity
                    .partial_cmp(&b.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|c| (c.similarity, Some(c.chunk_id)))
            .unwrap_or((0.0, None)))
    }

    /// Gap reports for every under-covered section, in section order.
    pub async fn analyze(&self, sections: &[Section]) -> Result<Vec<GapReport>> {
        let mut reports = Vec::new();
        for section in sections {
            let (similarity, best_chunk) = self.coverage(section).await?;
            tracing::debug!(section = section.index, similarity, "section coverage");

            if similarity < self.config.threshold {
                reports.push(GapReport {
                    query: self.derive_query(section),
                    section: section.clone(),
                    similarity,
                    best_chunk,
                });
            }
        }
        Ok(reports)
    }

    /// Gaps for a taxonomy: each label is a one-line section. Reports are
    /// returned weakest coverage first.
    pub async fn taxonomy_gaps(&self, labels: &[String]) -> Result<Vec<GapReport>> {
        let sections: Vec<Section> = labels
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .enumerate()
            .map(|(index, label)| Section {
                index,
                heading: Some(label.to_string()),
                text: label.to_string(),
            })
            .collect();

        let mut reports = self.analyze(&sections).await?;
        reports.sort_by(|a, b| {
            a.similarity
                .partial_cmp(&b.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.section.index.cmp(&b.section.index))
        });
        Ok(reports)
    }

    fn derive_query(&self, section: &Section) -> String {
        let source = match &section.heading {
            Some(h) if h != &section.text => format!("{}\n{}", h, section.text),
            _ => section.text.clone(),
        };
        let keywords = extract_keywords(&source, self.config.max_keywords);
        if keywords.is_empty() {
            source.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            keywords.join(" ")
        }
    }
}
