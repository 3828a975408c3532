//! Markdown reports on disk.
//!
//! Every research run saves one file under `[reports] dir`, named
//! `{YYYYmmdd_HHMMSS}_{query}.md`, with TOML frontmatter between `+++`
//! lines:
//!
//! ```text
//! +++
//! source_url = "https://example.com/article"
//! created_at = "2026-10-19T08:30:00Z"
//! tags = ["research"]
//! topic = "quantum entanglement"
//! sources = ["https://example.com/article"]
//! +++
//!
//! ...summary...
//! ```
//!
//! Plain markdown files without frontmatter are accepted too; they are
//! treated as local notes stamped with the file's modification time.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::models::{Document, LOCAL_SOURCE};

const FENCE: &str = "+++";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Every page the report was built from; `source_url` is the first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl ReportMeta {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            created_at: Utc::now().trunc_subsecs(0),
            tags: Vec::new(),
            topic: None,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub meta: ReportMeta,
    pub body: String,
}

impl Report {
    pub fn new(meta: ReportMeta, body: impl Into<String>) -> Self {
        Self {
            meta,
            body: body.into(),
        }
    }

    /// Parse a report. Files without a `+++` fence get default metadata
    /// stamped with `fallback_time`.
    pub fn parse(text: &str, fallback_time: DateTime<Utc>) -> Result<Self> {
        match split_frontmatter(text) {
            (Some(front), body) => {
                let meta: ReportMeta =
                    toml::from_str(front).context("Invalid report frontmatter")?;
                Ok(Self::new(meta, body.trim_start_matches('\n')))
            }
            (None, body) => {
                let mut meta = ReportMeta::new(LOCAL_SOURCE);
                meta.created_at = fallback_time;
                Ok(Self::new(meta, body))
            }
        }
    }

    pub fn render(&self) -> Result<String> {
        let front = toml::to_string(&self.meta).context("Failed to serialize frontmatter")?;
        Ok(format!(
            "{fence}\n{front}{fence}\n\n{body}\n",
            fence = FENCE,
            front = front,
            body = self.body.trim_end()
        ))
    }

    /// The document this report indexes as. `source_key` (the report's
    /// path relative to the reports dir) fixes the document id.
    pub fn to_document(&self, source_key: &str) -> Document {
        let mut doc = Document::new(source_key, &self.meta.source_url, self.body.trim())
            .with_tags(self.meta.tags.clone());
        doc.topic = self.meta.topic.clone();
        doc.ingested_at = self.meta.created_at.trunc_subsecs(3);
        doc
    }
}

/// Split `+++`-fenced frontmatter from the body. Returns `(None, text)` if
/// the text does not start with a fence or the fence is never closed.
pub fn split_frontmatter(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim_start_matches('\u{feff}');
    let Some(rest) = trimmed.strip_prefix(FENCE) else {
        return (None, text);
    };
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (None, text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(front), body);
        }
        offset += line.len();
    }
    (None, text)
}

/// `{YYYYmmdd_HHMMSS}_{slug}.md` for a query.
pub fn report_file_name(query: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.md", at.format("%Y%m%d_%H%M%S"), slugify(query))
}

/// [`report_file_name`] with `_{suffix}` before the extension.
pub fn suffixed_report_file_name(query: &str, at: DateTime<Utc>, suffix: &str) -> String {
    format!(
        "{}_{}_{}.md",
        at.format("%Y%m%d_%H%M%S"),
        slugify(query),
        slugify(suffix)
    )
}

fn slugify(query: &str) -> String {
    let mut slug = String::new();
    for c in query.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    let slug: String = slug.trim_end_matches('_').chars().take(60).collect();
    if slug.is_empty() {
        "report".to_string()
    } else {
        slug
    }
}

/// Key used to derive a report's document id: its path relative to the
/// reports dir, with forward slashes.
pub fn source_key(dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(dir).unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

pub fn write_report(dir: &Path, file_name: &str, report: &Report) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create reports dir: {}", dir.display()))?;
    let path = dir.join(file_name);
    std::fs::write(&path, report.render()?)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    Ok(path)
}

pub fn read_report(path: &Path) -> Result<Report> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report: {}", path.display()))?;
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Report::parse(&text, modified.trunc_subsecs(0))
        .with_context(|| format!("Failed to parse report: {}", path.display()))
}

/// Every report under `dir` matching `include_globs`, sorted by path.
pub fn load_reports(dir: &Path, include_globs: &[String]) -> Result<Vec<(PathBuf, Report)>> {
    if !dir.exists() {
        bail!("Reports directory does not exist: {}", dir.display());
    }
    let include_set = build_globset(include_globs)?;

    let mut reports = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !include_set.is_match(source_key(dir, path)) {
            continue;
        }
        reports.push((path.to_path_buf(), read_report(path)?));
    }

    reports.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(reports)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Report {
        let mut meta = ReportMeta::new("https://example.com/qubits");
        meta.created_at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        meta.tags = vec!["research".into()];
        meta.topic = Some("quantum entanglement".into());
        Report::new(meta, "Entanglement links measurement outcomes.")
    }

    #[test]
    fn test_render_then_parse() {
        let report = sample();
        let text = report.render().unwrap();
        assert!(text.starts_with("+++\n"));
        let parsed = Report::parse(&text, Utc::now()).unwrap();
        assert_eq!(parsed.meta, report.meta);
        assert_eq!(parsed.body.trim(), report.body);
    }

    #[test]
    fn test_plain_markdown_gets_local_meta() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let report = Report::parse("# Notes\nplain", at).unwrap();
        assert_eq!(report.meta.source_url, LOCAL_SOURCE);
        assert_eq!(report.meta.created_at, at);
        assert_eq!(report.body, "# Notes\nplain");
    }

    #[test]
    fn test_unclosed_fence_is_body() {
        let (front, body) = split_frontmatter("+++\nsource_url = \"x\"\nno close");
        assert!(front.is_none());
        assert!(body.starts_with("+++"));
    }

    #[test]
    fn test_file_name_slug() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap();
        assert_eq!(
            report_file_name("What is Quantum Entanglement?", at),
            "20261019_083005_what_is_quantum_entanglement.md"
        );
        assert_eq!(report_file_name("???", at), "20261019_083005_report.md");
        assert_eq!(
            suffixed_report_file_name("Quantum entanglement", at, "large"),
            "20261019_083005_quantum_entanglement_large.md"
        );
    }

    #[test]
    fn test_load_reports_and_document_id_stability() {
        let dir = tempfile::tempdir().unwrap();
        write_report(dir.path(), "a.md", &sample()).unwrap();
        std::fs::write(dir.path().join("skip.txt"), "not a report").unwrap();

        let loaded = load_reports(dir.path(), &["**/*.md".to_string()]).unwrap();
        assert_eq!(loaded.len(), 1);

        let (path, report) = &loaded[0];
        let key = source_key(dir.path(), path);
        assert_eq!(key, "a.md");
        let doc = report.to_document(&key);
        assert_eq!(doc.id, report.to_document(&key).id);
        assert_eq!(doc.tags, vec!["research"]);
        assert_eq!(doc.topic.as_deref(), Some("quantum entanglement"));
    }
}
