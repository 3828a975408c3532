//! External collaborators: web search, page fetch, and text completion.
//!
//! Each is a small async trait so workflows can be driven by real HTTP
//! backends or by scripted fakes in tests:
//!
//! | Trait | Backend |
//! |-------|---------|
//! | [`SearchClient`] | [`SearxngClient`] (`GET /search?format=json`) |
//! | [`Fetcher`] | [`HttpFetcher`] (reqwest + scraper for HTML) |
//! | [`Completion`] | [`OllamaCompletion`] (`POST /api/generate`) |
//!
//! [`Collaborators`] bundles the three behind [`Guarded`] wrappers that
//! share the process throttle and retry transient failures.
//!
//! An empty search result always means "nothing found". A failed call is
//! an error, never an empty list.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::Html;

use crate::config::Config;
use crate::error::{HarnessError, Result, Stage};
use crate::retry::{self, RetryPolicy};
use crate::throttle::Throttle;

#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Result URLs in rank order, at most `num_results`.
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Readable text of the page at `url`.
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Stateless text generation: the output depends only on the inputs.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String>;
}

// ============ SearXNG ============

pub struct SearxngClient {
    base_url: String,
    client: reqwest::Client,
}

impl SearxngClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl SearchClient for SearxngClient {
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| HarnessError::unavailable(Stage::Search, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(retry::classify_status(Stage::Search, status, &body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HarnessError::rejected(Stage::Search, format!("invalid response: {}", e)))?;
        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| {
                HarnessError::rejected(Stage::Search, "invalid response: missing 'results'")
            })?;

        let mut seen = HashSet::new();
        Ok(results
            .iter()
            .filter_map(|r| r.get("url").and_then(|u| u.as_str()))
            .filter(|u| seen.insert(u.to_string()))
            .take(num_results)
            .map(str::to_string)
            .collect())
    }
}

// ============ HTTP fetch ============

pub struct HttpFetcher {
    client: reqwest::Client,
    max_chars: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_chars: usize) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("research-harness/", env!("CARGO_PKG_VERSION")))
                .build()?,
            max_chars,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HarnessError::unavailable(Stage::Fetch, format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(retry::classify_status(Stage::Fetch, status, &body));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(true);
        let body = response
            .text()
            .await
            .map_err(|e| HarnessError::unavailable(Stage::Fetch, format!("{}: {}", url, e)))?;

        let text = if is_html {
            html_to_text(&body)
        } else {
            body
        };
        Ok(truncate_chars(&text, self.max_chars))
    }
}

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// Visible text of an HTML page with script and style content removed.
/// Whitespace inside each text run is collapsed; runs are joined by
/// single spaces.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<String> = Vec::new();

    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| SKIPPED_ELEMENTS.contains(&e.name()))
                .unwrap_or(false)
        });
        if hidden {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            parts.push(collapsed);
        }
    }

    parts.join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte, _)) => text[..byte].to_string(),
        None => text.to_string(),
    }
}

// ============ Ollama completion ============

pub struct OllamaCompletion {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaCompletion {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

/// The prompt actually sent to a model: context block first, if any.
pub fn compose_prompt(prompt: &str, context: &str) -> String {
    if context.trim().is_empty() {
        prompt.to_string()
    } else {
        format!("Context:\n{}\n\n{}", context.trim(), prompt)
    }
}

#[async_trait]
impl Completion for OllamaCompletion {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": compose_prompt(prompt, context),
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                HarnessError::unavailable(
                    Stage::Answer,
                    format!("is Ollama running at {}? {}", self.base_url, e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(retry::classify_status(Stage::Answer, status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HarnessError::rejected(Stage::Answer, format!("invalid response: {}", e)))?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| HarnessError::rejected(Stage::Answer, "invalid response: missing 'response'"))
    }
}

// ============ Disabled ============

/// Stand-in when a collaborator is switched off in config. Every call is
/// rejected, so workflows fail with a clear message instead of hanging on
/// a backend that was never configured.
pub struct Disabled;

#[async_trait]
impl SearchClient for Disabled {
    async fn search(&self, _query: &str, _num_results: usize) -> Result<Vec<String>> {
        Err(HarnessError::rejected(Stage::Search, "search provider is disabled"))
    }
}

#[async_trait]
impl Completion for Disabled {
    async fn complete(&self, _prompt: &str, _context: &str) -> Result<String> {
        Err(HarnessError::rejected(Stage::Answer, "completion provider is disabled"))
    }
}

// ============ Guarded ============

/// Throttled, retrying wrapper around a collaborator.
pub struct Guarded<C: ?Sized> {
    inner: Arc<C>,
    throttle: Throttle,
    policy: RetryPolicy,
}

impl<C: ?Sized> Guarded<C> {
    pub fn new(inner: Arc<C>, throttle: Throttle, policy: RetryPolicy) -> Self {
        Self {
            inner,
            throttle,
            policy,
        }
    }
}

#[async_trait]
impl SearchClient for Guarded<dyn SearchClient> {
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<String>> {
        retry::with_backoff(&self.policy, "search", || async {
            let _permit = self.throttle.acquire().await;
            self.inner.search(query, num_results).await
        })
        .await
    }
}

#[async_trait]
impl Fetcher for Guarded<dyn Fetcher> {
    async fn fetch(&self, url: &str) -> Result<String> {
        retry::with_backoff(&self.policy, "fetch", || async {
            let _permit = self.throttle.acquire().await;
            self.inner.fetch(url).await
        })
        .await
    }
}

#[async_trait]
impl Completion for Guarded<dyn Completion> {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
        retry::with_backoff(&self.policy, "complete", || async {
            let _permit = self.throttle.acquire().await;
            self.inner.complete(prompt, context).await
        })
        .await
    }
}

/// The three collaborators a research or ask workflow needs.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchClient>,
    pub fetcher: Arc<dyn Fetcher>,
    pub completion: Arc<dyn Completion>,
}

impl Collaborators {
    /// Wrap raw collaborators with the shared throttle and retry policy.
    pub fn guarded(
        search: Arc<dyn SearchClient>,
        fetcher: Arc<dyn Fetcher>,
        completion: Arc<dyn Completion>,
        throttle: &Throttle,
        policy: &RetryPolicy,
    ) -> Self {
        Self {
            search: Arc::new(Guarded::new(search, throttle.clone(), policy.clone())),
            fetcher: Arc::new(Guarded::new(fetcher, throttle.clone(), policy.clone())),
            completion: Arc::new(Guarded::new(completion, throttle.clone(), policy.clone())),
        }
    }

    pub fn from_config(config: &Config, throttle: &Throttle) -> anyhow::Result<Self> {
        let search: Arc<dyn SearchClient> = match config.search.provider.as_str() {
            "searxng" => Arc::new(SearxngClient::new(
                &config.search.url,
                Duration::from_secs(config.search.timeout_secs),
            )?),
            _ => Arc::new(Disabled),
        };
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
            Duration::from_secs(config.fetch.timeout_secs),
            config.fetch.max_chars,
        )?);
        let completion: Arc<dyn Completion> = match config.completion.provider.as_str() {
            "ollama" => Arc::new(OllamaCompletion::new(
                &config.completion.url,
                &config.completion.model,
                Duration::from_secs(config.completion.timeout_secs),
            )?),
            _ => Arc::new(Disabled),
        };

        Ok(Self::guarded(
            search,
            fetcher,
            completion,
            throttle,
            &RetryPolicy::from_config(&config.retry),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_html_to_text_strips_scripts_and_styles() {
        let html = r#"<html><head><style>body { color: red }</style>
            <script>var x = 1;</script><title>Qubits</title></head>
            <body><h1>Entanglement</h1><p>Correlated   outcomes
            are observed.</p><noscript>enable js</noscript></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("Entanglement"));
        assert!(text.contains("Correlated outcomes are observed."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("enable js"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("Question: x", ""), "Question: x");
        assert_eq!(
            compose_prompt("Question: x", "[1] fact\n"),
            "Context:\n[1] fact\n\nQuestion: x"
        );
    }

    struct FlakySearch {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SearchClient for FlakySearch {
        async fn search(&self, _q: &str, _n: usize) -> Result<Vec<String>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HarnessError::unavailable(Stage::Search, "502"))
            } else {
                Ok(vec!["https://example.com".into()])
            }
        }
    }

    #[tokio::test]
    async fn test_guarded_search_retries_transient() {
        let inner: Arc<dyn SearchClient> = Arc::new(FlakySearch {
            calls: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let guarded = Guarded::new(inner, Throttle::unlimited(), policy);
        assert_eq!(guarded.search("q", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_is_an_error_not_empty() {
        let err = Disabled.search("q", 5).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Search);
        assert!(!err.is_transient());
    }
}
