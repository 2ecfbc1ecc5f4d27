//! REST code-search backend and commit-metadata lookups, with a request
//! tracker behind `--api-debug`.

use anyhow::anyhow;
use colored::Colorize;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::config::flags;
use crate::github;
use crate::search::{AdaptiveDelay, SearchBackend, SearchError};
use crate::types::{RepoSearchResult, SearchOptions, Source};

/// The code-search API serves at most 1000 results — ten pages of 100.
const API_MAX_PAGES: usize = 10;

const PER_PAGE: usize = 100;

/// Request timeout for search API calls.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Commit sha embedded in a result's browser URL.
static BLOB_SHA: Lazy<Regex> = Lazy::new(|| Regex::new(r"/([a-f0-9]{40})/").unwrap());

/// Rate-reset hint inside an API error message.
static RATE_RESET: Lazy<Regex> = Lazy::new(|| Regex::new(r"rate reset in (\d+)s").unwrap());

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CodeSearchResponse {
    total_count: usize,
    #[serde(default)]
    items: Vec<CodeSearchItem>,
}

#[derive(Deserialize)]
struct CodeSearchItem {
    path: String,
    html_url: String,
    repository: ItemRepository,
    /// Present when the text-match media type is requested; feeds fast mode.
    #[serde(default)]
    text_matches: Vec<TextMatch>,
}

#[derive(Deserialize)]
struct TextMatch {
    #[serde(default)]
    fragment: String,
}

#[derive(Deserialize)]
struct ItemRepository {
    full_name: String,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct CommitEntry {
    commit: CommitBody,
}

#[derive(Deserialize)]
struct CommitBody {
    author: CommitAuthor,
}

#[derive(Deserialize, Default)]
struct CommitAuthor {
    #[serde(default)]
    email: String,
    #[serde(default)]
    date: String,
}

/// Last-touch metadata for a file, from the commit-list API.
#[derive(Clone, Debug)]
pub struct FileMeta {
    pub author_email: String,
    pub last_updated: String,
}

// ---------------------------------------------------------------------------
// Search backend
// ---------------------------------------------------------------------------

pub struct ApiSearch {
    base: String,
    token: String,
    query: String,
    max_pages: usize,
    page: usize,
    total_pages: Option<usize>,
    delay: AdaptiveDelay,
}

impl ApiSearch {
    pub fn new(token: String, query: String, options: &SearchOptions) -> Self {
        let query = match &options.language {
            Some(lang) => format!("{query} language:{lang}"),
            None => query,
        };
        Self {
            base: "https://api.github.com".to_string(),
            token,
            query,
            max_pages: options.max_pages,
            page: 0,
            total_pages: None,
            delay: AdaptiveDelay::default(),
        }
    }

    /// Point the backend at another host. Tests aim this at a local server.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Replace the pacing state. Tests pass a compressed delay.
    pub fn with_delay(mut self, delay: AdaptiveDelay) -> Self {
        self.delay = delay;
        self
    }

    fn page_cap(&self) -> usize {
        API_MAX_PAGES.min(self.max_pages)
    }
}

impl SearchBackend for ApiSearch {
    async fn next_page(&mut self) -> Result<Option<Vec<RepoSearchResult>>, SearchError> {
        if self.page >= self.page_cap() {
            return Ok(None);
        }
        if let Some(total) = self.total_pages {
            if self.page >= total {
                return Ok(None);
            }
        }

        loop {
            track_request("GET /search/code", &self.query);
            let resp = github::client()
                .get(format!("{}/search/code", self.base))
                .query(&[
                    ("q", self.query.as_str()),
                    ("per_page", &PER_PAGE.to_string()),
                    ("page", &(self.page + 1).to_string()),
                ])
                .header("Authorization", format!("token {}", self.token))
                .header("Accept", "application/vnd.github.v3.text-match+json")
                .timeout(API_TIMEOUT)
                .send()
                .await?;

            match resp.status().as_u16() {
                200 => {
                    let body: CodeSearchResponse =
                        resp.json().await.map_err(|e| SearchError::Other(e.into()))?;
                    if self.total_pages.is_none() {
                        let capped = body.total_count.min(API_MAX_PAGES * PER_PAGE);
                        self.total_pages = Some(capped.div_ceil(PER_PAGE));
                    }
                    self.page += 1;
                    if body.items.is_empty() {
                        return Ok(None);
                    }

                    let hits = body
                        .items
                        .into_iter()
                        .map(|item| {
                            let sha = BLOB_SHA
                                .captures(&item.html_url)
                                .map(|c| c[1].to_string())
                                .unwrap_or_default();
                            let repo = item.repository.full_name;
                            let preview = if item.text_matches.is_empty() {
                                None
                            } else {
                                Some(
                                    item.text_matches
                                        .iter()
                                        .map(|tm| tm.fragment.as_str())
                                        .collect::<Vec<_>>()
                                        .join("\n"),
                                )
                            };
                            RepoSearchResult {
                                raw: format!("{repo}/{sha}/{}", item.path),
                                url: item.html_url,
                                file: item.path,
                                sha,
                                source: Source::Repo,
                                query: self.query.clone(),
                                preview,
                                repo,
                            }
                        })
                        .collect();

                    self.delay.on_success();
                    self.delay.wait().await;
                    return Ok(Some(hits));
                }
                403 | 429 => {
                    let message = resp
                        .json::<ApiError>()
                        .await
                        .map(|e| e.message)
                        .unwrap_or_default();
                    let pause = match extract_reset_secs(&message) {
                        Some(reset) => reset + 3,
                        None => {
                            self.delay.on_rate_limit();
                            self.delay.secs()
                        }
                    };
                    if !flags().results_only && !flags().json_output {
                        println!(
                            "{}",
                            format!("[!] API limit exceeded. Sleeping for {pause} seconds...")
                                .yellow()
                        );
                    }
                    self.delay.sleep_units(pause).await;
                }
                422 => {
                    let message = resp
                        .json::<ApiError>()
                        .await
                        .map(|e| e.message)
                        .unwrap_or_else(|_| "invalid search query".to_string());
                    return Err(SearchError::Fatal(format!(
                        "search query rejected: {message}"
                    )));
                }
                503 => return Ok(None),
                status => {
                    return Err(SearchError::Other(anyhow!(
                        "search API returned {status}"
                    )))
                }
            }
        }
    }

    fn label(&self) -> &'static str {
        "api"
    }
}

/// Seconds until the rate window resets, from an API error message.
fn extract_reset_secs(message: &str) -> Option<u64> {
    RATE_RESET.captures(message).and_then(|c| c[1].parse().ok())
}

// ---------------------------------------------------------------------------
// File metadata
// ---------------------------------------------------------------------------

/// Who last touched a file and when, via the commit-list API. Best-effort:
/// any failure leaves the fields empty.
pub async fn file_metadata(repo: &str, path: &str) -> Option<FileMeta> {
    let token = flags().github_token.clone()?;
    track_request("GET /repos/../commits", path);
    let resp = github::client()
        .get(format!("https://api.github.com/repos/{repo}/commits"))
        .query(&[("path", path), ("per_page", "1")])
        .header("Authorization", format!("token {token}"))
        .header("Accept", "application/vnd.github+json")
        .timeout(API_TIMEOUT)
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let commits: Vec<CommitEntry> = resp.json().await.ok()?;
    let author = commits.into_iter().next()?.commit.author;
    Some(FileMeta { author_email: author.email, last_updated: author.date })
}

// ---------------------------------------------------------------------------
// Request tracker
// ---------------------------------------------------------------------------

static REQUEST_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Count an API request; under `--api-debug`, print it as it happens.
pub fn track_request(endpoint: &str, details: &str) {
    let n = REQUEST_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
    if flags().api_debug {
        println!(
            "{}",
            format!("[API request #{n} @ {}] {endpoint} {details}", clock_time()).cyan()
        );
    } else {
        debug!("API request #{n}: {endpoint} {details}");
    }
}

pub fn request_count() -> usize {
    REQUEST_COUNT.load(Ordering::SeqCst)
}

/// Print the request total, under `--api-debug`.
pub fn print_request_summary() {
    if flags().api_debug {
        println!("{}", format!("Total API requests: {}", request_count()).green());
    }
}

/// Wall-clock `HH:MM:SS` without a date dependency.
fn clock_time() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let day = secs % 86_400;
    format!("{:02}:{:02}:{:02}", day / 3600, (day % 3600) / 60, day % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_hint_is_parsed() {
        assert_eq!(
            extract_reset_secs("403 API rate limit exceeded; rate reset in 37s"),
            Some(37)
        );
        assert_eq!(extract_reset_secs("403 Forbidden"), None);
    }

    #[test]
    fn blob_sha_is_extracted_from_html_url() {
        let url = "https://github.com/acme/infra/blob/0123456789abcdef0123456789abcdef01234567/config/app.yml";
        let caps = BLOB_SHA.captures(url).unwrap();
        assert_eq!(caps[1].len(), 40);
    }

    #[test]
    fn code_search_response_parses() {
        let body = r#"{
            "total_count": 2,
            "incomplete_results": false,
            "items": [{
                "name": "app.yml",
                "path": "config/app.yml",
                "html_url": "https://github.com/acme/infra/blob/0123456789abcdef0123456789abcdef01234567/config/app.yml",
                "repository": {"full_name": "acme/infra"}
            }]
        }"#;
        let parsed: CodeSearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.total_count, 2);
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].repository.full_name, "acme/infra");
    }
}
