//! UI-scrape search backend.
//!
//! Drives github.com the way a browser would: cookie-jar login with a scraped
//! CSRF token (and an optional TOTP code), then paginated search pages parsed
//! with a blob-href regex, falling back to the embedded JSON payload newer
//! result pages ship. Gist search only exists on this path — the REST API
//! does not index gists.

use anyhow::{Context, Result};
use colored::Colorize;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::config::flags;
use crate::github;
use crate::search::{AdaptiveDelay, SearchBackend, SearchError};
use crate::types::{RepoSearchResult, SearchOptions, Source};

/// Blob link on a classic search-result page. Groups: full path, repo,
/// sha/path, path.
static BLOB_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href="/((.*?)/blob/([0-9a-f]{40}/([^#"]+)))""#).unwrap());

/// Gist link on a gist search page.
static GIST_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href="/(\w+/[0-9a-z]{5,})""#).unwrap());

/// Page count on classic result pages.
static TOTAL_PAGES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bdata-total-pages="(\d+)""#).unwrap());

/// Embedded JSON payload on the React result pages.
static EMBEDDED_DATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)react-app\.embeddedData">(.*?)</script>"#).unwrap());

/// CSRF token on the login form.
static CSRF_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"authenticity_token"\s+value="([0-9A-Za-z/=+]{20,})""#).unwrap());

/// Marker that the session cookie did not take.
const SIGNED_OUT_MARKER: &str = "Sign in to GitHub";

// ---------------------------------------------------------------------------
// Embedded payload shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct EmbeddedPayload {
    #[serde(default)]
    payload: EmbeddedResults,
}

#[derive(Deserialize, Default)]
struct EmbeddedResults {
    #[serde(default)]
    results: Vec<EmbeddedResult>,
    #[serde(default)]
    page_count: usize,
}

#[derive(Deserialize, Default)]
struct EmbeddedResult {
    #[serde(default)]
    repo_nwo: String,
    #[serde(default)]
    repo_name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    commit_sha: String,
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

/// Credentials for the UI path.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub otp: Option<String>,
}

/// Scrape the CSRF token from a login-flow page.
async fn grab_csrf_token(url: &str) -> Result<String> {
    let body = github::client().get(url).send().await?.text().await?;
    CSRF_TOKEN
        .captures(&body)
        .map(|c| c[1].to_string())
        .with_context(|| format!("no CSRF token on {url}"))
}

/// Log the shared cookie-jar client into github.com. A wrong password is not
/// detected here — the search loop notices the signed-out marker and aborts.
pub async fn login(creds: &Credentials) -> Result<()> {
    let csrf = grab_csrf_token("https://github.com/login").await?;
    let mut form = HashMap::new();
    form.insert("authenticity_token", csrf);
    form.insert("login", creds.username.clone());
    form.insert("password", creds.password.clone());
    github::client()
        .post("https://github.com/session")
        .form(&form)
        .send()
        .await
        .context("login POST failed")?;

    if let Some(otp) = &creds.otp {
        let csrf = grab_csrf_token("https://github.com/sessions/two-factor").await?;
        let mut form = HashMap::new();
        form.insert("authenticity_token", csrf);
        form.insert("otp", otp.clone());
        github::client()
            .post("https://github.com/sessions/two-factor")
            .form(&form)
            .send()
            .await
            .context("two-factor POST failed")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Code search
// ---------------------------------------------------------------------------

fn search_url(base: &str, query: &str, options: &SearchOptions, page: usize) -> String {
    let quoted = format!("\"{query}\" stars:<5 fork:false");
    let mut url = format!(
        "{base}?q={}&p={}&s=indexed&type=Code",
        urlencoding::encode(&quoted),
        page
    );
    if let Some(lang) = &options.language {
        url.push_str("&l=");
        url.push_str(&urlencoding::encode(lang));
    }
    url
}

pub struct UiSearch {
    base: String,
    query: String,
    options: SearchOptions,
    page: usize,
    total_pages: usize,
    delay: AdaptiveDelay,
    announced: bool,
    /// Second pass in reverse index order, taken under `--many-results` when
    /// the result set overflows the 100-page service window.
    descending: bool,
}

impl UiSearch {
    pub fn new(query: String, options: SearchOptions) -> Self {
        Self {
            base: "https://github.com".to_string(),
            query,
            options,
            page: 0,
            total_pages: 1,
            delay: AdaptiveDelay::default(),
            announced: false,
            descending: false,
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

    fn announce(&mut self, pages: usize) {
        if self.announced || flags().results_only || flags().json_output {
            return;
        }
        self.announced = true;
        let label = if pages > 99 { "100+ pages".to_string() } else { format!("{pages} pages") };
        println!("{}", format!("[*] Searching {label} of results for '{}'...", self.query).cyan());
    }
}

impl SearchBackend for UiSearch {
    async fn next_page(&mut self) -> Result<Option<Vec<RepoSearchResult>>, SearchError> {
        if self.page >= self.total_pages {
            if !self.descending && self.total_pages > 99 && flags().many_results {
                self.descending = true;
                self.page = 0;
            } else {
                return Ok(None);
            }
        }

        loop {
            let mut url = search_url(
                &format!("{}/search", self.base),
                &self.query,
                &self.options,
                self.page + 1,
            );
            if self.descending {
                url.push_str("&o=desc");
            }
            let resp = github::client().get(&url).send().await?;
            match resp.status().as_u16() {
                403 => {
                    self.delay.on_rate_limit();
                    if !flags().results_only && !flags().json_output {
                        println!(
                            "{}",
                            format!("[!] Rate limited. Waiting {}s...", self.delay.secs()).yellow()
                        );
                    }
                    self.delay.wait().await;
                    continue;
                }
                503 => return Ok(None),
                _ => {}
            }
            let body = resp.text().await.map_err(|e| SearchError::Other(e.into()))?;

            if body.contains(SIGNED_OUT_MARKER) {
                return Err(SearchError::Fatal(
                    "unable to log into GitHub — check the configured credentials".to_string(),
                ));
            }

            let mut hits = Vec::new();
            let blob_matches: Vec<_> = BLOB_LINK.captures_iter(&body).collect();
            if blob_matches.is_empty() {
                // Newer result pages render client-side; the data rides along
                // in an embedded JSON payload.
                let Some(embedded) = EMBEDDED_DATA.captures(&body) else {
                    self.page += 1;
                    return Ok(Some(Vec::new()));
                };
                let payload: EmbeddedPayload =
                    serde_json::from_str(&embedded[1]).unwrap_or_default();
                if self.page == 0 && payload.payload.page_count > 0 {
                    self.total_pages = payload.payload.page_count.min(self.options.max_pages);
                    self.announce(self.total_pages);
                }
                for result in payload.payload.results {
                    let repo = if result.repo_name.is_empty() {
                        result.repo_nwo
                    } else {
                        result.repo_name
                    };
                    if repo.is_empty() || result.path.is_empty() {
                        continue;
                    }
                    hits.push(RepoSearchResult {
                        raw: format!("{repo}/{}/{}", result.commit_sha, result.path),
                        url: format!(
                            "https://github.com/{repo}/blob/{}/{}",
                            result.commit_sha, result.path
                        ),
                        file: result.path,
                        sha: result.commit_sha,
                        source: Source::Repo,
                        query: self.query.clone(),
                        preview: None,
                        repo,
                    });
                }
            } else {
                if self.page == 0 {
                    if let Some(caps) = TOTAL_PAGES.captures(&body) {
                        if let Ok(pages) = caps[1].parse::<usize>() {
                            self.total_pages = pages.min(self.options.max_pages);
                            self.announce(self.total_pages);
                        }
                    }
                }
                for caps in blob_matches {
                    let repo = caps[2].to_string();
                    let sha_and_path = caps[3].to_string();
                    let sha = sha_and_path.chars().take(40).collect::<String>();
                    let path = caps[4].to_string();
                    hits.push(RepoSearchResult {
                        raw: format!("{repo}/{sha_and_path}"),
                        url: format!("https://github.com/{}", &caps[1]),
                        file: path,
                        sha,
                        source: Source::Repo,
                        query: self.query.clone(),
                        preview: None,
                        repo,
                    });
                }
            }

            self.page += 1;
            self.delay.on_success();
            self.delay.wait().await;
            return Ok(Some(hits));
        }
    }

    fn label(&self) -> &'static str {
        "ui"
    }
}

// ---------------------------------------------------------------------------
// Gist search
// ---------------------------------------------------------------------------

pub struct GistSearch {
    query: String,
    options: SearchOptions,
    page: usize,
    total_pages: usize,
    delay: AdaptiveDelay,
}

impl GistSearch {
    pub fn new(query: String, options: SearchOptions) -> Self {
        Self { query, options, page: 0, total_pages: 1, delay: AdaptiveDelay::default() }
    }
}

impl SearchBackend for GistSearch {
    async fn next_page(&mut self) -> Result<Option<Vec<RepoSearchResult>>, SearchError> {
        if self.page >= self.total_pages {
            return Ok(None);
        }

        loop {
            let url =
                search_url("https://gist.github.com/search", &self.query, &self.options, self.page + 1);
            let resp = github::client().get(&url).send().await?;
            match resp.status().as_u16() {
                403 => {
                    self.delay.on_rate_limit();
                    self.delay.wait().await;
                    continue;
                }
                503 => return Ok(None),
                _ => {}
            }
            let body = resp.text().await.map_err(|e| SearchError::Other(e.into()))?;
            if body.contains(SIGNED_OUT_MARKER) {
                return Err(SearchError::Fatal(
                    "unable to log into GitHub — check the configured credentials".to_string(),
                ));
            }

            if self.page == 0 {
                if let Some(caps) = TOTAL_PAGES.captures(&body) {
                    if let Ok(pages) = caps[1].parse::<usize>() {
                        self.total_pages = pages.min(self.options.max_pages);
                    }
                }
            }

            let mut hits = Vec::new();
            for caps in GIST_LINK.captures_iter(&body) {
                let gist = caps[1].to_string();
                let raw = github::gist_raw_path(&gist).await;
                if raw.is_empty() {
                    debug!("no raw link found for gist {gist}");
                    continue;
                }
                hits.push(RepoSearchResult {
                    repo: gist.clone(),
                    file: gist.clone(),
                    sha: String::new(),
                    raw,
                    source: Source::Gist,
                    query: self.query.clone(),
                    url: format!("https://gist.github.com/{gist}"),
                    preview: None,
                });
            }

            self.page += 1;
            self.delay.on_success();
            self.delay.wait().await;
            return Ok(Some(hits));
        }
    }

    fn label(&self) -> &'static str {
        "gist"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_links_parse_into_hits() {
        let html = r#"<a href="/acme/infra/blob/0123456789abcdef0123456789abcdef01234567/config/app.yml">app.yml</a>"#;
        let caps = BLOB_LINK.captures(html).unwrap();
        assert_eq!(&caps[2], "acme/infra");
        assert_eq!(&caps[4], "config/app.yml");
    }

    #[test]
    fn embedded_payload_parses() {
        let json = r#"{"payload":{"results":[{"repo_nwo":"acme/infra","repo_name":"","path":"a.txt","commit_sha":"0123456789abcdef0123456789abcdef01234567"}],"page_count":3}}"#;
        let payload: EmbeddedPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.payload.page_count, 3);
        assert_eq!(payload.payload.results[0].repo_nwo, "acme/infra");
    }

    #[test]
    fn search_url_quotes_and_escapes() {
        let url = search_url(
            "https://github.com/search",
            "corp.example.com",
            &SearchOptions { max_pages: 100, language: None },
            2,
        );
        assert!(url.contains("p=2"));
        assert!(url.contains("type=Code"));
        assert!(url.contains(&urlencoding::encode("\"corp.example.com\" stars:<5 fork:false").into_owned()));
    }

    #[test]
    fn csrf_token_is_scraped() {
        let html = r#"<input type="hidden" name="authenticity_token" value="AbCdEf123456789/+=AbCdEf123456789zz" />"#;
        let caps = CSRF_TOKEN.captures(html).unwrap();
        assert!(caps[1].len() >= 20);
    }
}
