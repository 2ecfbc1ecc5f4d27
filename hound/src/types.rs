use serde::Serialize;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum bytes read from a raw-content download.
pub const MAX_RAW_DOWNLOAD: usize = 10 * 1024 * 1024;

/// Raw-content request timeout, in seconds.
pub const RAW_TIMEOUT_SECS: u64 = 15;

/// Repositories with fewer stars than this are "unpopular" and eligible for
/// deep scanning.
pub const STAR_THRESHOLD: u32 = 7;

/// Browser User-Agent sent on every request to the code host.
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_13_6) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/80.0.3987.132 Safari/537.36";

// ---------------------------------------------------------------------------
// Search results (hits)
// ---------------------------------------------------------------------------

/// Where a search hit came from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Source {
    Repo,
    Gist,
}

/// A single file reference returned by a code search — the unit of work fed
/// into the worker pool.
#[derive(Clone, Debug)]
pub struct RepoSearchResult {
    /// `owner/name` for repositories, `owner/id` for gists.
    pub repo: String,
    /// Path of the file within the repo (or the gist id).
    pub file: String,
    /// Commit sha the hit was indexed at. 40-hex for repo hits.
    pub sha: String,
    /// Raw-CDN path component (`owner/name/<sha>/<path>` or the gist raw path).
    pub raw: String,
    pub source: Source,
    /// The query that produced this hit.
    pub query: String,
    /// Browser URL of the hit.
    pub url: String,
    /// Search-preview fragment, when the backend supplies one. Fast mode
    /// scans only this.
    pub preview: Option<String>,
}

impl RepoSearchResult {
    /// Browser URL of the surrounding repository.
    pub fn repo_url(&self) -> String {
        match self.source {
            Source::Repo => format!("https://github.com/{}", self.repo),
            Source::Gist => format!("https://gist.github.com/{}", self.repo),
        }
    }

    /// Base of the raw-content CDN for this hit's source.
    pub fn raw_base(&self) -> &'static str {
        match self.source {
            Source::Repo => "https://raw.githubusercontent.com",
            Source::Gist => "https://gist.githubusercontent.com",
        }
    }
}

/// Knobs for a single search run, carried alongside each query.
#[derive(Clone, Debug)]
pub struct SearchOptions {
    /// Hard cap on result pages for this run.
    pub max_pages: usize,
    /// Optional language filter.
    pub language: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { max_pages: 100, language: None }
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// A deduplicated, emitted match: what the terminal prints and the dashboard
/// receives. Field names are the JSON output contract.
#[derive(Clone, Debug, Serialize)]
pub struct Finding {
    pub repo: String,
    pub file: String,
    /// The context line containing the match.
    pub context: String,
    #[serde(rename = "match")]
    pub match_text: String,
    /// Rule id/description tags, plus `base64` or deep-scan markers.
    pub attributes: Vec<String>,
    pub file_last_updated: String,
    pub file_last_author: String,
    pub url: String,
}
