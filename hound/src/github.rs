//! Shared GitHub plumbing: the common HTTP client, raw-content downloads
//! (bounded in time and size), the repo-popularity gate for deep scans, and
//! gist raw-link discovery.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::types::{
    RepoSearchResult, Source, MAX_RAW_DOWNLOAD, RAW_TIMEOUT_SECS, STAR_THRESHOLD, USER_AGENT,
};

/// Star count scraped from a repo landing page.
static STAR_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"aria-label="(\d+) users? starred this"#).unwrap());

/// Raw-view link on a gist page.
static GIST_RAW_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href="/([\w\-]+/[0-9a-f]+/raw/[0-9a-f]{40}/[\w_\-./%]{1,255})""#).unwrap());

/// Per-repo popularity cache: the landing page is fetched once per repo.
static POPULARITY: Lazy<DashMap<String, bool>> = Lazy::new(DashMap::new);

/// Bounds the number of concurrent raw downloads. Sized to the worker count
/// at startup.
static DOWNLOADS: OnceCell<Semaphore> = OnceCell::new();

static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

/// Build the shared transport. `threads` sizes the download semaphore.
pub fn init_client(threads: usize) {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .cookie_store(true)
        .build()
        .expect("failed to build HTTP client");
    let _ = CLIENT.set(client);
    let _ = DOWNLOADS.set(Semaphore::new(threads.max(1)));
}

pub fn client() -> &'static reqwest::Client {
    CLIENT.get().expect("HTTP client not initialized")
}

// ---------------------------------------------------------------------------
// Raw content
// ---------------------------------------------------------------------------

/// Raw-CDN URL for a hit, with path components escaped. `None` when the path
/// already contains `%` — those URLs double-escape unpredictably and are
/// skipped.
pub fn raw_url(hit: &RepoSearchResult) -> Option<String> {
    if hit.raw.contains('%') {
        return None;
    }
    let escaped: Vec<String> = hit
        .raw
        .split('/')
        .map(|part| urlencoding::encode(part).into_owned())
        .collect();
    Some(format!("{}/{}", hit.raw_base(), escaped.join("/")))
}

/// Download the raw file behind a hit. Capped at 10 MiB via incremental
/// reads and 15 s per request; an HTTP error status aborts just this hit.
/// `Ok(None)` means the hit was skipped, not failed.
pub async fn download_raw(hit: &RepoSearchResult) -> Result<Option<String>> {
    let url = match raw_url(hit) {
        Some(url) => url,
        None => {
            debug!("skipping pre-escaped raw path {}", hit.raw);
            return Ok(None);
        }
    };

    let _permit = DOWNLOADS
        .get()
        .expect("download semaphore not initialized")
        .acquire()
        .await
        .expect("download semaphore closed");

    let mut resp = client()
        .get(&url)
        .timeout(Duration::from_secs(RAW_TIMEOUT_SECS))
        .send()
        .await
        .with_context(|| format!("raw request to {url}"))?;
    if resp.status().as_u16() >= 400 {
        bail!("raw request to {url} returned {}", resp.status());
    }

    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let remaining = MAX_RAW_DOWNLOAD - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(String::from_utf8_lossy(&body).into_owned()))
}

// ---------------------------------------------------------------------------
// Popularity gate
// ---------------------------------------------------------------------------

/// True when the repo has fewer than [`STAR_THRESHOLD`] stars. Fetch or parse
/// failures count as unpopular — the check only gates deep scanning, and
/// digging a repo we could not size up beats silently skipping it.
pub async fn repo_is_unpopular(hit: &RepoSearchResult) -> bool {
    if hit.source != Source::Repo {
        return false;
    }
    if let Some(cached) = POPULARITY.get(&hit.repo) {
        return *cached;
    }

    let unpopular = fetch_star_count(&hit.repo)
        .await
        .map(|stars| stars < STAR_THRESHOLD)
        .unwrap_or(true);
    POPULARITY.insert(hit.repo.clone(), unpopular);
    unpopular
}

async fn fetch_star_count(repo: &str) -> Result<u32> {
    let url = format!("https://github.com/{repo}");
    let body = client()
        .get(&url)
        .timeout(Duration::from_secs(RAW_TIMEOUT_SECS))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let caps = STAR_COUNT
        .captures(&body)
        .with_context(|| format!("no star count on {url}"))?;
    Ok(caps[1].parse()?)
}

// ---------------------------------------------------------------------------
// Gists
// ---------------------------------------------------------------------------

/// Locate the raw-view path for a gist by scraping its page. Empty string on
/// any failure — the scanner treats a gist without raw content as a dead hit.
pub async fn gist_raw_path(gist: &str) -> String {
    let url = format!("https://gist.github.com/{gist}");
    let body = match client().get(&url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(text) => text,
            Err(_) => return String::new(),
        },
        Err(_) => return String::new(),
    };
    GIST_RAW_LINK
        .captures(&body)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default()
}
