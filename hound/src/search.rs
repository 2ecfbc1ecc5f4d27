//! Search driving: the backend capability, the adaptive inter-request delay,
//! and the pagination loop that fans hits into the worker pool.

use colored::Colorize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::flags;
use crate::scan;
use crate::types::{RepoSearchResult, SearchOptions};
use crate::workers;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A search failure. `Fatal` aborts the whole run (bad credentials, invalid
/// query); anything else skips the remainder of the current query.
#[derive(Debug)]
pub enum SearchError {
    Fatal(String),
    Other(anyhow::Error),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Fatal(msg) => write!(f, "{msg}"),
            SearchError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SearchError {}

impl From<anyhow::Error> for SearchError {
    fn from(e: anyhow::Error) -> Self {
        SearchError::Other(e)
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(e: reqwest::Error) -> Self {
        SearchError::Other(e.into())
    }
}

// ---------------------------------------------------------------------------
// Adaptive delay
// ---------------------------------------------------------------------------

/// Initial pause between result pages, in seconds.
const INITIAL_DELAY_SECS: u64 = 5;

/// Bump applied on every rate-limit response.
const RATE_LIMIT_BUMP_SECS: u64 = 5;

/// Per-backend-instance pacing state, so concurrent queries never
/// cross-contaminate each other's delays. Starts cautious and speeds up one
/// second per successful page, down to a one-second floor; every rate-limit
/// response adds five seconds back.
#[derive(Debug, Clone)]
pub struct AdaptiveDelay {
    secs: u64,
    /// Wall-clock length of one delay unit. Tests compress this.
    unit: Duration,
}

impl Default for AdaptiveDelay {
    fn default() -> Self {
        Self { secs: INITIAL_DELAY_SECS, unit: Duration::from_secs(1) }
    }
}

impl AdaptiveDelay {
    /// A delay whose unit is something shorter than a second, for tests.
    pub fn compressed(unit: Duration) -> Self {
        Self { secs: INITIAL_DELAY_SECS, unit }
    }

    pub fn on_success(&mut self) {
        self.secs = self.secs.saturating_sub(1).max(1);
    }

    pub fn on_rate_limit(&mut self) {
        self.secs += RATE_LIMIT_BUMP_SECS;
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub async fn wait(&self) {
        self.sleep_units(self.secs).await;
    }

    /// Sleep for `n` delay units (seconds at production scale).
    pub async fn sleep_units(&self, n: u64) {
        tokio::time::sleep(self.unit * n as u32).await;
    }
}

// ---------------------------------------------------------------------------
// Backend capability
// ---------------------------------------------------------------------------

/// One paginated search stream. A backend is constructed per query and owns
/// its pagination cursor and delay state.
#[allow(async_fn_in_trait)]
pub trait SearchBackend {
    /// Fetch the next page of hits. `Ok(None)` ends the stream.
    async fn next_page(&mut self) -> Result<Option<Vec<RepoSearchResult>>, SearchError>;

    /// Short human label for progress messages.
    fn label(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Drain a backend, deduplicate hits, and fan each into the worker pool.
/// Returns the number of hits dispatched.
pub async fn run_search<B: SearchBackend>(
    mut backend: B,
    query: &str,
    _options: &SearchOptions,
) -> Result<usize, SearchError> {
    let f = flags();
    let mut seen: HashSet<String> = HashSet::new();
    let mut dispatched = 0usize;

    loop {
        let hits = match backend.next_page().await? {
            Some(hits) => hits,
            None => break,
        };
        if hits.is_empty() {
            break;
        }
        for hit in hits {
            let key = format!("{}/{}", hit.repo, hit.file);
            if !seen.insert(key) {
                continue;
            }
            dispatched += 1;
            workers::pool().submit(scan::scan_and_emit(hit)).await;
        }
    }

    if !f.results_only && !f.json_output {
        println!(
            "{}",
            format!("[*] {} hits dispatched for '{query}' ({})", dispatched, backend.label())
                .cyan()
        );
    }
    debug!("query '{query}' dispatched {dispatched} hits via {}", backend.label());
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_floors_at_one_second() {
        let mut delay = AdaptiveDelay::default();
        assert_eq!(delay.secs(), 5);
        for _ in 0..10 {
            delay.on_success();
        }
        assert_eq!(delay.secs(), 1);
    }

    #[test]
    fn rate_limit_bumps_by_five() {
        let mut delay = AdaptiveDelay::default();
        delay.on_rate_limit();
        assert_eq!(delay.secs(), 10);
        delay.on_success();
        assert_eq!(delay.secs(), 9);
    }
}
