//! GitHound — a pattern-matching, batch-catching secret snatcher.
//!
//! Pivots off GitHub code-search results to find exposed credentials: paginated
//! search (REST API or UI scrape), a worker pool that scans every candidate
//! file with a rule-driven pattern matcher, an optional clone-and-walk deep
//! scan of unpopular repositories, and a streaming WebSocket session that
//! forwards findings to the GitHound Explore dashboard.

pub mod api;
pub mod cache;
pub mod config;
pub mod dig;
pub mod github;
pub mod ingest;
pub mod output;
pub mod pool;
pub mod rules;
pub mod scan;
pub mod search;
pub mod session;
pub mod types;
pub mod ui;
pub mod workers;

use std::path::PathBuf;

/// Version string sent in the dashboard banner frame.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-user configuration directory (`~/.githound`).
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".githound"))
}

/// Root of the local clone cache. Lives under the system temp dir so a
/// crashed run leaves nothing precious behind.
pub fn clone_cache_root() -> PathBuf {
    std::env::temp_dir().join("githound")
}
