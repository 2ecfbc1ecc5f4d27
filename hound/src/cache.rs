//! Clone-cache accounting.
//!
//! The digger checks repositories out under one managed root. This module
//! owns that root: the finished-repo set (digs are once-per-process), the
//! clone counter, and the disk budget. Every tenth clone the cache is
//! measured; over budget it is purged wholesale and recreated.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Disk budget for the clone cache.
pub const MAX_CACHE_BYTES: u64 = 20 * 1024 * 1024;

/// Cache size is measured every this many clones.
const MEASURE_EVERY: usize = 10;

struct CacheState {
    root: PathBuf,
    finished: HashSet<String>,
    clones: usize,
}

static CACHE: Lazy<Mutex<CacheState>> = Lazy::new(|| {
    Mutex::new(CacheState {
        root: crate::clone_cache_root(),
        finished: HashSet::new(),
        clones: 0,
    })
});

/// Local checkout path for a repo (`<root>/<owner>/<name>`).
pub fn checkout_path(repo: &str) -> PathBuf {
    CACHE.lock().unwrap().root.join(repo)
}

/// True if this repo was already dug this process.
pub fn is_finished(repo: &str) -> bool {
    CACHE.lock().unwrap().finished.contains(repo)
}

/// Record a finished dig, bump the clone counter, and garbage-collect when
/// due. The checkout itself is removed by the digger before this is called;
/// GC is the backstop for anything that escaped.
pub fn mark_finished(repo: &str) {
    let mut state = CACHE.lock().unwrap();
    state.finished.insert(repo.to_string());
    state.clones += 1;
    if state.clones % MEASURE_EVERY != 0 {
        return;
    }

    let used = dir_size(&state.root);
    debug!("clone cache at {} bytes after {} clones", used, state.clones);
    if used > MAX_CACHE_BYTES {
        warn!("clone cache over budget ({used} > {MAX_CACHE_BYTES} bytes), purging");
        purge(&state.root);
    }
}

/// Remove one checkout directory, pruning the now-empty owner directory too.
pub fn remove_checkout(repo: &str) {
    let path = checkout_path(repo);
    if let Err(e) = fs::remove_dir_all(&path) {
        if path.exists() {
            warn!("could not remove checkout {}: {e}", path.display());
        }
    }
    if let Some(owner_dir) = path.parent() {
        // Only succeeds when no sibling checkouts remain.
        let _ = fs::remove_dir(owner_dir);
    }
}

fn purge(root: &Path) {
    if let Err(e) = fs::remove_dir_all(root) {
        if root.exists() {
            warn!("could not purge clone cache {}: {e}", root.display());
            return;
        }
    }
    if let Err(e) = fs::create_dir_all(root) {
        warn!("could not recreate clone cache {}: {e}", root.display());
    }
}

/// Recursive on-disk size of a directory tree. Errors count as zero — the
/// budget check degrades to "never over" rather than failing a scan.
pub fn dir_size(path: &Path) -> u64 {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("sub/b.txt"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()), 150);
    }

    #[test]
    fn dir_size_of_missing_path_is_zero() {
        assert_eq!(dir_size(Path::new("/nonexistent/githound-test")), 0);
    }

    #[test]
    fn finished_set_is_sticky() {
        assert!(!is_finished("acme/one-shot"));
        mark_finished("acme/one-shot");
        assert!(is_finished("acme/one-shot"));
    }
}
