//! Deep repository scanning.
//!
//! When a hit's repo clears the popularity gate, the digger shallow-clones it
//! into the managed cache, walks the checkout with directory/extension
//! denylists and size-aware readers, optionally replays recent commit diffs,
//! and returns matches tagged with their in-repo location. Digs are
//! idempotent per repo within a process.

use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache;
use crate::config::flags;
use crate::pool::Match;
use crate::scan::{self, get_line};
use crate::types::RepoSearchResult;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Clone deadline. The fetch is aborted from the transfer callback when it
/// blows past this.
const CLONE_TIMEOUT: Duration = Duration::from_secs(30);

/// Files larger than this get filename checks only.
const MAX_CONTENT_BYTES: u64 = 5 * 1024 * 1024;

/// Files at or above this are read in overlapping chunks.
const CHUNKED_READ_FLOOR: u64 = 1024 * 1024;

const CHUNK_BYTES: usize = 1024 * 1024;

/// Overlap between consecutive chunks, so a secret straddling a chunk edge
/// is still seen whole.
const CHUNK_OVERLAP: usize = 50 * 1024;

/// NUL fraction of the first 1 KiB above which a file is binary.
const NULL_BYTE_RATIO: f64 = 0.10;

/// Minimum printable-ASCII fraction for a blob to be scanned as text.
const ASCII_RATIO: f64 = 0.9;

/// How many commits back the diff replay goes.
const MAX_COMMITS: usize = 30;

/// Per-run file cache bound; half the entries are evicted on overflow.
const FILE_CACHE_CAP: usize = 10_000;

/// File sets larger than this scan on a widened rayon pool.
const PARALLEL_THRESHOLD: usize = 100;

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "dist",
    "build",
    ".git",
    "__pycache__",
    "target",
    "bower_components",
    "venv",
    ".venv",
    ".idea",
    ".vscode",
];

const SKIP_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "svg", "mp3", "mp4", "avi", "mov", "mkv",
    "wav", "ogg", "flac", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "jar", "war", "class",
    "pyc", "o", "so", "dll", "dylib", "exe", "bin", "woff", "woff2", "ttf", "eot", "otf",
];

/// File names worth reporting on sight, content aside.
static INTERESTING_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(vim_settings\.xml$|\.(env|pem|ppk|p12|pfx|kdbx|sql|sqlite|keychain)$)")
        .unwrap()
});

/// Absolute paths already scanned this run.
static FILE_CACHE: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Dig into a repo: clone, scan, clean up. Returns every deep match; empty on
/// a repeat visit or any clone failure. Blocking — callers run it on a
/// blocking thread.
pub fn dig(hit: &RepoSearchResult) -> Vec<Match> {
    if cache::is_finished(&hit.repo) {
        return Vec::new();
    }

    let checkout = cache::checkout_path(&hit.repo);
    let repo = match clone_repo(&hit.repo, &checkout) {
        Ok(repo) => repo,
        Err(e) => {
            debug!("clone of {} failed: {e}", hit.repo);
            cache::mark_finished(&hit.repo);
            return Vec::new();
        }
    };

    let f = flags();
    let mut matches = Vec::new();
    if f.dig_files {
        matches.extend(scan_checkout(&checkout));
    }
    if f.dig_commits {
        matches.extend(scan_commits(&repo));
    }
    drop(repo);

    cache::remove_checkout(&hit.repo);
    cache::mark_finished(&hit.repo);
    matches
}

/// Shallow clone (depth 1, HEAD only) with a hard deadline enforced from the
/// transfer callback.
fn clone_repo(repo: &str, dest: &Path) -> Result<git2::Repository, git2::Error> {
    if dest.exists() {
        let _ = fs::remove_dir_all(dest);
    }
    if let Some(parent) = dest.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let started = Instant::now();
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.transfer_progress(move |_| started.elapsed() < CLONE_TIMEOUT);

    let mut fetch = git2::FetchOptions::new();
    fetch.remote_callbacks(callbacks);
    fetch.depth(1);

    let url = format!("https://github.com/{repo}");
    git2::build::RepoBuilder::new()
        .fetch_options(fetch)
        .clone(&url, dest)
}

// ---------------------------------------------------------------------------
// Filesystem walk
// ---------------------------------------------------------------------------

/// Walk a checkout and scan every eligible file. Public so the walk and its
/// size/binary policies can be exercised against synthetic trees.
pub fn scan_checkout(root: &Path) -> Vec<Match> {
    let mut files = Vec::new();
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && SKIP_DIRS.contains(&name.as_ref()))
        })
        .build();
    for entry in walker.flatten() {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.into_path());
        }
    }

    let threads = flags().threads;
    let width = if files.len() > PARALLEL_THRESHOLD {
        threads.max((threads * 2).min(50))
    } else {
        threads
    };
    let pool = match rayon::ThreadPoolBuilder::new().num_threads(width).build() {
        Ok(pool) => pool,
        Err(e) => {
            warn!("could not build scan pool: {e}");
            return files.iter().flat_map(|p| scan_file(root, p)).collect();
        }
    };

    pool.install(|| files.par_iter().flat_map(|p| scan_file(root, p)).collect())
}

/// Scan one file from a checkout. Filename heuristics always run; content is
/// scanned only for reasonably sized text files not seen before this run.
fn scan_file(root: &Path, path: &Path) -> Vec<Match> {
    if !note_file_seen(path) {
        return Vec::new();
    }

    let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");
    let mut matches = filename_matches(&rel);

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    if SKIP_EXTENSIONS.contains(&ext.as_str()) {
        return matches;
    }
    let Ok(meta) = fs::metadata(path) else { return matches };
    if meta.len() > MAX_CONTENT_BYTES {
        return matches;
    }

    let content = if meta.len() >= CHUNKED_READ_FLOOR {
        read_chunked(path, meta.len())
    } else {
        read_whole(path)
    };
    let Some(chunks) = content else { return matches };

    for chunk in &chunks {
        for mut m in scan::scan_text(chunk, true) {
            m.file = rel.clone();
            matches.push(m);
        }
    }
    matches
}

fn filename_matches(rel: &str) -> Vec<Match> {
    let mut out = Vec::new();
    if flags().no_files {
        return out;
    }
    if let Some(found) = INTERESTING_FILENAME.find(rel) {
        let mut m = crate::pool::get_match();
        m.text = rel.to_string();
        m.attributes.push("interesting-filename".to_string());
        m.attributes.push("Sensitive file name".to_string());
        m.line = get_line(rel, found.start(), found.end());
        m.file = rel.to_string();
        m.expression = INTERESTING_FILENAME.as_str().to_string();
        out.push(m);
    }
    out
}

/// Read a small file whole, with binary sniffing.
fn read_whole(path: &Path) -> Option<Vec<String>> {
    let bytes = fs::read(path).ok()?;
    if !looks_textual(&bytes) {
        return None;
    }
    Some(vec![String::from_utf8_lossy(&bytes).into_owned()])
}

/// Read a large file as overlapping chunks so matches spanning a chunk edge
/// are not lost.
fn read_chunked(path: &Path, len: u64) -> Option<Vec<String>> {
    let mut file = File::open(path).ok()?;

    let mut head = vec![0u8; 1024.min(len as usize)];
    file.read_exact(&mut head).ok()?;
    if !looks_textual(&head) {
        return None;
    }
    file.seek(SeekFrom::Start(0)).ok()?;

    let mut chunks = Vec::new();
    let mut offset: u64 = 0;
    let mut buf = vec![0u8; CHUNK_BYTES];
    loop {
        file.seek(SeekFrom::Start(offset)).ok()?;
        let mut read_total = 0;
        while read_total < buf.len() {
            match file.read(&mut buf[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(_) => return None,
            }
        }
        if read_total == 0 {
            break;
        }
        chunks.push(String::from_utf8_lossy(&buf[..read_total]).into_owned());
        if offset + read_total as u64 >= len {
            break;
        }
        offset += (CHUNK_BYTES - CHUNK_OVERLAP) as u64;
    }
    Some(chunks)
}

/// Binary sniffing: NUL density over the first 1 KiB, then the printable
/// fraction of the sample. Exactly 10% NULs still counts as text.
fn looks_textual(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    let head = &bytes[..bytes.len().min(1024)];
    let nulls = head.iter().filter(|&&b| b == 0).count();
    if nulls as f64 / head.len() as f64 > NULL_BYTE_RATIO {
        return false;
    }
    let printable = head
        .iter()
        .filter(|&&b| (0x20..=0x7e).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    printable as f64 / head.len() as f64 >= ASCII_RATIO
}

/// Record a path in the per-run cache; false when it was already scanned.
/// The cache is bounded: on overflow, half the entries are dropped.
fn note_file_seen(path: &Path) -> bool {
    let key = path.to_string_lossy().into_owned();
    let mut seen = FILE_CACHE.lock().unwrap();
    if seen.contains(&key) {
        return false;
    }
    if seen.len() >= FILE_CACHE_CAP {
        let victims: Vec<String> = seen.iter().take(seen.len() / 2).cloned().collect();
        for v in victims {
            seen.remove(&v);
        }
    }
    seen.insert(key)
}

// ---------------------------------------------------------------------------
// Commit replay
// ---------------------------------------------------------------------------

/// Open a local tree and replay its recent commits. Public counterpart of
/// the commit mode, exercised directly against fixture repositories.
pub fn scan_repo_history(path: &Path) -> Vec<Match> {
    match git2::Repository::open(path) {
        Ok(repo) => scan_commits(&repo),
        Err(e) => {
            debug!("cannot open {} for history scan: {e}", path.display());
            Vec::new()
        }
    }
}

/// Walk up to [`MAX_COMMITS`] commits from HEAD, diffing each tree against
/// the previously visited one and scanning the patch text plus any added
/// filenames.
fn scan_commits(repo: &git2::Repository) -> Vec<Match> {
    let mut matches = Vec::new();

    let result = (|| -> Result<(), git2::Error> {
        let mut walk = repo.revwalk()?;
        walk.push_head()?;

        let mut prev_tree: Option<git2::Tree> = None;
        for oid in walk.take(MAX_COMMITS).flatten() {
            let commit = repo.find_commit(oid)?;
            let tree = commit.tree()?;
            if let Some(prev) = &prev_tree {
                if prev.id() != tree.id() {
                    let diff =
                        repo.diff_tree_to_tree(Some(&tree), Some(prev), None)?;
                    if let Some(text) = patch_text(&diff) {
                        for mut m in scan::scan_text(&text, true) {
                            m.commit = oid.to_string();
                            matches.push(m);
                        }
                    }
                }
            }
            prev_tree = Some(tree);
        }
        Ok(())
    })();

    if let Err(e) = result {
        debug!("commit walk aborted: {e}");
    }
    matches
}

/// Render a diff to patch text plus added filenames. The formatter can panic
/// on malformed patches, so this is fenced with `catch_unwind` and a panic
/// becomes a logged error for just this diff.
fn patch_text(diff: &git2::Diff) -> Option<String> {
    let rendered = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut text = String::new();
        let _ = diff.print(git2::DiffFormat::Patch, |_, _, line| {
            text.push_str(&String::from_utf8_lossy(line.content()));
            true
        });
        for delta in diff.deltas() {
            if delta.status() == git2::Delta::Added {
                if let Some(path) = delta.new_file().path() {
                    text.push('\n');
                    text.push_str(&path.to_string_lossy());
                }
            }
        }
        text
    }));
    match rendered {
        Ok(text) => Some(text),
        Err(_) => {
            warn!("patch rendering panicked on a malformed diff, skipping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn exactly_ten_percent_nulls_is_text() {
        // 1024-byte head, 102 NULs = 9.96% -> text; 103 = 10.06% -> binary.
        let mut text_sample = vec![b'a'; 1024];
        for b in text_sample.iter_mut().take(102) {
            *b = 0;
        }
        assert!(looks_textual(&text_sample));

        let mut binary_sample = vec![b'a'; 1024];
        for b in binary_sample.iter_mut().take(103) {
            *b = 0;
        }
        assert!(!looks_textual(&binary_sample));
    }

    #[test]
    fn low_ascii_ratio_is_binary() {
        let mut sample = vec![b'a'; 1024];
        for b in sample.iter_mut().take(200) {
            *b = 0xFF;
        }
        assert!(!looks_textual(&sample));
    }

    #[test]
    fn chunked_read_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        // Two chunks: a marker placed right at the first chunk boundary must
        // appear whole in the overlap region of the second chunk.
        let mut data = vec![b'a'; CHUNK_BYTES + CHUNK_BYTES / 2];
        let marker = b"SECRET_MARKER_TOKEN";
        let pos = CHUNK_BYTES - 5;
        data[pos..pos + marker.len()].copy_from_slice(marker);
        fs::write(&path, &data).unwrap();

        let chunks = read_chunked(&path, data.len() as u64).unwrap();
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().any(|c| c.contains("SECRET_MARKER_TOKEN")));
    }

    #[test]
    fn interesting_filenames_flag() {
        assert!(INTERESTING_FILENAME.is_match("config/production.env"));
        assert!(INTERESTING_FILENAME.is_match("keys/server.pem"));
        assert!(INTERESTING_FILENAME.is_match("vim_settings.xml"));
        assert!(!INTERESTING_FILENAME.is_match("src/main.rs"));
    }

    #[test]
    fn file_cache_rejects_repeats() {
        let p = PathBuf::from("/tmp/githound-test/alpha.txt");
        assert!(note_file_seen(&p));
        assert!(!note_file_seen(&p));
    }
}
