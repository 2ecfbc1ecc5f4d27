//! Match object pool.
//!
//! Scanning allocates one `Match` per rule hit, and a busy run produces tens
//! of thousands of them. The pool hands out reset objects so the hot path
//! recycles allocations instead of churning the allocator.

use once_cell::sync::Lazy;
use std::sync::Mutex;

/// The context line around a match, with the matched span's indices local to
/// that line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub match_index: usize,
    pub match_end_index: usize,
}

/// A single rule hit inside some text blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Match {
    /// The matched text itself.
    pub text: String,
    /// Ordered tags: rule id, rule description, then any markers such as
    /// `base64` added by the scanner.
    pub attributes: Vec<String>,
    pub line: Line,
    /// Commit sha, set only for matches found in commit diffs.
    pub commit: String,
    /// In-repo path, set only for matches found by the deep scan.
    pub file: String,
    /// Source text of the expression that matched.
    pub expression: String,
}

impl Match {
    fn reset(&mut self) {
        self.text.clear();
        self.attributes.clear();
        self.line = Line::default();
        self.commit.clear();
        self.file.clear();
        self.expression.clear();
    }
}

/// How many reset matches the pool keeps around between bursts.
const POOL_CAP: usize = 4096;

static MATCH_POOL: Lazy<Mutex<Vec<Match>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Get a reset `Match` from the pool, or a fresh one if the pool is empty.
pub fn get_match() -> Match {
    let mut pool = MATCH_POOL.lock().unwrap();
    pool.pop().unwrap_or_default()
}

/// Return a `Match` to the pool for reuse. The object is cleared here so no
/// finding data leaks into the next borrower.
pub fn put_match(mut m: Match) {
    m.reset();
    let mut pool = MATCH_POOL.lock().unwrap();
    if pool.len() < POOL_CAP {
        pool.push(m);
    }
}

/// Return a batch of matches to the pool.
pub fn put_matches(matches: Vec<Match>) {
    for m in matches {
        put_match(m);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_matches_are_reset() {
        let mut m = get_match();
        m.text = "AKIA1234".into();
        m.attributes.push("aws".into());
        m.commit = "deadbeef".into();
        put_match(m);

        let again = get_match();
        assert!(again.text.is_empty());
        assert!(again.attributes.is_empty());
        assert!(again.commit.is_empty());
    }
}
