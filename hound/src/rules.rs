//! Rule loading and the smart-filter primitives.
//!
//! Rules come from declarative documents in three shapes, tried in order:
//! a structured `rules:` sequence of `{id, pattern, name|description,
//! smart_filtering}`, a legacy structured sequence of `{regex, description,
//! smart_filtering}`, or a plain file with one regex per line. A bad pattern
//! never aborts loading — it is dropped with a bounded warning.

use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// At most this many invalid patterns are warned about individually; the rest
/// are folded into one summary line.
const MAX_PATTERN_WARNINGS: usize = 5;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A compiled detection rule.
#[derive(Clone, Debug)]
pub struct Rule {
    pub id: String,
    pub pattern: Regex,
    /// Source text of the pattern, kept for output.
    pub pattern_text: String,
    pub description: String,
    /// When set, matches must additionally pass the entropy / common-word /
    /// monotone-sequence filter.
    pub smart_filtering: bool,
}

/// An ordered, immutable set of rules, fixed for the process lifetime.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

/// A raw span matched by one rule, before context extraction.
#[derive(Debug)]
pub struct RuleMatch<'r> {
    pub start: usize,
    pub end: usize,
    pub rule: &'r Rule,
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Find every non-overlapping occurrence of every rule in `text`,
    /// applying the smart filter for rules that request it. The category
    /// kill-switches map onto the filter flag: smart-filtered rules are the
    /// API-key class, the rest are keyword rules.
    pub fn matches<'r>(&'r self, text: &str) -> Vec<RuleMatch<'r>> {
        let f = crate::config::flags();
        let mut out = Vec::new();
        for rule in &self.rules {
            if rule.smart_filtering && f.no_api_keys {
                continue;
            }
            if !rule.smart_filtering && f.no_keywords {
                continue;
            }
            for m in rule.pattern.find_iter(text) {
                let span = m.as_str();
                if rule.smart_filtering && !passes_smart_filter(span) {
                    continue;
                }
                out.push(RuleMatch { start: m.start(), end: m.end(), rule });
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Document shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RuleDocument {
    rules: Vec<RawRule>,
}

/// One entry of a structured rule document. The legacy shape (`regex` +
/// `description`) predates rule ids and is still accepted.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawRule {
    Current {
        id: String,
        pattern: String,
        #[serde(alias = "name")]
        description: Option<String>,
        #[serde(default)]
        smart_filtering: bool,
    },
    Legacy {
        regex: String,
        description: Option<String>,
        #[serde(default)]
        smart_filtering: bool,
    },
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Tracks how many bad patterns were seen across one load pass.
struct WarningBudget {
    seen: usize,
}

impl WarningBudget {
    fn new() -> Self {
        Self { seen: 0 }
    }

    fn warn_invalid(&mut self, source: &str, pattern: &str, err: &regex::Error) {
        self.seen += 1;
        if self.seen <= MAX_PATTERN_WARNINGS {
            warn!("invalid pattern in {source}: `{pattern}` ({err})");
        }
    }

    fn finish(&self) {
        if self.seen > MAX_PATTERN_WARNINGS {
            warn!("{} more invalid patterns skipped", self.seen - MAX_PATTERN_WARNINGS);
        }
    }
}

/// Load rules from every given path. Directories expand to the `.yml`/`.yaml`
/// files directly inside them. Returns the combined, ordered set.
pub fn load_rules(paths: &[PathBuf]) -> RuleSet {
    let mut rules = Vec::new();
    let mut budget = WarningBudget::new();

    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = match fs::read_dir(path) {
                Ok(rd) => rd
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        matches!(
                            p.extension().and_then(|e| e.to_str()),
                            Some("yml") | Some("yaml")
                        )
                    })
                    .collect(),
                Err(e) => {
                    warn!("cannot read rules directory {}: {e}", path.display());
                    continue;
                }
            };
            entries.sort();
            for entry in entries {
                load_rules_file(&entry, &mut rules, &mut budget);
            }
        } else {
            load_rules_file(path, &mut rules, &mut budget);
        }
    }

    budget.finish();
    if rules.is_empty() {
        warn!("no rules loaded — scans will only use filename heuristics");
    }
    RuleSet { rules }
}

/// Load the ruleset embedded in the binary, used when `--rules` is not given.
pub fn load_default_rules() -> RuleSet {
    let mut rules = Vec::new();
    let mut budget = WarningBudget::new();
    parse_structured("<builtin>", include_str!("../rules/default.yml"), &mut rules, &mut budget);
    budget.finish();
    RuleSet { rules }
}

fn load_rules_file(path: &Path, rules: &mut Vec<Rule>, budget: &mut WarningBudget) {
    if path.file_name().and_then(|n| n.to_str()) == Some("LICENSE") {
        return;
    }
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("cannot read rules file {}: {e}", path.display());
            return;
        }
    };
    let name = path.display().to_string();
    let structured_only = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    );

    let before = rules.len();
    if parse_structured(&name, &content, rules, budget) {
        debug!("loaded {} rules from {name}", rules.len() - before);
        return;
    }
    if structured_only {
        warn!("{name}: not a structured rule document, skipping");
        return;
    }
    parse_plain(&name, &content, rules, budget);
    debug!("loaded {} rules from {name}", rules.len() - before);
}

/// Try the structured document shapes. Returns false when the document does
/// not parse as YAML with a `rules` sequence at all.
fn parse_structured(
    source: &str,
    content: &str,
    rules: &mut Vec<Rule>,
    budget: &mut WarningBudget,
) -> bool {
    let doc: RuleDocument = match serde_yaml::from_str(content) {
        Ok(doc) => doc,
        Err(_) => return false,
    };
    for (idx, raw) in doc.rules.into_iter().enumerate() {
        let (id, pattern_text, description, smart_filtering) = match raw {
            RawRule::Current { id, pattern, description, smart_filtering } => {
                let description = description.unwrap_or_else(|| id.clone());
                (id, pattern, description, smart_filtering)
            }
            RawRule::Legacy { regex, description, smart_filtering } => {
                let id = format!("rule-{idx}");
                let description = description.unwrap_or_else(|| id.clone());
                (id, regex, description, smart_filtering)
            }
        };
        match Regex::new(&pattern_text) {
            Ok(pattern) => rules.push(Rule {
                id,
                pattern,
                pattern_text,
                description,
                smart_filtering,
            }),
            Err(e) => budget.warn_invalid(source, &pattern_text, &e),
        }
    }
    true
}

/// Plain text: one regex per line. Empty lines, comments, list markers, and
/// bare YAML keys are skipped without comment; anything else that fails to
/// compile costs a warning.
fn parse_plain(source: &str, content: &str, rules: &mut Vec<Rule>, budget: &mut WarningBudget) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') || line.ends_with(':')
        {
            continue;
        }
        match Regex::new(line) {
            Ok(pattern) => {
                let id = format!("custom-{}", rules.len());
                rules.push(Rule {
                    id: id.clone(),
                    pattern,
                    pattern_text: line.to_string(),
                    description: id,
                    smart_filtering: false,
                });
            }
            Err(e) => budget.warn_invalid(source, line, &e),
        }
    }
}

// ---------------------------------------------------------------------------
// Smart filter
// ---------------------------------------------------------------------------

/// Entropy threshold below which a span cannot be a credential.
pub const ENTROPY_THRESHOLD: f64 = 3.5;

/// Dictionary of programming words that disqualify a span. A real credential
/// generator does not emit these.
const PROGRAMMING_WORDS: &[&str] = &[
    "password", "username", "secret", "token", "example", "sample", "default",
    "config", "string", "number", "integer", "boolean", "return", "function",
    "public", "private", "static", "class", "interface", "import", "export",
    "require", "module", "package", "object", "length", "version", "license",
    "description", "content", "select", "insert", "update", "delete", "create",
    "random", "abcdef", "qwerty", "foobar", "lorem", "ipsum", "placeholder",
    "deprecated", "undefined", "address", "localhost",
];

/// A span passes the smart filter when it looks machine-generated: high
/// entropy, no dictionary word, no keyboard-walk sequence.
pub fn passes_smart_filter(span: &str) -> bool {
    entropy(span) > ENTROPY_THRESHOLD && !contains_common_word(span) && !contains_sequence(span)
}

/// Shannon entropy of a string, in bits per character.
pub fn entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    let mut total = 0usize;
    for ch in s.chars() {
        *counts.entry(ch).or_insert(0usize) += 1;
        total += 1;
    }
    let total = total as f64;
    let mut entropy = 0.0;
    for &count in counts.values() {
        let p = count as f64 / total;
        entropy -= p * p.log2();
    }
    entropy
}

/// True if the span contains a word from the programming dictionary,
/// case-insensitively.
pub fn contains_common_word(span: &str) -> bool {
    let lower = span.to_lowercase();
    PROGRAMMING_WORDS.iter().any(|w| lower.contains(w))
}

/// True if more than half of the span's character steps are monotone: each
/// byte equal to, one below, or one above its predecessor. Catches
/// `aaaa…`, `abcdef…`, `12345…` and keyboard walks that survive the entropy
/// check. Per the filters in the NDSS'19 secret-leakage study.
pub fn contains_sequence(span: &str) -> bool {
    let bytes = span.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    let mut steps = 0usize;
    for window in bytes.windows(2) {
        let (prev, next) = (window[0], window[1]);
        if next == prev || next == prev.wrapping_sub(1) || next == prev.wrapping_add(1) {
            steps += 1;
        }
    }
    steps as f64 / bytes.len() as f64 > 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn entropy_of_uniform_string_is_zero() {
        assert_eq!(entropy("aaaaaaa"), 0.0);
        assert_eq!(entropy(""), 0.0);
    }

    #[test]
    fn entropy_of_random_key_clears_threshold() {
        assert!(entropy("odt_KTJlDq2AGGGlqG4riKdT7p980AW8RlU5") > ENTROPY_THRESHOLD);
    }

    #[test]
    fn sequences_are_detected() {
        assert!(contains_sequence("aaaaaaaaaa"));
        assert!(contains_sequence("abcdefghij"));
        assert!(contains_sequence("0123456789"));
        assert!(!contains_sequence("x9Qz2mK8Lp"));
    }

    #[test]
    fn common_words_are_detected() {
        assert!(contains_common_word("myPASSWORD123"));
        assert!(!contains_common_word("KTJlDq2riKdT7p980AW8RlU5"));
    }

    #[test]
    fn structured_rules_load() {
        let doc = "rules:\n  - id: aws-key\n    pattern: 'AKIA[0-9A-Z]{16}'\n    name: AWS access key\n    smart_filtering: false\n";
        let mut rules = Vec::new();
        let mut budget = WarningBudget::new();
        assert!(parse_structured("test", doc, &mut rules, &mut budget));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "aws-key");
        assert_eq!(rules[0].description, "AWS access key");
    }

    #[test]
    fn legacy_shape_loads() {
        let doc = "rules:\n  - regex: 'xox[a-z]-[a-z0-9-]+'\n    description: Slack token\n    smart_filtering: true\n";
        let mut rules = Vec::new();
        let mut budget = WarningBudget::new();
        assert!(parse_structured("test", doc, &mut rules, &mut budget));
        assert_eq!(rules.len(), 1);
        assert!(rules[0].smart_filtering);
        assert_eq!(rules[0].description, "Slack token");
    }

    #[test]
    fn plain_file_skips_invalid_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[A-Z]{{5}}").unwrap();
        writeln!(file, "not a regex (").unwrap();
        writeln!(file, "\\d{{3}}").unwrap();
        let set = load_rules(&[file.path().to_path_buf()]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn license_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let license = dir.path().join("LICENSE");
        std::fs::write(&license, "MIT License\n[A-Z]{5}\n").unwrap();
        let set = load_rules(&[license]);
        assert!(set.is_empty());
    }

    #[test]
    fn directory_expands_to_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "rules:\n  - id: one\n    pattern: 'foo\\d+'\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "bar\\d+\n").unwrap();
        let set = load_rules(&[dir.path().to_path_buf()]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules()[0].id, "one");
    }

    #[test]
    fn loading_is_deterministic() {
        let doc = "rules:\n  - id: a\n    pattern: 'a+'\n  - id: b\n    pattern: 'b+'\n";
        let mut first = Vec::new();
        let mut second = Vec::new();
        let mut budget = WarningBudget::new();
        parse_structured("x", doc, &mut first, &mut budget);
        parse_structured("x", doc, &mut second, &mut budget);
        let ids: Vec<_> = first.iter().map(|r| r.id.as_str()).collect();
        let ids2: Vec<_> = second.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ids2);
    }

    #[test]
    fn builtin_rules_compile() {
        let set = load_default_rules();
        assert!(!set.is_empty());
    }
}
