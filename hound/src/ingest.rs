//! External-scanner ingestion.
//!
//! With `--dashboard --trufflehog`, findings from a trufflehog run are read
//! as line-delimited JSON on stdin and forwarded to the dashboard as regular
//! `search_result` frames, normalized just enough for the result table.

use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use std::io::BufRead;
use tracing::{debug, warn};

use crate::session::Session;
use crate::types::Finding;

/// The subset of a trufflehog JSON finding the dashboard cares about.
#[derive(Deserialize, Default)]
struct TrufflehogFinding {
    #[serde(rename = "DetectorName", default)]
    detector_name: String,
    #[serde(rename = "Raw", default)]
    raw: String,
    #[serde(rename = "Redacted", default)]
    redacted: String,
    #[serde(rename = "SourceMetadata", default)]
    source_metadata: Value,
}

impl TrufflehogFinding {
    fn git_field(&self, key: &str) -> String {
        ["Github", "Git", "Gitlab"]
            .iter()
            .find_map(|provider| {
                self.source_metadata
                    .get("Data")
                    .and_then(|d| d.get(provider))
                    .and_then(|g| g.get(key))
            })
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }
}

/// Read trufflehog findings from stdin until EOF, forwarding each to the
/// session. Returns the number forwarded. Unparseable lines are skipped.
pub fn ingest_stdin(session: &Session, search_term: &str) -> usize {
    let stdin = std::io::stdin();
    let mut forwarded = 0usize;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let parsed: TrufflehogFinding = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("skipping unparseable trufflehog line: {e}");
                continue;
            }
        };

        let match_text = if parsed.raw.is_empty() { parsed.redacted.clone() } else { parsed.raw.clone() };
        if match_text.is_empty() {
            continue;
        }

        let finding = Finding {
            repo: parsed.git_field("repository"),
            file: parsed.git_field("file"),
            context: match_text.clone(),
            match_text,
            attributes: vec!["trufflehog".to_string(), parsed.detector_name.clone()],
            file_last_updated: parsed.git_field("timestamp"),
            file_last_author: parsed.git_field("email"),
            url: parsed.git_field("link"),
        };
        session.send_result(&finding, search_term);
        forwarded += 1;
    }

    println!("{}", format!("[*] Forwarded {forwarded} external findings.").cyan());
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trufflehog_line_parses() {
        let line = r#"{
            "DetectorName": "AWS",
            "Raw": "AKIA1234567890ABCDEF",
            "SourceMetadata": {"Data": {"Github": {
                "repository": "https://github.com/acme/infra.git",
                "file": "config/app.yml",
                "email": "dev@acme.example",
                "link": "https://github.com/acme/infra/blob/x/config/app.yml"
            }}}
        }"#;
        let parsed: TrufflehogFinding = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.detector_name, "AWS");
        assert_eq!(parsed.git_field("file"), "config/app.yml");
        assert_eq!(parsed.git_field("email"), "dev@acme.example");
        assert_eq!(parsed.git_field("missing"), "");
    }
}
