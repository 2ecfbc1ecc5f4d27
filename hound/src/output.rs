//! Terminal sink: colored human output, machine JSON records, and the final
//! run summary.

use colored::Colorize;

use crate::api::FileMeta;
use crate::config::flags;
use crate::pool::Match;
use crate::types::{Finding, RepoSearchResult};

/// Assemble the emitted record for a match. Deep-scan matches point their
/// `file`/`url` at the in-repo path; commit matches link the commit itself.
pub fn build_finding(hit: &RepoSearchResult, m: &Match, meta: Option<&FileMeta>) -> Finding {
    let deep = !m.file.is_empty();
    let file = if deep { m.file.clone() } else { hit.file.clone() };
    let url = if !m.commit.is_empty() {
        format!("{}/commit/{}", hit.repo_url(), m.commit)
    } else if deep {
        format!("{}/blob/HEAD/{}", hit.repo_url(), m.file)
    } else {
        hit.url.clone()
    };

    Finding {
        repo: hit.repo.clone(),
        file,
        context: m.line.text.clone(),
        match_text: m.text.clone(),
        attributes: m.attributes.clone(),
        file_last_updated: meta.map(|m| m.last_updated.clone()).unwrap_or_default(),
        file_last_author: meta.map(|m| m.author_email.clone()).unwrap_or_default(),
        url,
    }
}

/// Green banner line printed once per repo with visible findings.
pub fn print_repo_header(hit: &RepoSearchResult) {
    println!("{}", format!("[{}]", hit.repo_url()).green());
}

/// Emit one finding in whichever terminal mode is active.
pub fn print_finding(finding: &Finding, m: &Match) {
    let f = flags();
    if f.json_output {
        if let Ok(line) = serde_json::to_string(finding) {
            println!("{line}");
        }
        return;
    }
    if f.results_only {
        println!("{}", finding.match_text);
        return;
    }

    print_context_line(m);
    println!("Pattern: {}", m.expression);
    if !m.attributes.is_empty() {
        println!("Attributes: {}", m.attributes.join(", "));
    }
    if !finding.file_last_author.is_empty() {
        println!(
            "Last touched by {} ({})",
            finding.file_last_author, finding.file_last_updated
        );
    }
    println!("{}", finding.url.dimmed());
}

/// The context line with the matched span highlighted.
fn print_context_line(m: &Match) {
    let line = &m.line;
    let (start, end) = (line.match_index, line.match_end_index);
    if end > line.text.len() || start > end {
        println!("{}", line.text);
        return;
    }
    println!(
        "{}{}{}",
        &line.text[..start],
        line.text[start..end].red(),
        &line.text[end..]
    );
}

/// Final run summary, printed after the worker pool drains.
pub fn print_summary(queries: usize, hits: usize, findings: usize) {
    let f = flags();
    if f.results_only || f.json_output {
        return;
    }
    println!(
        "{}",
        format!(
            "Finished: {queries} queries, {hits} files scanned, {findings} findings."
        )
        .green()
    );
}
