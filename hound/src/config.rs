//! Configuration: the YAML config file, environment overrides, the runtime
//! flags singleton, and query assembly from the various input channels.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Token env override; wins over the config file.
pub const ENV_GITHUB_TOKEN: &str = "GITHOUND_GITHUB_TOKEN";

/// Dashboard insert-key env override; wins over config and the stored token.
pub const ENV_INSERT_KEY: &str = "GITHOUND_INSERT_KEY";

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// `~/.githound/config.yml` (or `--config-file`).
#[derive(Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub github_access_token: Option<String>,
    #[serde(default)]
    pub github_username: Option<String>,
    #[serde(default)]
    pub github_password: Option<String>,
    #[serde(default)]
    pub github_totp_seed: Option<String>,
    #[serde(default)]
    pub insert_key: Option<String>,
}

/// Load the config file. An explicit path that cannot be read is fatal; the
/// default locations are optional.
pub fn load_app_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        return serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()));
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = crate::config_dir() {
        candidates.push(dir.join("config.yml"));
        candidates.push(dir.join("config.yaml"));
    }
    candidates.push(PathBuf::from("config.yml"));

    for path in candidates {
        if let Ok(content) = std::fs::read_to_string(&path) {
            debug!("using config file {}", path.display());
            match serde_yaml::from_str(&content) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("cannot parse config file {}", path.display())
                    })
                }
            }
        }
    }
    Ok(AppConfig::default())
}

/// Access token: environment first, then the config file.
pub fn resolve_github_token(config: &AppConfig) -> Option<String> {
    std::env::var(ENV_GITHUB_TOKEN)
        .ok()
        .filter(|t| !t.is_empty())
        .or_else(|| config.github_access_token.clone())
}

/// Dashboard insert key: environment, config file, then the token persisted
/// by a previous account-link flow.
pub fn resolve_insert_key(config: &AppConfig) -> Option<String> {
    std::env::var(ENV_INSERT_KEY)
        .ok()
        .filter(|t| !t.is_empty())
        .or_else(|| config.insert_key.clone())
        .or_else(crate::session::stored_token)
}

// ---------------------------------------------------------------------------
// Runtime flags
// ---------------------------------------------------------------------------

/// The flag subset the scanning pipeline consults at runtime. Set once at
/// startup, immutable afterwards.
#[derive(Clone, Debug)]
pub struct Flags {
    pub pages: usize,
    pub threads: usize,
    pub results_only: bool,
    pub json_output: bool,
    pub fast: bool,
    pub no_scoring: bool,
    pub all_results: bool,
    pub no_keywords: bool,
    pub no_api_keys: bool,
    pub no_files: bool,
    pub no_gists: bool,
    pub no_repos: bool,
    pub many_results: bool,
    pub dig_files: bool,
    pub dig_commits: bool,
    pub debug: bool,
    pub api_debug: bool,
    pub github_token: Option<String>,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            pages: 100,
            threads: 20,
            results_only: false,
            json_output: false,
            fast: false,
            no_scoring: false,
            all_results: false,
            no_keywords: false,
            no_api_keys: false,
            no_files: false,
            no_gists: false,
            no_repos: false,
            many_results: false,
            dig_files: false,
            dig_commits: false,
            debug: false,
            api_debug: false,
            github_token: None,
        }
    }
}

static FLAGS: OnceCell<Flags> = OnceCell::new();

/// Install the runtime flags. Later calls lose.
pub fn init_flags(flags: Flags) {
    let _ = FLAGS.set(flags);
}

/// The runtime flags; defaults when nothing was installed (tests).
pub fn flags() -> &'static Flags {
    FLAGS.get_or_init(Flags::default)
}

#[cfg(test)]
pub fn init_test_flags() {
    let _ = flags();
}

// ---------------------------------------------------------------------------
// Query assembly
// ---------------------------------------------------------------------------

/// Collect queries from the explicit flag, a line-delimited file, and — when
/// stdin is a pipe and not claimed by ingestion — standard input.
pub fn gather_queries(
    explicit: Option<&str>,
    query_file: Option<&Path>,
    read_stdin: bool,
) -> Result<Vec<String>> {
    let mut queries = Vec::new();

    if let Some(q) = explicit {
        if !q.is_empty() {
            queries.push(q.to_string());
        }
    }
    if let Some(path) = query_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read query file {}", path.display()))?;
        queries.extend(non_empty_lines(&content));
    }
    if read_stdin && !std::io::stdin().is_terminal() {
        let mut piped = String::new();
        use std::io::Read;
        if std::io::stdin().read_to_string(&mut piped).is_ok() {
            queries.extend(non_empty_lines(&piped));
        }
    }
    Ok(queries)
}

fn non_empty_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_parses_yaml() {
        let yaml = "github_access_token: ghp_x\ngithub_username: alice\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.github_access_token.as_deref(), Some("ghp_x"));
        assert_eq!(config.github_username.as_deref(), Some("alice"));
        assert!(config.insert_key.is_none());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        assert!(load_app_config(Some(Path::new("/nonexistent/githound.yml"))).is_err());
    }

    #[test]
    fn query_file_lines_are_collected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "corp.example.com").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  internal.example.com  ").unwrap();
        let lines = non_empty_lines(&std::fs::read_to_string(file.path()).unwrap());
        assert_eq!(lines, vec!["corp.example.com", "internal.example.com"]);
    }

    #[test]
    fn defaults_match_cli_contract() {
        let f = Flags::default();
        assert_eq!(f.pages, 100);
        assert_eq!(f.threads, 20);
    }
}
