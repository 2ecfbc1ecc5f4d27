//! GitHound binary — CLI shell and query orchestrator over the [`githound`]
//! library crate.

use clap::Parser;
use colored::Colorize;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{debug, warn};

use githound::config::{self, Flags};
use githound::search::{run_search, SearchError};
use githound::session::{Session, SessionConfig};
use githound::types::SearchOptions;
use githound::{api, github, ingest, output, rules, scan, ui, workers};

/// Dashboard endpoint findings stream to in `--dashboard` mode.
const DASHBOARD_URL: &str = "wss://app.githoundexplore.com/ws";

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// GitHound is a pattern-matching, batch-catching secret snatcher.
#[derive(Parser)]
#[command(name = "git-hound", version, about, long_about = None)]
struct Cli {
    /// Search query (e.g. a domain or organization marker)
    #[arg(long)]
    query: Option<String>,

    /// File with one search query per line
    #[arg(long)]
    query_file: Option<PathBuf>,

    /// Rule document or directory of .yml/.yaml rule documents
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Config file (default: ~/.githound/config.yml)
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Maximum pages of search results per query
    #[arg(long, default_value_t = 100)]
    pages: usize,

    /// Print only matched text, one per line
    #[arg(long)]
    results_only: bool,

    /// Disable rules that use the entropy/dictionary filter
    #[arg(long)]
    no_api_keys: bool,

    /// Disable interesting-filename checks
    #[arg(long)]
    no_files: bool,

    /// Disable plain keyword rules
    #[arg(long)]
    no_keywords: bool,

    /// Disable result scoring (emit everything the rules match)
    #[arg(long)]
    no_scoring: bool,

    /// Keep zero-score results
    #[arg(long)]
    all_results: bool,

    /// Emit findings as JSON records
    #[arg(long)]
    json: bool,

    /// Skip content downloads; scan search previews only
    #[arg(long)]
    fast: bool,

    /// Worker threads
    #[arg(long, default_value_t = 20)]
    threads: usize,

    /// Skip gist search
    #[arg(long)]
    no_gists: bool,

    /// Skip repository search
    #[arg(long)]
    no_repos: bool,

    /// Chase result orderings past the 100-page service window
    #[arg(long)]
    many_results: bool,

    /// Also clone and walk the files of unpopular repos
    #[arg(long)]
    dig_files: bool,

    /// Also replay recent commit diffs of unpopular repos
    #[arg(long)]
    dig_commits: bool,

    /// Stream findings to the GitHound Explore dashboard
    #[arg(long)]
    dashboard: bool,

    /// Resume an existing dashboard search id
    #[arg(long)]
    search_id: Option<String>,

    /// Ingest trufflehog JSON findings from stdin (with --dashboard)
    #[arg(long)]
    trufflehog: bool,

    /// Verbose diagnostics
    #[arg(long)]
    debug: bool,

    /// Print every host API request
    #[arg(long)]
    api_debug: bool,

    /// TOTP code for UI login with 2FA accounts
    #[arg(long)]
    otp_code: Option<String>,

    /// Search backend: api (REST, token) or ui (scrape, credentials)
    #[arg(long, default_value = "api")]
    search_type: String,

    /// Language filter for searches
    #[arg(long)]
    language: Option<String>,

    /// Enable the profiling endpoint (not compiled into release builds)
    #[arg(long, hide = true)]
    profile: bool,

    /// Profiling endpoint bind address
    #[arg(long, hide = true)]
    profile_addr: Option<String>,
}

fn fatal(message: &str) -> ! {
    eprintln!("{}", format!("[!] {message}").red());
    std::process::exit(1);
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Structured logging to stderr; product output stays on stdout.
    let default_level = if cli.debug { "githound=debug" } else { "githound=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if cli.profile || cli.profile_addr.is_some() {
        warn!("profiling endpoints are not compiled into this binary");
    }

    let app_config = match config::load_app_config(cli.config_file.as_deref()) {
        Ok(config) => config,
        Err(e) => fatal(&format!("{e:#}")),
    };
    let github_token = config::resolve_github_token(&app_config);

    config::init_flags(Flags {
        pages: cli.pages,
        threads: cli.threads,
        results_only: cli.results_only,
        json_output: cli.json,
        fast: cli.fast,
        no_scoring: cli.no_scoring,
        all_results: cli.all_results,
        no_keywords: cli.no_keywords,
        no_api_keys: cli.no_api_keys,
        no_files: cli.no_files,
        no_gists: cli.no_gists,
        no_repos: cli.no_repos,
        many_results: cli.many_results,
        dig_files: cli.dig_files,
        dig_commits: cli.dig_commits,
        debug: cli.debug,
        api_debug: cli.api_debug,
        github_token: github_token.clone(),
    });

    github::init_client(cli.threads);
    workers::init_pool(cli.threads);

    let rule_set = match &cli.rules {
        Some(path) => rules::load_rules(std::slice::from_ref(path)),
        None => rules::load_default_rules(),
    };
    debug!("{} rules active", rule_set.len());
    scan::init_rules(rule_set);

    // Stdin carries trufflehog JSON in ingest mode, queries otherwise.
    let queries = match config::gather_queries(
        cli.query.as_deref(),
        cli.query_file.as_deref(),
        !cli.trufflehog,
    ) {
        Ok(queries) => queries,
        Err(e) => fatal(&format!("{e:#}")),
    };

    // ---------------------------------------------------------------------------
    // Dashboard session
    // ---------------------------------------------------------------------------

    if cli.dashboard {
        let insert_key = config::resolve_insert_key(&app_config);
        let session_config =
            SessionConfig::new(DASHBOARD_URL.to_string(), insert_key, cli.search_id.clone());
        match Session::start(session_config).await {
            Ok(session) => session.install(),
            Err(e) => fatal(&format!("{e:#}")),
        }
    }

    let mut queries = queries;
    if queries.is_empty() {
        if !cli.dashboard {
            fatal("no search queries given — use --query, --query-file, or pipe queries in");
        }
        match dashboard_choice(cli.trufflehog) {
            DashboardMode::Ingest => {
                let session = githound::session::active().expect("session just installed");
                let term = cli.query.clone().unwrap_or_else(|| "trufflehog".to_string());
                if cli.search_id.is_none() && session.register_search(&term).await.is_none() {
                    fatal("dashboard did not acknowledge the search registration");
                }
                tokio::task::block_in_place(|| ingest::ingest_stdin(session, &term));
                session.shutdown().await;
                return;
            }
            DashboardMode::Scan(query) => queries.push(query),
        }
    }

    // ---------------------------------------------------------------------------
    // Drive the searches
    // ---------------------------------------------------------------------------

    let options = SearchOptions { max_pages: cli.pages, language: cli.language.clone() };
    let use_api = match cli.search_type.as_str() {
        "api" => true,
        "ui" => false,
        other => fatal(&format!("unknown search type `{other}` (expected api or ui)")),
    };

    let credentials = ui::Credentials {
        username: app_config.github_username.clone().unwrap_or_default(),
        password: app_config.github_password.clone().unwrap_or_default(),
        otp: cli.otp_code.clone().or_else(|| app_config.github_totp_seed.clone()),
    };

    let api_token = if use_api {
        match &github_token {
            Some(token) => token.clone(),
            None => fatal(
                "no access token configured — set GITHOUND_GITHUB_TOKEN or github_access_token",
            ),
        }
    } else {
        if credentials.username.is_empty() || credentials.password.is_empty() {
            fatal("ui search requires github_username and github_password in the config");
        }
        if let Err(e) = ui::login(&credentials).await {
            fatal(&format!("login failed: {e:#}"));
        }
        if !cli.results_only && !cli.json {
            println!(
                "{}",
                format!("[*] Logged into GitHub as {}", credentials.username).cyan()
            );
        }
        String::new()
    };

    for query in &queries {
        if cli.dashboard && cli.search_id.is_none() {
            if let Some(session) = githound::session::active() {
                if session.register_search(query).await.is_none() {
                    warn!("dashboard did not acknowledge search for '{query}'");
                }
            }
        }

        if use_api {
            if !cli.no_repos {
                dispatch(
                    run_search(
                        api::ApiSearch::new(api_token.clone(), query.clone(), &options),
                        query,
                        &options,
                    )
                    .await,
                    query,
                );
            }
        } else {
            if !cli.no_repos {
                dispatch(
                    run_search(ui::UiSearch::new(query.clone(), options.clone()), query, &options)
                        .await,
                    query,
                );
            }
            if !cli.no_gists {
                dispatch(
                    run_search(ui::GistSearch::new(query.clone(), options.clone()), query, &options)
                        .await,
                    query,
                );
            }
        }
    }

    if !cli.results_only && !cli.json {
        println!("{}", "Finished searching... Now waiting for scanning to finish.".green());
    }
    workers::pool().wait().await;

    if let Some(session) = githound::session::active() {
        session.shutdown().await;
    }

    api::print_request_summary();
    let (hits, findings) = scan::counters();
    output::print_summary(queries.len(), hits, findings);
}

fn dispatch(result: Result<usize, SearchError>, query: &str) {
    match result {
        Ok(_) => {}
        Err(SearchError::Fatal(message)) => fatal(&message),
        Err(SearchError::Other(e)) => {
            eprintln!("{}", format!("[!] Error searching for `{query}`: {e:#}").red());
        }
    }
}

// ---------------------------------------------------------------------------
// Dashboard interactive choice
// ---------------------------------------------------------------------------

enum DashboardMode {
    Scan(String),
    Ingest,
}

/// With a dashboard but no queries: ingest when stdin is piped trufflehog
/// output, otherwise ask what to do.
fn dashboard_choice(trufflehog: bool) -> DashboardMode {
    if trufflehog {
        return DashboardMode::Ingest;
    }
    if !std::io::stdin().is_terminal() {
        // Nothing piped in, nothing typed — nothing to scan.
        fatal("no search queries given and stdin is empty");
    }

    println!("1) Scan now");
    println!("2) Ingest external scanner output");
    print!("Choice [1]: ");
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let mut choice = String::new();
    let _ = std::io::stdin().read_line(&mut choice);
    if choice.trim() == "2" {
        return DashboardMode::Ingest;
    }

    print!("Search query: ");
    let _ = std::io::stdout().flush();
    let mut query = String::new();
    let _ = std::io::stdin().read_line(&mut query);
    let query = query.trim().to_string();
    if query.is_empty() {
        fatal("no search query given");
    }
    DashboardMode::Scan(query)
}
