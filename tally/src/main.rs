use clap::{Parser, Subcommand};
use strum::IntoEnumIterator;
use tally_core::aggregates::{self, Maintainer};
use tally_core::connectors::{BigQueryWarehouse, FsObjectStore, GithubClient, JiraTracker, SourceHost, Warehouse};
use tally_core::loaders::{
    BugLoader, BugLoaderConfig, Commenter, IssueLinkLoader, IssueLinkLoaderConfig, JobRunLoader, JobRunLoaderConfig,
    ReleaseLoader, ReleaseLoaderConfig, TestOwnershipLoader,
};
use tally_core::synthetic::OutcomeTests;
use tally_core::variants::JobNameVariants;
use tally_core::{suites, Context, Error, Loader, LoaderKind, Settings, Store};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::level_filters::LevelFilter;

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Tally, CI results ingestion and aggregation
#[derive(Parser, Debug)]
#[command(name = "Tally")]
#[command(about = "CI results ingestion and aggregation", long_about = None)]
struct Args {
    /// SQLite database
    #[arg(long, env = "DATABASE_URL", default_value = "tally.sqlite")]
    database_url: String,

    /// Upper bound on rows written per batch
    #[arg(long, default_value_t = 1024)]
    batch_size: usize,

    /// Retries of a batch that hits a locked database
    #[arg(long, default_value_t = 3)]
    write_retries: u32,

    /// Silence all output
    #[arg(long, short)]
    quiet: bool,

    /// Verbose mode (-v, -vv)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the loaders once, then refresh the aggregates
    Load(LoadArgs),
    /// Create missing aggregates and refresh the others
    Refresh,
    /// Fold tests stored with a suite prefix into their canonical test
    BackfillSuite {
        /// Suite name, e.g. openshift-tests
        name: String,
    },
}

#[derive(clap::Args, Debug)]
struct LoadArgs {
    /// Loaders to run, all of them by default
    #[arg(long, value_delimiter = ',')]
    loaders: Vec<LoaderKind>,

    /// Releases to load, e.g. 4.14
    #[arg(long, value_delimiter = ',')]
    releases: Vec<String>,

    /// Release payload architectures
    #[arg(long, value_delimiter = ',', default_value = "amd64")]
    arches: Vec<String>,

    /// Directory holding the job-run artifacts
    #[arg(long, env = "TALLY_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    /// Only artifacts under this prefix are listed
    #[arg(long, default_value = "")]
    artifacts_prefix: String,

    #[arg(long, env = "BIGQUERY_PROJECT")]
    bigquery_project: Option<String>,

    #[arg(long, env = "BIGQUERY_TOKEN", hide_env_values = true)]
    bigquery_token: Option<String>,

    #[arg(long, env = "JIRA_URL")]
    jira_url: Option<String>,

    #[arg(long, env = "JIRA_TOKEN", hide_env_values = true)]
    jira_token: Option<String>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Comment on the pull requests of failing runs
    #[arg(long)]
    comment: bool,

    /// Only comment on these repositories (org/repo)
    #[arg(long, value_delimiter = ',')]
    comment_include: Vec<String>,

    /// Never comment on these repositories (org/repo)
    #[arg(long, value_delimiter = ',')]
    comment_exclude: Vec<String>,

    /// Jobs known to never pass
    #[arg(long, value_delimiter = ',')]
    never_stable: Vec<String>,

    /// Test names per issue tracker search
    #[arg(long, default_value_t = 50)]
    bug_chunk_size: usize,

    /// Tracker query selecting the issues the issue-links loader keeps
    #[arg(long, default_value = "labels = trt-incident")]
    issue_filter: String,

    /// Give up on loaders still running after this many hours
    #[arg(long, default_value_t = 4)]
    timeout_hours: u64,
}

fn required<'a>(value: &'a Option<String>, flag: &str, kind: LoaderKind) -> Result<&'a str, Error> {
    value
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::InvalidConfig(format!("the {} loader needs --{}", kind, flag)))
}

fn warehouse(args: &LoadArgs, kind: LoaderKind) -> Result<Arc<dyn Warehouse>, Error> {
    let project = required(&args.bigquery_project, "bigquery-project", kind)?;
    let token = required(&args.bigquery_token, "bigquery-token", kind)?;
    Ok(Arc::new(BigQueryWarehouse::new(project, token)?))
}

/// The requested loaders in order without repeats, or all of them.
fn selected_kinds(requested: &[LoaderKind]) -> Vec<LoaderKind> {
    if requested.is_empty() {
        return LoaderKind::iter().collect();
    }
    let mut seen = HashSet::new();
    requested.iter().copied().filter(|kind| seen.insert(*kind)).collect()
}

fn deadline(now: Instant, timeout_hours: u64) -> Result<Instant, Error> {
    timeout_hours
        .checked_mul(3600)
        .and_then(|seconds| now.checked_add(Duration::from_secs(seconds)))
        .ok_or_else(|| Error::InvalidConfig(format!("a timeout of {} hours is out of range", timeout_hours)))
}

fn build_loaders(args: &LoadArgs, store: &Arc<Store>) -> Result<Vec<Box<dyn Loader>>, Error> {
    let kinds = selected_kinds(&args.loaders);

    let github: Option<Arc<dyn SourceHost>> = match (&args.github_token, args.comment) {
        (None, false) => None,
        _ => Some(Arc::new(GithubClient::new(args.github_token.clone())?)),
    };

    let mut loaders: Vec<Box<dyn Loader>> = Vec::new();
    for kind in kinds {
        let loader: Box<dyn Loader> = match kind {
            LoaderKind::JobRuns => {
                let root = args.artifacts_dir.clone().ok_or_else(|| {
                    Error::InvalidConfig(format!("the {} loader needs --artifacts-dir", kind))
                })?;
                let variants = JobNameVariants::new().with_never_stable(args.never_stable.iter().cloned());
                let mut loader = JobRunLoader::new(
                    store.clone(),
                    Arc::new(FsObjectStore::new(root)),
                    Arc::new(variants),
                    Arc::new(OutcomeTests),
                    JobRunLoaderConfig {
                        prefix: args.artifacts_prefix.clone(),
                        releases: args.releases.clone(),
                    },
                );
                if let (true, Some(host)) = (args.comment, &github) {
                    loader = loader.with_commenter(Commenter::new(
                        host.clone(),
                        args.comment_include.clone(),
                        args.comment_exclude.clone(),
                    ));
                }
                Box::new(loader)
            }
            LoaderKind::Releases => {
                if args.releases.is_empty() {
                    return Err(Error::InvalidConfig(format!("the {} loader needs --releases", kind)));
                }
                let mut loader = ReleaseLoader::new(
                    store.clone(),
                    warehouse(args, kind)?,
                    ReleaseLoaderConfig {
                        releases: args.releases.clone(),
                        architectures: args.arches.clone(),
                    },
                );
                if let Some(host) = &github {
                    loader = loader.with_source_host(host.clone());
                }
                Box::new(loader)
            }
            LoaderKind::IssueLinks => {
                let url = required(&args.jira_url, "jira-url", kind)?;
                Box::new(IssueLinkLoader::new(
                    store.clone(),
                    Arc::new(JiraTracker::new(url, args.jira_token.clone())?),
                    IssueLinkLoaderConfig {
                        filter: args.issue_filter.clone(),
                    },
                ))
            }
            LoaderKind::Bugs => {
                let url = required(&args.jira_url, "jira-url", kind)?;
                Box::new(BugLoader::new(
                    store.clone(),
                    Arc::new(JiraTracker::new(url, args.jira_token.clone())?),
                    BugLoaderConfig {
                        chunk_size: args.bug_chunk_size,
                    },
                ))
            }
            LoaderKind::TestOwnership => Box::new(TestOwnershipLoader::new(store.clone(), warehouse(args, kind)?)),
        };
        loaders.push(loader);
    }
    Ok(loaders)
}

async fn load(args: &LoadArgs, store: Arc<Store>) -> Result<ExitCode, Error> {
    let loaders = build_loaders(args, &store)?;
    let maintainer = Maintainer::new(store, aggregates::catalog());

    let (ctx, canceler) = Context::with_deadline(deadline(Instant::now(), args.timeout_hours)?);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling the running loaders");
            canceler.cancel();
        }
    });

    let outcome = tally_core::load(loaders, &maintainer, &ctx, OffsetDateTime::now_utc()).await?;
    for summary in &outcome.summaries {
        match &summary.failure {
            None => tracing::info!(
                "{}: ok in {:.1?} ({} inserted, {} updated, {} skipped, {} item error(s))",
                summary.loader,
                summary.elapsed,
                summary.inserted,
                summary.updated,
                summary.skipped,
                summary.item_errors
            ),
            Some(failure) => tracing::error!(
                "{}: failed after {:.1?} with {} item error(s): {}",
                summary.loader,
                summary.elapsed,
                summary.item_errors,
                failure
            ),
        }
    }
    for (name, maintained) in &outcome.aggregates {
        tracing::info!("aggregate {}: {}", name, maintained);
    }

    if outcome.failed() {
        for failure in &outcome.failures {
            tracing::error!("{}", failure);
        }
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn run(args: Args) -> Result<ExitCode, Error> {
    let settings = Settings {
        database_url: args.database_url,
        batch_size: args.batch_size,
        write_retries: args.write_retries,
        ..Settings::default()
    };
    let store = Arc::new(Store::open(&settings)?);

    match args.command {
        Command::Load(load_args) => load(&load_args, store).await,
        Command::Refresh => {
            let maintainer = Maintainer::new(store, aggregates::catalog());
            for (name, maintained) in maintainer.maintain(OffsetDateTime::now_utc()).await? {
                tracing::info!("aggregate {}: {}", name, maintained);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::BackfillSuite { name } => {
            let report = store
                .run(move |_, conn| suites::backfill_suite(conn, &name))
                .await?;
            tracing::info!(
                "merged {} test(s), moved {} result(s) and {} bug link(s)",
                report.tests_merged,
                report.results_moved,
                report.bug_links_moved
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match (args.quiet, args.verbose) {
        (true, _) => LevelFilter::ERROR,
        (false, 0) => LevelFilter::INFO,
        (false, 1) => LevelFilter::DEBUG,
        (false, _) => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            if e.is_internal() {
                tracing::error!("{:?}", e);
            } else {
                tracing::error!("{}", e);
            }
            ExitCode::FAILURE
        }
    }
}
