//! CLI command definitions for post-archiver.
//!
//! Every command starts from [`ArchiverConfig::from_env`] and applies its
//! flags on top, so a flag always wins over the matching `ARCHIVER_*`
//! variable.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::metadata::{generate_metadata, JsonFileMetadataStore, MetadataQuery, MetadataStore, SortOrder};
use crate::pipeline::{
    ArchiverConfig, Cursor, NotifierPublisher, Orchestrator, Producer, StageKind, StageResult,
    WorkItem,
};
use crate::stages::{CommentsStage, MediaStage, Stage, SubmissionStage};
use crate::storage::{
    ConfigStore, JsonFileConfigStore, LocalStorage, LogNotifier, MemoryConfigStore,
    MemoryStorage, MetadataCommand, Notifier, SpoolNotifier, Storage,
};
use crate::upstream::{RateLimiter, UpstreamApi, UpstreamClient};

/// Default archive root.
const DEFAULT_OUTPUT_DIR: &str = "./archive";

/// Default discovery-config file.
const DEFAULT_STATE_FILE: &str = "./archive-state.json";

const DEFAULT_METADATA_FILE: &str = "./archive-metadata.json";

/// Rate-limited subreddit archiver.
#[derive(Parser)]
#[command(name = "post-archiver")]
#[command(about = "Crawl a subreddit through the Pushshift API and archive posts, comments and media")]
#[command(version)]
#[command(
    long_about = "post-archiver discovers submissions through the Pushshift search API and archives each one's post body, comment tree and media.\n\nExample usage:\n  post-archiver archive --subreddit superstonk --flair DD --after 2021-06-01 --output ./archive"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run discovery and every stage in-process, then write the job report.
    Archive(ArchiveArgs),

    /// Run discovery only, handing item ids to a notifier.
    Discover(DiscoverArgs),

    /// Process one delivered item id through a single stage.
    Stage(StageArgs),

    /// Backfill metadata records from the archive.
    Metadata(MetadataArgs),

    /// Query generated metadata.
    Query(QueryArgs),
}

/// Upstream connection flags.
#[derive(clap::Args, Debug, Clone)]
pub struct UpstreamArgs {
    /// Upstream API root.
    #[arg(long)]
    pub upstream_url: Option<String>,

    /// Upstream requests per second.
    #[arg(long)]
    pub rate_limit: Option<f64>,

    /// Token bucket capacity.
    #[arg(long)]
    pub burst: Option<usize>,
}

impl UpstreamArgs {
    fn apply(&self, mut config: ArchiverConfig) -> ArchiverConfig {
        if let Some(url) = &self.upstream_url {
            config = config.with_upstream_url(url);
        }
        if let Some(rate) = self.rate_limit {
            config.rate_limit = rate;
        }
        if let Some(burst) = self.burst {
            config.burst = burst;
        }
        config
    }
}

/// Discovery flags shared by `archive` and `discover`.
#[derive(clap::Args, Debug, Clone)]
pub struct DiscoveryArgs {
    /// Subreddit to crawl.
    #[arg(short, long)]
    pub subreddit: Option<String>,

    /// Only archive submissions whose flair contains this text.
    #[arg(short, long)]
    pub flair: Option<String>,

    /// Start after this time (ISO-8601 or UNIX seconds). A persisted cursor wins.
    #[arg(long, value_parser = parse_timestamp)]
    pub after: Option<Cursor>,

    /// Stop before this time (ISO-8601 or UNIX seconds).
    #[arg(long, value_parser = parse_timestamp)]
    pub before: Option<Cursor>,

    /// Discovery-config file holding the cursor.
    #[arg(long, default_value = DEFAULT_STATE_FILE, env = "ARCHIVER_STATE_FILE")]
    pub state: PathBuf,

    #[command(flatten)]
    pub upstream: UpstreamArgs,
}

impl DiscoveryArgs {
    fn apply(&self, mut config: ArchiverConfig) -> ArchiverConfig {
        if let Some(subreddit) = &self.subreddit {
            config = config.with_subreddit(subreddit);
        }
        if let Some(flair) = &self.flair {
            config = config.with_flair(flair);
        }
        if self.after.is_some() {
            config.after = self.after;
        }
        if self.before.is_some() {
            config.before = self.before;
        }
        self.upstream.apply(config)
    }
}

#[derive(clap::Args, Debug)]
pub struct ArchiveArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    /// Archive root directory.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_DIR, env = "ARCHIVER_OUTPUT_DIR")]
    pub output: PathBuf,

    /// Keep everything in memory; neither the archive nor the cursor is written.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub submission_workers: Option<usize>,

    #[arg(long)]
    pub comments_workers: Option<usize>,

    #[arg(long)]
    pub media_workers: Option<usize>,

    /// Seconds an idle stage queue is waited on before its pool drains.
    #[arg(long)]
    pub queue_timeout: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct DiscoverArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    /// Append discovered ids to this spool file instead of only logging them.
    #[arg(long)]
    pub spool: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct StageArgs {
    /// Stage to run.
    #[arg(value_enum)]
    pub kind: StageKind,

    /// Submission id as delivered by the notifier.
    pub id: String,

    /// Archive root directory.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_DIR, env = "ARCHIVER_OUTPUT_DIR")]
    pub output: PathBuf,

    #[command(flatten)]
    pub upstream: UpstreamArgs,
}

#[derive(clap::Args, Debug)]
pub struct MetadataArgs {
    /// Archive root directory.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_DIR, env = "ARCHIVER_OUTPUT_DIR")]
    pub output: PathBuf,

    /// Discovery-config file holding the backfill progress marker.
    #[arg(long, default_value = DEFAULT_STATE_FILE, env = "ARCHIVER_STATE_FILE")]
    pub state: PathBuf,

    /// Metadata store file.
    #[arg(long, default_value = DEFAULT_METADATA_FILE, env = "ARCHIVER_METADATA_FILE")]
    pub metadata_file: PathBuf,

    /// Regenerate every record instead of resuming.
    #[arg(long)]
    pub rebuild: bool,
}

#[derive(clap::Args, Debug)]
pub struct QueryArgs {
    /// Metadata store file.
    #[arg(long, default_value = DEFAULT_METADATA_FILE, env = "ARCHIVER_METADATA_FILE")]
    pub metadata_file: PathBuf,

    #[arg(long)]
    pub author: Option<String>,

    #[arg(long)]
    pub post_type: Option<String>,

    /// Sort field (created_utc or score).
    #[arg(long, default_value = "created_utc")]
    pub sort: String,

    #[arg(long, value_enum, default_value = "asc")]
    pub order: SortOrder,

    /// Continue after this submission id (the previous page's `last_id`).
    #[arg(long)]
    pub after_id: Option<String>,

    #[arg(short = 'n', long, default_value = "100")]
    pub limit: usize,
}

/// Parses ISO-8601 (date, naive or zoned date-time) or UNIX seconds.
fn parse_timestamp(value: &str) -> Result<Cursor, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return Ok(Cursor(secs));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(Cursor(dt.timestamp()));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Cursor(dt.and_utc().timestamp()));
    }
    if let Some(dt) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(Cursor(dt.and_utc().timestamp()));
    }
    Err(format!(
        "'{value}' is neither UNIX seconds nor an ISO-8601 date or date-time"
    ))
}

/// Parses the command line without running anything.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Archive(args) => run_archive_command(args).await,
        Commands::Discover(args) => run_discover_command(args).await,
        Commands::Stage(args) => run_stage_command(args).await,
        Commands::Metadata(args) => run_metadata_command(args).await,
        Commands::Query(args) => run_query_command(args).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Archive Command Implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct ArchiveOutput {
    job_id: String,
    status: String,
    submissions: usize,
    results: usize,
    failures: usize,
    report: String,
    dry_run: bool,
}

async fn run_archive_command(args: ArchiveArgs) -> anyhow::Result<()> {
    let mut config = args.discovery.apply(ArchiverConfig::from_env()?);
    if let Some(n) = args.submission_workers {
        config = config.with_workers(StageKind::Submission, n);
    }
    if let Some(n) = args.comments_workers {
        config = config.with_workers(StageKind::Comments, n);
    }
    if let Some(n) = args.media_workers {
        config = config.with_workers(StageKind::Media, n);
    }
    if let Some(secs) = args.queue_timeout {
        config = config.with_queue_timeout(std::time::Duration::from_secs(secs));
    }

    let file_store = JsonFileConfigStore::new(&args.discovery.state);
    let (storage, config_store): (Arc<dyn Storage>, Arc<dyn ConfigStore>) = if args.dry_run {
        // Starts from the saved cursor but never moves it.
        let saved = file_store.get_config().await?;
        (
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryConfigStore::with_config(saved)),
        )
    } else {
        (
            Arc::new(LocalStorage::open(&args.output).await?),
            Arc::new(file_store),
        )
    };

    info!(
        subreddit = %config.subreddit,
        flair = ?config.flair,
        output = %args.output.display(),
        dry_run = args.dry_run,
        "Starting archive job"
    );

    let report = Orchestrator::new(config, storage, config_store).run().await?;

    print_json(&ArchiveOutput {
        job_id: report.job_id.to_string(),
        status: report.status.to_string(),
        submissions: report.submissions.len(),
        results: report.result_count(),
        failures: report.failure_count(),
        report: report.file_name(),
        dry_run: args.dry_run,
    })
}

// ============================================================================
// Discover Command Implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct DiscoverOutput {
    pages: usize,
    records: usize,
    published: usize,
    cursor: Option<i64>,
}

async fn run_discover_command(args: DiscoverArgs) -> anyhow::Result<()> {
    let config = args.discovery.apply(ArchiverConfig::from_env()?);
    config.validate()?;

    let upstream = build_upstream_client(&config)?;
    let config_store = Arc::new(JsonFileConfigStore::new(&args.discovery.state));
    let notifier: Arc<dyn Notifier> = match &args.spool {
        Some(path) => Arc::new(SpoolNotifier::new(path)),
        None => Arc::new(LogNotifier),
    };

    let producer = Producer::new(Arc::new(upstream), config_store, &config);
    let summary = producer.run(&NotifierPublisher::new(notifier)).await?;

    print_json(&DiscoverOutput {
        pages: summary.pages,
        records: summary.records,
        published: summary.published,
        cursor: summary.cursor.map(Cursor::as_secs),
    })
}

// ============================================================================
// Stage Command Implementation
// ============================================================================

async fn run_stage_command(args: StageArgs) -> anyhow::Result<()> {
    let config = args.upstream.apply(ArchiverConfig::from_env()?);
    config.validate()?;

    let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.burst)?);
    let upstream: Arc<dyn UpstreamApi> = Arc::new(UpstreamClient::new(
        &config.upstream_url,
        Arc::clone(&limiter),
        config.upstream_retry(),
        config.http_timeout,
    )?);

    let record = upstream
        .fetch_submission(&args.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Submission '{}' not found upstream", args.id))?;
    let item = WorkItem::from_record(record)
        .ok_or_else(|| anyhow::anyhow!("Submission '{}' has no id or created_utc", args.id))?;

    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::open(&args.output).await?);
    let stage: Box<dyn Stage> = match args.kind {
        StageKind::Submission => Box::new(SubmissionStage::new(storage)),
        StageKind::Comments => Box::new(CommentsStage::new(upstream, storage)),
        StageKind::Media => Box::new(MediaStage::new(
            limiter,
            config.media_retry(),
            storage,
            config.http_timeout,
        )?),
    };

    let result = match stage.process(&item).await {
        Ok(fragment) => StageResult::success(item.id(), args.kind, fragment),
        Err(e) => StageResult::failure(item.id(), args.kind, e.to_string()),
    };
    print_json(&result)?;

    if !result.is_success() {
        anyhow::bail!("{} stage failed for '{}'", args.kind, item.id());
    }
    Ok(())
}

fn build_upstream_client(config: &ArchiverConfig) -> anyhow::Result<UpstreamClient> {
    let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.burst)?);
    Ok(UpstreamClient::new(
        &config.upstream_url,
        limiter,
        config.upstream_retry(),
        config.http_timeout,
    )?)
}

// ============================================================================
// Metadata Command Implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct MetadataOutput {
    generated: usize,
    skipped: usize,
    last_generated: Option<String>,
}

async fn run_metadata_command(args: MetadataArgs) -> anyhow::Result<()> {
    let storage = LocalStorage::open(&args.output).await?;
    let config_store = JsonFileConfigStore::new(&args.state);
    if args.rebuild {
        let mut config = config_store.get_config().await?;
        config.metadata_command = Some(MetadataCommand::Rebuild);
        config_store.put_config(&config).await?;
    }
    let metadata = JsonFileMetadataStore::new(&args.metadata_file);

    let summary = generate_metadata(&storage, &config_store, &metadata).await?;

    print_json(&MetadataOutput {
        generated: summary.generated,
        skipped: summary.skipped,
        last_generated: summary.last_generated,
    })
}

fn build_query(args: &QueryArgs) -> MetadataQuery {
    let mut query = MetadataQuery::new()
        .with_limit(args.limit)
        .sorted_by(&args.sort, args.order);
    match (&args.author, &args.post_type) {
        (Some(author), Some(post_type)) => {
            query = query
                .partitioned_by("author", author)
                .filtered_by("post_type", post_type);
        }
        (Some(author), None) => query = query.partitioned_by("author", author),
        (None, Some(post_type)) => query = query.partitioned_by("post_type", post_type),
        (None, None) => {}
    }
    if let Some(after) = &args.after_id {
        query = query.after(after);
    }
    query
}

async fn run_query_command(args: QueryArgs) -> anyhow::Result<()> {
    let store = JsonFileMetadataStore::new(&args.metadata_file);
    let page = store.query(&build_query(&args)).await?;
    print_json(&page)
}
