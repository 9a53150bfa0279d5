//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use reportflow_core::{
    AgentRegistry, BridgeAgent, JobOutcome, JobQueue, RetrievalAgent, StageGraph, Worker,
    stop_signal,
};
use reportflow_ranking::{HybridRanker, OllamaEmbedder, RankingParams, ingest_document};
use reportflow_shared::{AppConfig, RunId, Stage, init_config, load_config};
use reportflow_storage::{NewDocument, NewJob, Storage};
use serde_json::json;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// reportflow: staged report generation over a local document corpus.
#[derive(Parser)]
#[command(
    name = "reportflow",
    version,
    about = "Drive report-generation runs through a durable job pipeline and rank a local corpus.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database file (overrides config).
    #[arg(long, env = "DATABASE_PATH", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create, start, and inspect runs.
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Process queued jobs.
    Worker {
        /// Exit once no job is claimable instead of polling.
        #[arg(long)]
        until_idle: bool,
    },

    /// Rank the corpus for a query without storing results.
    Search {
        /// Query text.
        query: String,

        /// Term the results must not contain (repeatable).
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,

        /// Number of results (defaults to retrieval.top_k).
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Job maintenance.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Manage the document corpus.
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Run subcommands.
#[derive(Subcommand)]
pub(crate) enum RunAction {
    /// Create a run in `initializing`.
    Create {
        /// Report topic.
        #[arg(long)]
        topic: String,

        /// Run configuration as a JSON object.
        #[arg(long)]
        config: Option<String>,
    },
    /// Enqueue the outline job and mark the run running.
    Start { run_id: String },
    /// Show run status and job progress.
    Status { run_id: String },
    /// List runs, newest first.
    List,
    /// Delete a run and everything it owns.
    Delete { run_id: String },
    /// Show ranked chunks for one outline node.
    Results {
        run_id: String,

        /// Outline node id.
        #[arg(long)]
        node: String,
    },
}

/// Job subcommands.
#[derive(Subcommand)]
pub(crate) enum JobAction {
    /// Enqueue a fresh copy of a failed job.
    Retry { job_id: String },
}

/// Document subcommands.
#[derive(Subcommand)]
pub(crate) enum DocAction {
    /// Chunk, embed, and store a text file.
    Add {
        /// UTF-8 text file.
        file: PathBuf,

        #[arg(long)]
        title: String,

        #[arg(long)]
        author: Option<String>,

        #[arg(long)]
        year: Option<i64>,
    },
    /// List stored documents.
    List,
    /// Delete a document and its chunks.
    Delete { doc_id: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "reportflow=info",
        1 => "reportflow=debug",
        _ => "reportflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        };
    }

    let mut config = load_config()?;
    if let Some(db) = &cli.db {
        config.database.path = db.to_string_lossy().into_owned();
    }
    let storage = Storage::open(Path::new(&config.database.path)).await?;

    match cli.command {
        Command::Run { action } => match action {
            RunAction::Create { topic, config } => cmd_run_create(&storage, &topic, config.as_deref()).await,
            RunAction::Start { run_id } => cmd_run_start(&storage, &run_id).await,
            RunAction::Status { run_id } => cmd_run_status(&storage, &run_id).await,
            RunAction::List => cmd_run_list(&storage).await,
            RunAction::Delete { run_id } => cmd_run_delete(&storage, &run_id).await,
            RunAction::Results { run_id, node } => cmd_run_results(&storage, &run_id, &node).await,
        },
        Command::Worker { until_idle } => cmd_worker(storage, &config, until_idle).await,
        Command::Search {
            query,
            exclude,
            top_k,
        } => cmd_search(&storage, &config, &query, &exclude, top_k).await,
        Command::Job { action } => match action {
            JobAction::Retry { job_id } => cmd_job_retry(&storage, &job_id).await,
        },
        Command::Doc { action } => match action {
            DocAction::Add {
                file,
                title,
                author,
                year,
            } => cmd_doc_add(&storage, &config, &file, title, author, year).await,
            DocAction::List => cmd_doc_list(&storage).await,
            DocAction::Delete { doc_id } => cmd_doc_delete(&storage, &doc_id).await,
        },
        Command::Config { .. } => Ok(()),
    }
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    raw.parse()
        .map_err(|e| eyre!("invalid run id '{raw}': {e}"))
}

fn ranker(config: &AppConfig) -> Result<HybridRanker> {
    let embedder = OllamaEmbedder::new(&config.embeddings)?;
    Ok(HybridRanker::new(
        Arc::new(embedder),
        RankingParams::from(&config.retrieval),
    ))
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner.set_message(message.to_string());
    Ok(spinner)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

async fn cmd_run_create(storage: &Storage, topic: &str, raw_config: Option<&str>) -> Result<()> {
    let run_config = match raw_config {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).map_err(|e| eyre!("--config is not valid JSON: {e}"))?;
            if !value.is_object() {
                return Err(eyre!("--config must be a JSON object"));
            }
            Some(value)
        }
        None => None,
    };

    let run = storage.insert_run(topic, run_config.as_ref()).await?;
    info!(run_id = %run.run_id, topic, "run created");
    println!("{}", run.run_id);
    Ok(())
}

async fn cmd_run_start(storage: &Storage, raw_id: &str) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let run = storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| eyre!("run {run_id} not found"))?;

    let outline = NewJob::new(
        run_id,
        None,
        Stage::Outline,
        json!({ "run_id": run_id, "topic": run.topic }),
    );
    match storage.start_run(&outline).await? {
        Some(job) => {
            info!(%run_id, job_id = %job.job_id, "run started");
            println!("Run {run_id} started (outline job {})", job.job_id);
            Ok(())
        }
        None => Err(eyre!("run {run_id} is {}, only initializing runs can start", run.status)),
    }
}

async fn cmd_run_status(storage: &Storage, raw_id: &str) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let run = storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| eyre!("run {run_id} not found"))?;
    let counts = storage.job_counts(&run_id).await?;
    let nodes = storage.list_outline_nodes(&run_id, None).await?;

    println!();
    println!("  Run:      {}", run.run_id);
    println!("  Topic:    {}", run.topic);
    println!("  Status:   {}", run.status);
    println!("  Nodes:    {}", nodes.len());
    println!(
        "  Jobs:     {} queued, {} running, {} done, {} failed",
        counts.queued, counts.running, counts.done, counts.failed
    );
    println!("  Progress: {:.1}%", counts.progress_percent());

    let failed: Vec<_> = storage
        .list_jobs(&run_id)
        .await?
        .into_iter()
        .filter(|j| j.status == reportflow_shared::JobStatus::Failed)
        .collect();
    for job in failed {
        println!(
            "  Failed:   {} {} {} ({})",
            job.job_id,
            job.stage,
            job.node_id.as_deref().unwrap_or("-"),
            job.last_error.as_deref().unwrap_or("no error recorded")
        );
    }
    println!();
    Ok(())
}

async fn cmd_run_list(storage: &Storage) -> Result<()> {
    let runs = storage.list_runs().await?;
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<12}  {}  {}",
            run.run_id,
            run.status.as_str(),
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.topic
        );
    }
    Ok(())
}

async fn cmd_run_delete(storage: &Storage, raw_id: &str) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    if !storage.delete_run(&run_id).await? {
        return Err(eyre!("run {run_id} not found"));
    }
    println!("Deleted run {run_id}");
    Ok(())
}

async fn cmd_run_results(storage: &Storage, raw_id: &str, node_id: &str) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let results = storage.list_retrieval_results(&run_id, node_id).await?;
    if results.is_empty() {
        println!("No results for node {node_id}.");
        return Ok(());
    }

    for result in results {
        let preview = match storage.get_chunk(result.chunk_pk).await? {
            Some(chunk) => preview(&chunk.text),
            None => "<chunk deleted>".to_string(),
        };
        println!(
            "{:>3}  fused={:.4} fts={:.4} vec={:.4}  #{}  {}",
            result.rank, result.fused_score, result.fts_score, result.vec_score, result.chunk_pk, preview
        );
    }
    Ok(())
}

fn preview(text: &str) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() > 80 {
        format!("{}…", line.chars().take(80).collect::<String>())
    } else {
        line
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn cmd_worker(storage: Storage, config: &AppConfig, until_idle: bool) -> Result<()> {
    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(RetrievalAgent::new(
        Arc::new(ranker(config)?),
        config.retrieval.top_k,
    )));
    for (name, command) in &config.agents {
        let stage: Stage = name.parse()?;
        if stage == Stage::Retrieval {
            warn!("bridge configured for retrieval replaces the built-in ranker");
        }
        registry.register(Arc::new(BridgeAgent::new(stage, command)));
    }

    let missing: Vec<_> = Stage::ALL
        .into_iter()
        .filter(|s| !registry.stages().contains(s))
        .collect();
    if !missing.is_empty() {
        warn!(?missing, "no agent for some stages, their jobs will fail");
    }

    let worker = Worker::new(
        storage,
        registry,
        JobQueue::from(&config.worker),
        StageGraph::new(config.worker.exclusive_assembler),
        Duration::from_secs(config.worker.poll_interval_secs),
    );

    if until_idle {
        let outcomes = worker.drain().await?;
        let done = outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Done { .. }))
            .count();
        let requeued = outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Requeued { .. }))
            .count();
        let failed = outcomes.len() - done - requeued;
        println!("Processed {} jobs: {done} done, {requeued} requeued, {failed} failed", outcomes.len());
        return Ok(());
    }

    let (handle, signal) = stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current job");
            handle.stop();
        }
    });
    worker.run(signal).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Search and jobs
// ---------------------------------------------------------------------------

async fn cmd_search(
    storage: &Storage,
    config: &AppConfig,
    query: &str,
    exclude: &[String],
    top_k: Option<usize>,
) -> Result<()> {
    let ranker = ranker(config)?;
    let top_k = top_k.unwrap_or(config.retrieval.top_k);
    let results = ranker.rank(storage, query, exclude, top_k).await?;

    if results.is_empty() {
        println!("No matching chunks.");
        return Ok(());
    }
    for chunk in results {
        println!(
            "{:>3}  fused={:.4}  doc={}  #{}  {}",
            chunk.rank,
            chunk.fused_score,
            chunk.doc_id,
            chunk.chunk_pk,
            preview(&chunk.text)
        );
    }
    Ok(())
}

async fn cmd_job_retry(storage: &Storage, job_id: &str) -> Result<()> {
    let job = storage.retry_failed(job_id).await?;
    info!(failed = job_id, job_id = %job.job_id, stage = %job.stage, "job re-enqueued");
    println!("Enqueued {} ({}) as a retry of {job_id}", job.job_id, job.stage);
    Ok(())
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

async fn cmd_doc_add(
    storage: &Storage,
    config: &AppConfig,
    file: &Path,
    title: String,
    author: Option<String>,
    year: Option<i64>,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    let doc = NewDocument {
        title,
        author,
        year,
        content,
    };

    let embedder = OllamaEmbedder::new(&config.embeddings)?;
    let progress = spinner(&format!("Embedding {}", file.display()))?;
    let outcome = ingest_document(storage, &embedder, &doc, &config.ingest).await;
    progress.finish_and_clear();
    let outcome = outcome?;

    if outcome.existed {
        println!("Already stored as {} ({} chunks)", outcome.doc_id, outcome.chunk_count);
    } else {
        println!("Stored {} ({} chunks)", outcome.doc_id, outcome.chunk_count);
    }
    Ok(())
}

async fn cmd_doc_list(storage: &Storage) -> Result<()> {
    let docs = storage.list_documents().await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in docs {
        println!(
            "{}  {:>4} chunks  {}{}",
            doc.doc_id,
            doc.chunk_count,
            doc.title,
            doc.year.map(|y| format!(" ({y})")).unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_doc_delete(storage: &Storage, doc_id: &str) -> Result<()> {
    if !storage.delete_document(doc_id).await? {
        return Err(eyre!("document {doc_id} not found"));
    }
    println!("Deleted document {doc_id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
