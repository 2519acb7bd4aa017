//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use enrichkit_core::{
    BatchReport, Pipeline, PipelineContext, ProgressReporter, drain_stack, import_file,
};
use enrichkit_shared::{
    AppConfig, BatchCounts, LookupKind, PipelineConfig, RecordId, RecordStatus, database_path,
    init_config, load_config, load_config_from,
};
use enrichkit_sources::AdapterRegistry;
use enrichkit_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// enrichkit: enrich contact records with resumable batch lookups.
#[derive(Parser)]
#[command(
    name = "enrichkit",
    version,
    about = "Enrich contact records through rate-limited, cached, resumable batch lookups.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.enrichkit/enrichkit.toml).
    #[arg(long, env = "ENRICHKIT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the config.
    #[arg(long, env = "ENRICHKIT_DB", global = true)]
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
    /// Seed a batch from a JSON-lines export.
    Import {
        /// JSON-lines file, one subscriber per line.
        file: PathBuf,

        /// Batch to import into.
        #[arg(short, long)]
        batch: String,

        /// Lookup kind the records are meant for.
        #[arg(short, long, default_value = "linkedin-search")]
        kind: LookupKind,
    },

    /// Process the pending records of a batch.
    Run {
        /// Batch to process.
        #[arg(short, long)]
        batch: String,

        /// Lookup kind to run.
        #[arg(short, long, default_value = "linkedin-search")]
        kind: LookupKind,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Show batch progress and recent runs.
    Status {
        /// Only this batch (defaults to every batch).
        #[arg(short, long)]
        batch: Option<String>,

        /// Recent runs to list.
        #[arg(long, default_value = "5")]
        runs: u32,
    },

    /// Move discovered URLs off the work stack into a new batch and run it.
    Drain {
        /// Batch the stack items are staged into.
        #[arg(short, long)]
        batch: String,

        /// Lookup kind for the staged records.
        #[arg(short, long, default_value = "profile-page")]
        kind: LookupKind,

        /// Items to take off the stack (defaults to `[stack] drain_size`).
        #[arg(short, long)]
        limit: Option<u32>,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Move terminal records back to pending.
    Reset {
        /// Batch to reset in.
        #[arg(short, long)]
        batch: String,

        /// One record; without it every permanently failed record is reset.
        #[arg(short, long)]
        record: Option<String>,
    },

    /// Inspect the work stack.
    Stack {
        #[command(subcommand)]
        action: StackAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Per-run overrides of the config file.
#[derive(clap::Args, Clone, Debug, Default)]
pub(crate) struct Tuning {
    /// Worker pool size.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Retries after the first attempt for transient failures.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-lookup timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Skip the database lookup cache.
    #[arg(long)]
    no_persistent_cache: bool,
}

impl Tuning {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(ms) = self.timeout_ms {
            config.lookup_timeout = Duration::from_millis(ms);
        }
        if self.no_persistent_cache {
            config.persistent_cache = false;
        }
    }
}

/// Stack subcommands.
#[derive(Subcommand)]
pub(crate) enum StackAction {
    /// Unconsumed items and all URLs ever seen.
    Size,
    /// Show the next items a drain would take.
    Peek {
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
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
        0 => "enrichkit=info",
        1 => "enrichkit=debug",
        _ => "enrichkit=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()).await,
        };
    }

    let env = Env::load(cli.config.as_deref(), cli.db.as_deref())?;
    match cli.command {
        Command::Import { file, batch, kind } => cmd_import(&env, &file, &batch, kind).await,
        Command::Run {
            batch,
            kind,
            tuning,
        } => cmd_run(&env, &batch, kind, &tuning).await,
        Command::Status { batch, runs } => cmd_status(&env, batch.as_deref(), runs).await,
        Command::Drain {
            batch,
            kind,
            limit,
            tuning,
        } => cmd_drain(&env, &batch, kind, limit, &tuning).await,
        Command::Reset { batch, record } => cmd_reset(&env, &batch, record.as_deref()).await,
        Command::Stack { action } => cmd_stack(&env, action).await,
        Command::Config { .. } => Ok(()),
    }
}

/// Resolved config and database location.
struct Env {
    config: AppConfig,
    db_path: PathBuf,
}

impl Env {
    fn load(config_path: Option<&Path>, db: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let db_path = match db {
            Some(path) => path.to_path_buf(),
            None => database_path(&config)?,
        };
        Ok(Self { config, db_path })
    }

    async fn open(&self) -> Result<Storage> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("cannot create {}: {e}", parent.display()))?;
        }
        Ok(Storage::open(&self.db_path).await?)
    }

    async fn open_readonly(&self) -> Result<Storage> {
        Storage::open_readonly(&self.db_path).await.map_err(|e| {
            eyre!(
                "cannot open database at {}: {e} (run `enrichkit import` first)",
                self.db_path.display()
            )
        })
    }

    async fn context(&self, tuning: &Tuning) -> Result<Arc<PipelineContext>> {
        let storage = Arc::new(self.open().await?);
        let registry = AdapterRegistry::from_config(&self.config)?;
        let mut pipeline_config = PipelineConfig::from(&self.config);
        tuning.apply(&mut pipeline_config);
        Ok(Arc::new(PipelineContext::new(
            storage,
            registry,
            pipeline_config,
        )))
    }
}

/// Trigger the context's stop signal on Ctrl-C.
fn stop_on_ctrl_c(ctx: &PipelineContext) {
    let stop = ctx.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight lookups finish");
            stop.trigger();
        }
    });
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_import(env: &Env, file: &Path, batch: &str, kind: LookupKind) -> Result<()> {
    let storage = env.open().await?;
    info!(file = %file.display(), batch, %kind, "importing records");
    let report = import_file(&storage, batch, kind, file).await?;

    println!();
    println!("  Imported into batch '{batch}'");
    println!("  Read:     {}", report.read);
    println!("  Created:  {}", report.created);
    println!("  Existing: {}", report.existing);
    println!("  Invalid:  {}", report.invalid);
    println!();
    Ok(())
}

async fn cmd_run(env: &Env, batch: &str, kind: LookupKind, tuning: &Tuning) -> Result<()> {
    let ctx = env.context(tuning).await?;
    stop_on_ctrl_c(&ctx);

    let progress = Arc::new(CliProgress::new());
    let report = Pipeline::new(ctx, kind)
        .with_progress(progress)
        .run(batch)
        .await?;

    print_report(&report);
    Ok(())
}

async fn cmd_drain(
    env: &Env,
    batch: &str,
    kind: LookupKind,
    limit: Option<u32>,
    tuning: &Tuning,
) -> Result<()> {
    let ctx = env.context(tuning).await?;
    stop_on_ctrl_c(&ctx);
    let limit = limit.unwrap_or(env.config.stack.drain_size);

    let progress: Arc<dyn ProgressReporter> = Arc::new(CliProgress::new());
    let drained = drain_stack(ctx, batch, kind, limit, Some(progress)).await?;

    println!();
    println!("  Staged from stack: {}", drained.staged);
    print_report(&drained.batch);
    Ok(())
}

async fn cmd_status(env: &Env, batch: Option<&str>, runs: u32) -> Result<()> {
    let storage = env.open_readonly().await?;
    let batches = match batch {
        Some(b) => vec![b.to_string()],
        None => storage.list_batches().await?,
    };

    if batches.is_empty() {
        println!("No batches yet.");
        return Ok(());
    }

    println!();
    println!(
        "  {:<24} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9}",
        "BATCH", "TOTAL", "PENDING", "RETRYING", "SUCCEEDED", "FAILED", "EXHAUSTED"
    );
    for batch_id in &batches {
        let c = storage.batch_counts(batch_id).await?;
        println!(
            "  {:<24} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9}",
            batch_id,
            c.total(),
            c.pending + c.in_progress,
            c.failed_retrying,
            c.succeeded,
            c.failed_permanently,
            c.failed_exhausted
        );
    }

    let recent = storage.list_runs(batch, runs).await?;
    if !recent.is_empty() {
        println!();
        println!("  Recent runs:");
        for run in recent {
            let finished = run
                .finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "  {}  {:<16} {:<16} {:<12} started {}  finished {}",
                run.id,
                run.batch_id,
                run.kind.as_str(),
                run.status.as_str(),
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                finished
            );
        }
    }

    let stack = &env.config.stack.name;
    println!();
    println!(
        "  Stack '{stack}': {} waiting, {} seen",
        storage.stack_size(stack).await?,
        storage.stack_seen(stack).await?
    );
    println!();
    Ok(())
}

async fn cmd_reset(env: &Env, batch: &str, record: Option<&str>) -> Result<()> {
    let storage = env.open().await?;
    match record {
        Some(id) => {
            let record_id = RecordId::from(id);
            let reset = storage
                .reset_state(batch, &record_id)
                .await?
                .ok_or_else(|| eyre!("no record '{id}' in batch '{batch}'"))?;
            info!(batch, record_id = %reset.record_id, "record reset");
            println!("Record '{id}' reset to pending.");
        }
        None => {
            let n = storage.reset_failed(batch).await?;
            info!(batch, reset = n, "failed records reset");
            println!("{n} failed record(s) in '{batch}' reset to pending.");
        }
    }
    Ok(())
}

async fn cmd_stack(env: &Env, action: StackAction) -> Result<()> {
    let storage = env.open_readonly().await?;
    let stack = &env.config.stack.name;
    match action {
        StackAction::Size => {
            println!(
                "{} waiting, {} seen",
                storage.stack_size(stack).await?,
                storage.stack_seen(stack).await?
            );
        }
        StackAction::Peek { limit } => {
            let items = storage.peek_stack_many(stack, limit).await?;
            if items.is_empty() {
                println!("Stack '{stack}' is empty.");
            }
            for item in items {
                println!(
                    "{}  (from {}/{}, {})",
                    item.url,
                    item.batch_id,
                    item.record_id,
                    item.pushed_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config: AppConfig = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_report(report: &BatchReport) {
    let c = &report.counts;
    println!();
    if report.interrupted {
        println!("  Batch '{}' interrupted; run again to resume.", report.batch_id);
    } else {
        println!("  Batch '{}' finished.", report.batch_id);
    }
    println!("  Run:        {}", report.run_id);
    println!("  Succeeded:  {}", c.succeeded);
    println!("  Failed:     {}", c.failed_permanently);
    println!("  Exhausted:  {}", c.failed_exhausted);
    println!("  Pending:    {}", c.pending + c.in_progress + c.failed_retrying);
    println!("  Retries:    {}", report.retries_scheduled);
    println!("  New URLs:   {}", report.stack_pushed);
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    total: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self {
            spinner,
            total: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    fn refresh(&self) {
        self.spinner.set_message(format!(
            "{}/{} done, {} failed, {} retries",
            self.finished.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.retries.load(Ordering::Relaxed),
        ));
    }
}

impl ProgressReporter for CliProgress {
    fn started(&self, batch_id: &str, counts: &BatchCounts) {
        self.total.store(counts.total(), Ordering::Relaxed);
        self.finished.store(counts.finished(), Ordering::Relaxed);
        self.failed.store(counts.failed_terminal(), Ordering::Relaxed);
        self.spinner.println(format!("Processing batch '{batch_id}'"));
        self.refresh();
    }

    fn record_finished(&self, _record_id: &RecordId, status: RecordStatus) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        if status == RecordStatus::FailedPermanently {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.refresh();
    }

    fn retry_scheduled(&self, _record_id: &RecordId, _attempt: u32, _delay: Duration) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.refresh();
    }

    fn done(&self, _report: &BatchReport) {
        self.spinner.finish_and_clear();
    }
}
