//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Report, Result, eyre};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ledgerflow_changes::batch::{BatchDecision, check_batch};
use ledgerflow_core::{
    BridgeCollaborator, BridgeConfig, ExecutionDriver, FeedOptions, HttpWorkflowClient,
    LocalWorkflowClient, PipelineContext, RunOptions, StageReport, WorkflowClient, run_feed,
    run_ingest, run_monitor, run_pipeline, run_score, run_transform,
};
use ledgerflow_objects::{FsObjectStore, ObjectStore};
use ledgerflow_shared::{
    AppConfig, ErrorPayload, LedgerflowError, PollPolicy, Stage, init_config, load_config,
    validate_config,
};
use ledgerflow_storage::{EnvSecrets, LedgerStore};

use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ledgerflow: idempotent, ledger-backed observation pipeline.
#[derive(Parser)]
#[command(
    name = "ledgerflow",
    version,
    about = "Run and drive an idempotent multi-stage observation pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Register new raw inputs in the ledger.
    Ingest,

    /// Derive features for every ingested unit without a transformed artifact.
    Transform {
        /// Reprocess units that already have an output.
        #[arg(long)]
        force: bool,
    },

    /// Score every transformed unit without predictions.
    Score {
        /// Reprocess units that already have an output.
        #[arg(long)]
        force: bool,
    },

    /// Compute drift metrics for scored outputs not yet observed.
    Monitor,

    /// Run ingest, transform, score and monitor in order.
    Pipeline,

    /// Start one workflow execution and wait for it to finish.
    Run {
        /// Execution input as JSON (defaults to the configured data bucket).
        #[arg(long)]
        input: Option<String>,
    },

    /// Upload local data files one per day and run the workflow after each.
    Feed {
        /// Directory holding the data files.
        dir: PathBuf,

        /// Date used for the first upload.
        #[arg(long, default_value = "2024-08-07")]
        start_date: NaiveDate,

        /// Number of files (days) to feed.
        #[arg(long, default_value_t = 5)]
        days: usize,

        /// Seconds to wait between runs.
        #[arg(long, default_value_t = 20)]
        interval_secs: u64,
    },

    /// Check whether a local batch changed since it was last processed.
    Batch {
        /// Directory holding the batch files.
        dir: PathBuf,

        /// Treat the batch as changed regardless of the hash record.
        #[arg(long)]
        force: bool,
    },

    /// Summarise ledger and metrics state.
    Status,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
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

/// Initialize tracing based on CLI flags. Logs go to stderr; stdout carries
/// the JSON reports.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "ledgerflow=info",
        1 => "ledgerflow=debug",
        _ => "ledgerflow=trace",
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
    match cli.command {
        Command::Ingest => cmd_stage(Stage::Ingest, false).await,
        Command::Transform { force } => cmd_stage(Stage::Transform, force).await,
        Command::Score { force } => cmd_stage(Stage::Score, force).await,
        Command::Monitor => cmd_stage(Stage::Monitor, false).await,
        Command::Pipeline => cmd_pipeline().await,
        Command::Run { input } => cmd_run(input.as_deref()).await,
        Command::Feed {
            dir,
            start_date,
            days,
            interval_secs,
        } => cmd_feed(dir, start_date, days, interval_secs).await,
        Command::Batch { dir, force } => cmd_batch(&dir, force),
        Command::Status => cmd_status().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_payload(payload: &ErrorPayload) {
    match serde_json::to_string(payload) {
        Ok(line) => eprintln!("{line}"),
        Err(_) => eprintln!("{}", payload.message),
    }
}

/// Emit the structured payload on stderr and wrap the error for color-eyre.
fn fail(err: LedgerflowError) -> Report {
    print_payload(&err.to_payload());
    Report::new(err)
}

fn check_units(reports: &[StageReport]) -> Result<()> {
    let payloads: Vec<ErrorPayload> = reports.iter().filter_map(StageReport::failure_payload).collect();
    if payloads.is_empty() {
        return Ok(());
    }
    for payload in &payloads {
        print_payload(payload);
    }
    let failed: usize = payloads.iter().map(|p| p.units.len()).sum();
    Err(eyre!("{failed} units failed"))
}

fn load_checked_config() -> Result<AppConfig> {
    let config = load_config().map_err(fail)?;
    validate_config(&config).map_err(fail)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// Process-wide clients, built once and passed to every stage.
struct Clients {
    config: AppConfig,
    objects: Arc<FsObjectStore>,
    ledger: Arc<LedgerStore>,
    bridge: Arc<BridgeCollaborator>,
}

impl Clients {
    async fn connect(config: AppConfig) -> Result<Self> {
        let objects = Arc::new(FsObjectStore::new(&config.objects.root));
        let ledger = Arc::new(
            LedgerStore::connect_with(&EnvSecrets, &config.ledger)
                .await
                .map_err(fail)?,
        );
        let bridge = Arc::new(BridgeCollaborator::new(BridgeConfig::from(
            &config.collaborators,
        )));
        info!(
            objects = %config.objects.root,
            ledger = ledger.location(),
            bucket = %config.objects.data_bucket,
            "clients ready"
        );
        Ok(Self {
            config,
            objects,
            ledger,
            bridge,
        })
    }

    fn context(&self) -> PipelineContext {
        PipelineContext::new(
            &self.config,
            self.objects.clone(),
            self.ledger.clone(),
            self.bridge.clone(),
        )
    }

    async fn shutdown(&self) {
        self.bridge.shutdown().await;
    }
}

/// Cancellation token fired by Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            child.cancel();
        }
    });
    token
}

/// HTTP orchestrator when an endpoint is configured, the in-process engine
/// otherwise. The returned clients must be shut down by the caller.
async fn workflow_client(
    config: &AppConfig,
) -> Result<(Arc<dyn WorkflowClient>, Option<Clients>)> {
    match &config.driver.endpoint {
        Some(endpoint) => {
            info!(%endpoint, "using remote orchestrator");
            let client = HttpWorkflowClient::new(endpoint).map_err(fail)?;
            Ok((Arc::new(client), None))
        }
        None => {
            info!("no orchestrator endpoint configured, using local engine");
            let clients = Clients::connect(config.clone()).await?;
            let client = LocalWorkflowClient::new(clients.context(), &config.driver.workflow_name);
            Ok((Arc::new(client), Some(clients)))
        }
    }
}

// ---------------------------------------------------------------------------
// Stage commands
// ---------------------------------------------------------------------------

async fn cmd_stage(stage: Stage, force: bool) -> Result<()> {
    let clients = Clients::connect(load_checked_config()?).await?;
    let ctx = clients.context();
    let opts = RunOptions { force };

    info!(%stage, force, "running stage");
    let progress = CliProgress::new();
    let result = match stage {
        Stage::Ingest => run_ingest(&ctx, &progress).await,
        Stage::Transform => run_transform(&ctx, opts, &progress).await,
        Stage::Score => run_score(&ctx, opts, &progress).await,
        Stage::Monitor => run_monitor(&ctx, &progress).await,
    };
    progress.finish();
    clients.shutdown().await;

    let report = result.map_err(fail)?;
    print_json(&report)?;
    check_units(std::slice::from_ref(&report))
}

async fn cmd_pipeline() -> Result<()> {
    let clients = Clients::connect(load_checked_config()?).await?;
    let ctx = clients.context();

    let progress = CliProgress::new();
    let result = run_pipeline(&ctx, RunOptions::default(), &progress).await;
    progress.finish();
    clients.shutdown().await;

    let report = result.map_err(fail)?;
    print_json(&report)?;
    check_units(&report.stages)
}

// ---------------------------------------------------------------------------
// Execution driver commands
// ---------------------------------------------------------------------------

async fn cmd_run(input: Option<&str>) -> Result<()> {
    let config = load_checked_config()?;
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).map_err(|e| eyre!("invalid --input JSON: {e}"))?,
        None => json!({ "data_bucket_name": config.objects.data_bucket }),
    };

    let (client, clients) = workflow_client(&config).await?;
    let driver = ExecutionDriver::new(client, PollPolicy::from(&config));
    let cancel = cancel_on_interrupt();

    let result = driver
        .run_named(&config.driver.workflow_name, &input, &cancel)
        .await;
    if let Some(clients) = clients {
        clients.shutdown().await;
    }

    let outcome = result.map_err(fail)?;
    print_json(&outcome)
}

async fn cmd_feed(dir: PathBuf, start_date: NaiveDate, days: usize, interval_secs: u64) -> Result<()> {
    let config = load_checked_config()?;
    let (client, clients) = workflow_client(&config).await?;
    let objects: Arc<dyn ObjectStore> = match &clients {
        Some(clients) => clients.objects.clone(),
        None => Arc::new(FsObjectStore::new(&config.objects.root)),
    };

    let opts = FeedOptions {
        data_dir: dir,
        file_prefix: config.batch.file_prefix.clone(),
        start_date,
        limit: Some(days),
        settle: Duration::from_secs(1),
        interval: Duration::from_secs(interval_secs),
    };
    info!(
        dir = %opts.data_dir.display(),
        %start_date,
        days,
        interval_secs,
        "starting feed"
    );

    let driver = ExecutionDriver::new(client, PollPolicy::from(&config));
    let cancel = cancel_on_interrupt();
    let result = run_feed(
        objects,
        &config.objects.data_bucket,
        &driver,
        &config.driver.workflow_name,
        &opts,
        &cancel,
    )
    .await;
    if let Some(clients) = clients {
        clients.shutdown().await;
    }

    let report = result.map_err(fail)?;
    print_json(&report)?;
    match report.runs.last() {
        Some(last) if report.stopped_early || last.error.is_some() => {
            Err(eyre!("feed stopped after {} with status {}", last.key, last.status))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Batch, status and config
// ---------------------------------------------------------------------------

fn cmd_batch(dir: &std::path::Path, force: bool) -> Result<()> {
    let config = load_config().map_err(fail)?;
    let check = check_batch(dir, &config.batch.hash_file, &config.batch.file_prefix, force)
        .map_err(fail)?;

    let (decision, changed) = match &check.decision {
        BatchDecision::FirstRun => ("first_run", json!([])),
        BatchDecision::Forced => ("forced", json!([])),
        BatchDecision::Changed(diff) => (
            "changed",
            json!({ "new": diff.new_units, "changed": diff.changed_units, "removed": diff.removed_units }),
        ),
        BatchDecision::Unchanged => ("unchanged", json!([])),
    };
    print_json(&json!({
        "decision": decision,
        "process": check.decision.should_process(),
        "units": check.current.len(),
        "diff": changed,
        "hash_file": check.hash_file.display().to_string(),
    }))
}

async fn cmd_status() -> Result<()> {
    let config = load_config().map_err(fail)?;
    let ledger = LedgerStore::connect_with(&EnvSecrets, &config.ledger)
        .await
        .map_err(fail)?;
    let status = ledger.status().await.map_err(fail)?;
    let schema = ledger.schema_version().await.map_err(fail)?;

    print_json(&json!({
        "ledger": ledger.location(),
        "schema_version": schema,
        "counts": status,
    }))
}

fn cmd_config_init() -> Result<()> {
    let path = init_config().map_err(fail)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config().map_err(fail)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
