//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{load_bugs, BatchRunner, BatchSummary};
use crate::config::RepairConfig;
use crate::controller::IterationController;
use crate::index::IndexBuilder;
use crate::llm::litellm::DEFAULT_MODEL;
use crate::llm::{LiteLlmClient, LlmProvider};
use crate::oracle::{BugInstance, CommandOracle, CommandOracleConfig};
use crate::policy::{load_variant, GatePolicy};
use crate::recorder::{JsonlResultStore, MemoryResultStore, ResultStore};

/// Gated, iterative LLM program repair over benchmark bugs.
#[derive(Parser)]
#[command(name = "gated-repair")]
#[command(about = "Run gated LLM program-repair experiments against benchmark bugs")]
#[command(version)]
#[command(
    long_about = "gated-repair drives an LLM through localize / patch / validate iterations on a benchmark bug.\n\nOptional gates (TDD, index retrieval, compile) are selected per variant.\n\nExample usage:\n  gated-repair repair --benchmark defects4j --project Lang --bug 1 --workdir /tmp/Lang-1 --variant G5 --oracle d4j.yaml"
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
    /// Repair a single bug.
    Repair(RepairArgs),

    /// Repair every bug in a bug list.
    Batch(BatchArgs),

    /// Build (or reuse) the retrieval index for a working copy.
    Index(IndexArgs),

    /// Print the gate-policy presets as JSON.
    Variants(VariantsArgs),
}

/// Options shared by `repair` and `batch`.
#[derive(Args, Debug, Clone)]
pub struct RunOptions {
    /// Gate-policy variant (G0, G1, G2, G3, G5, an alias, or custom:<flags>).
    #[arg(short = 'v', long, default_value = "G5")]
    pub variant: String,

    /// Patch attempts per bug; 0 only runs the oracle checks.
    #[arg(long)]
    pub max_iters: Option<u32>,

    /// Model passed to the LLM endpoint.
    #[arg(short = 'm', long, env = "LITELLM_DEFAULT_MODEL")]
    pub model: Option<String>,

    /// Oracle command file (YAML).
    #[arg(long)]
    pub oracle: PathBuf,

    /// Repair configuration file (YAML).
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Directory with on-disk variant definitions.
    #[arg(long)]
    pub variants_dir: Option<PathBuf>,

    /// Where outcome JSONL files are appended.
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Where retrieval indexes are cached.
    #[arg(long)]
    pub index_dir: Option<PathBuf>,

    /// Deadline for a whole bug run, in seconds.
    #[arg(long)]
    pub run_timeout: Option<u64>,

    /// Do not append outcomes to the results directory.
    #[arg(long)]
    pub no_record: bool,

    /// LLM endpoint base URL.
    #[arg(long, env = "LITELLM_API_BASE")]
    pub api_base: Option<String>,

    /// LLM endpoint API key.
    #[arg(long, env = "LITELLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `gated-repair repair`.
#[derive(Args, Debug)]
pub struct RepairArgs {
    #[arg(long)]
    pub benchmark: String,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub bug: String,

    /// Working copy for this bug.
    #[arg(short = 'w', long)]
    pub workdir: PathBuf,

    /// Revision used to key the index (defaults to the bug id).
    #[arg(long)]
    pub revision: Option<String>,

    /// Source language for the index (defaults to the configured one).
    #[arg(long)]
    pub language: Option<String>,

    /// Known failing test; repeat for several.
    #[arg(long = "trigger-test")]
    pub trigger_tests: Vec<String>,

    #[command(flatten)]
    pub options: RunOptions,
}

/// Arguments for `gated-repair batch`.
#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Bug list (YAML/JSON list or JSONL).
    #[arg(long)]
    pub bugs: PathBuf,

    /// Bugs repaired concurrently.
    #[arg(short = 'p', long, default_value = "1")]
    pub parallel: usize,

    #[command(flatten)]
    pub options: RunOptions,
}

/// Arguments for `gated-repair index`.
#[derive(Args, Debug)]
pub struct IndexArgs {
    #[arg(short = 'w', long)]
    pub workdir: PathBuf,

    #[arg(long)]
    pub benchmark: String,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub revision: String,

    #[arg(long, default_value = "java")]
    pub language: String,

    #[arg(long, default_value = "./indexes")]
    pub index_dir: PathBuf,

    /// Rebuild even when a cached index exists.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for `gated-repair variants`.
#[derive(Args, Debug)]
pub struct VariantsArgs {
    /// Also resolve this variant (preset, alias, custom or on-disk).
    #[arg(long)]
    pub resolve: Option<String>,

    #[arg(long)]
    pub variants_dir: Option<PathBuf>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to read the log level before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse the arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Repair(args) => run_repair_command(args).await,
        Commands::Batch(args) => run_batch_command(args).await,
        Commands::Index(args) => run_index_command(args).await,
        Commands::Variants(args) => run_variants_command(args),
    }
}

fn load_config(options: &RunOptions) -> anyhow::Result<RepairConfig> {
    let mut config = match &options.config {
        Some(path) => RepairConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RepairConfig::default(),
    };
    if let Some(max_iters) = options.max_iters {
        config.max_iters = max_iters;
    }
    if let Some(model) = &options.model {
        config.model = model.clone();
    }
    if let Some(dir) = &options.results_dir {
        config.results_dir = dir.clone();
    }
    if let Some(dir) = &options.index_dir {
        config.index_dir = dir.clone();
    }
    if let Some(secs) = options.run_timeout {
        config.run_timeout_secs = Some(secs);
    }
    config.validate()?;
    Ok(config)
}

fn build_llm_client(options: &RunOptions, config: &RepairConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let api_base = options.api_base.clone().ok_or_else(|| {
        anyhow::anyhow!("No LLM endpoint: pass --api-base or set LITELLM_API_BASE")
    })?;
    let default_model = if config.model.is_empty() {
        DEFAULT_MODEL.to_string()
    } else {
        config.model.clone()
    };
    info!(api_base = %api_base, model = %default_model, "Using LiteLLM endpoint");
    Ok(Arc::new(LiteLlmClient::new(api_base, options.api_key.clone(), default_model)?))
}

fn build_controller(options: &RunOptions) -> anyhow::Result<IterationController> {
    let config = load_config(options)?;
    let variant = load_variant(&options.variant, options.variants_dir.as_deref())?;
    let oracle_config = CommandOracleConfig::from_yaml_file(&options.oracle)
        .with_context(|| format!("loading oracle config {}", options.oracle.display()))?;
    oracle_config.check_policy(&variant.policy)?;
    let oracle = CommandOracle::new(oracle_config)?;
    let llm = build_llm_client(options, &config)?;

    let store: Arc<dyn ResultStore> = if options.no_record {
        Arc::new(MemoryResultStore::new())
    } else {
        Arc::new(JsonlResultStore::new(config.results_dir.clone()))
    };

    info!(
        variant = %variant.name,
        policy = %variant.policy,
        max_iters = config.max_iters,
        "Controller configured"
    );
    Ok(IterationController::new(config, variant, Arc::new(oracle), llm).with_store(store))
}

/// Cancel the controller's runs on Ctrl-C.
fn install_ctrl_c(controller: &IterationController) {
    let cancel = controller.cancel_flag().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling after the current step");
            cancel.cancel();
        }
    });
}

async fn run_repair_command(args: RepairArgs) -> anyhow::Result<()> {
    let controller = build_controller(&args.options)?;
    install_ctrl_c(&controller);

    let mut bug = BugInstance::new(args.benchmark, args.project, args.bug, args.workdir)
        .with_trigger_tests(args.trigger_tests);
    if let Some(revision) = args.revision {
        bug = bug.with_revision(revision);
    }
    if let Some(language) = args.language {
        bug = bug.with_language(language);
    }

    let outcome = controller.run(&bug).await;
    if args.options.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.summary());
        if let Some(patch) = &outcome.final_patch {
            println!("\n{patch}");
        }
        if let Some(error) = &outcome.error {
            println!("error: {error}");
        }
        if let Some(reason) = &outcome.stop_reason {
            println!("stopped early: {reason}");
        }
    }
    Ok(())
}

async fn run_batch_command(args: BatchArgs) -> anyhow::Result<()> {
    let bugs = load_bugs(&args.bugs)
        .with_context(|| format!("loading bug list {}", args.bugs.display()))?;
    let controller = build_controller(&args.options)?;
    install_ctrl_c(&controller);

    info!(bugs = bugs.len(), parallel = args.parallel, "Starting batch");
    let outcomes = BatchRunner::new(controller, args.parallel).run(bugs).await;
    let summary = BatchSummary::from_outcomes(&outcomes);

    if args.options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for outcome in &outcomes {
            println!("{}", outcome.summary());
        }
        println!("\nfixed {}/{}", summary.fixed, summary.total);
        for (verdict, count) in &summary.by_verdict {
            println!("  {verdict:<22} {count}");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct IndexOutput<'a> {
    path: &'a Path,
    cached: bool,
    content_hash: &'a str,
    files: usize,
    symbols: usize,
    references: usize,
}

async fn run_index_command(args: IndexArgs) -> anyhow::Result<()> {
    let builder = IndexBuilder::new(args.index_dir);
    let handle = tokio::task::spawn_blocking(move || {
        builder.build(
            &args.workdir,
            &args.benchmark,
            &args.project,
            &args.revision,
            &args.language,
            args.force,
        )
    })
    .await??;

    let output = IndexOutput {
        path: &handle.path,
        cached: handle.cached,
        content_hash: handle.content_hash(),
        files: handle.index.file_spans.len(),
        symbols: handle.index.symbol_count(),
        references: handle.index.references.len(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct PresetOutput {
    name: &'static str,
    alias: &'static str,
    policy: GatePolicy,
}

fn run_variants_command(args: VariantsArgs) -> anyhow::Result<()> {
    if let Some(name) = args.resolve {
        let variant = load_variant(&name, args.variants_dir.as_deref())?;
        println!("{}", serde_json::to_string_pretty(&variant)?);
        return Ok(());
    }
    let presets: Vec<PresetOutput> = GatePolicy::presets()
        .into_iter()
        .map(|(name, alias, policy)| PresetOutput {
            name,
            alias,
            policy,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&presets)?);
    Ok(())
}
