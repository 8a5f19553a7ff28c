//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use fieldforge_core::{GridSearch, Pipeline, PipelineStatistics, export};
use fieldforge_providers::ProviderRegistry;
use fieldforge_shared::{
    AppConfig, Dataset, GroupedParams, config_id, content_hash, expand_home, init_config,
    load_config, params_to_json,
};
use fieldforge_storage::{RunRecord, Storage};
use serde_json::Value;
use tracing::info;

use crate::definition::PipelineDefinition;
use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Fieldforge: enrich tabular data with language models.
#[derive(Parser)]
#[command(
    name = "fieldforge",
    version,
    about = "Enrich CSV data with LLM-derived fields and tune the pipeline that produces them.",
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
    /// Run a pipeline once over a CSV and export the enriched rows.
    Run {
        /// Pipeline definition (TOML).
        pipeline: PathBuf,

        /// Input CSV (overrides `input` in the definition).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output CSV (defaults to <output_dir>/<experiment>-<config id>.csv).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Experiment name (defaults to the definition's name).
        #[arg(short, long)]
        experiment: Option<String>,

        /// Do not record the run in the experiment log.
        #[arg(long)]
        no_log: bool,
    },

    /// Sweep the definition's `[grid]` and report the best configuration.
    Grid {
        /// Pipeline definition (TOML) with a `[grid.<step>]` table.
        pipeline: PathBuf,

        /// Input CSV (overrides `input` in the definition).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Directory for per-configuration CSVs and `summary.csv`.
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Experiment name (defaults to the definition's name).
        #[arg(short, long)]
        experiment: Option<String>,

        /// Do not record runs in the experiment log.
        #[arg(long)]
        no_log: bool,
    },

    /// Inspect the experiment log.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Experiment log subcommands.
#[derive(Subcommand)]
pub(crate) enum RunsAction {
    /// List recorded runs, newest first.
    List {
        /// Only runs of this experiment.
        #[arg(short, long)]
        experiment: Option<String>,

        /// Maximum number of runs to show.
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
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
        0 => "fieldforge=info",
        1 => "fieldforge=debug",
        _ => "fieldforge=trace",
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
        Command::Run {
            pipeline,
            input,
            out,
            experiment,
            no_log,
        } => cmd_run(&pipeline, input, out, experiment, no_log).await,
        Command::Grid {
            pipeline,
            input,
            out_dir,
            experiment,
            no_log,
        } => cmd_grid(&pipeline, input, out_dir, experiment, no_log).await,
        Command::Runs { action } => match action {
            RunsAction::List {
                experiment,
                limit,
                json,
            } => cmd_runs_list(experiment.as_deref(), limit, json).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// Everything a `run` or `grid` invocation needs before touching data.
struct Session {
    config: AppConfig,
    definition: PipelineDefinition,
    experiment: String,
    data: Dataset,
    progress: Arc<CliProgress>,
}

impl Session {
    fn open(pipeline: &Path, input: Option<PathBuf>, experiment: Option<String>) -> Result<Self> {
        let config = load_config()?;
        let definition = PipelineDefinition::load(pipeline)?;
        let experiment = experiment.unwrap_or_else(|| definition.experiment_name());

        let input = input.or_else(|| definition.input_path()).ok_or_else(|| {
            eyre!("no input CSV: pass --input or set `input` in {}", pipeline.display())
        })?;
        let data = export::read_dataset(&input)?;
        if data.is_empty() {
            return Err(eyre!("{} has no rows", input.display()));
        }
        info!(input = %input.display(), rows = data.len(), experiment = %experiment, "dataset loaded");

        Ok(Self {
            config,
            definition,
            experiment,
            data,
            progress: Arc::new(CliProgress::new()),
        })
    }

    fn pipeline(&self) -> Result<Pipeline> {
        let registry = Arc::new(ProviderRegistry::from_config(&self.config)?);
        let progress: Arc<dyn fieldforge_core::ProgressReporter> = self.progress.clone();
        Ok(self
            .definition
            .build(&self.config, registry)?
            .with_progress(progress))
    }

    fn output_dir(&self) -> Result<PathBuf> {
        Ok(expand_home(&self.config.defaults.output_dir)?)
    }

    fn dataset_hash(&self) -> String {
        let rows: Vec<Value> = self
            .data
            .records()
            .map(|r| Value::Object(r.clone()))
            .collect();
        content_hash(&Value::Array(rows))
    }

    async fn storage(&self) -> Result<Storage> {
        let path = expand_home(&self.config.defaults.database)?;
        Ok(Storage::open(&path).await?)
    }
}

/// Build the log entry for one finished configuration.
fn run_record(
    experiment_id: &str,
    fingerprint: String,
    params: &GroupedParams,
    statistics: &PipelineStatistics,
    output_path: Option<&Path>,
    dataset_hash: &str,
) -> RunRecord {
    let mut run = RunRecord::new(
        experiment_id,
        config_id(params),
        fingerprint,
        params_to_json(params),
    );
    run.score = statistics.score;
    run.input_tokens = statistics.input_tokens;
    run.output_tokens = statistics.output_tokens;
    run.input_cost = statistics.input_cost;
    run.output_cost = statistics.output_cost;
    run.total_latency = statistics.total_latency;
    run.num_success = statistics.num_success as u64;
    run.num_failure = statistics.num_failure as u64;
    run.output_path = output_path.map(|p| p.display().to_string());
    run.dataset_hash = Some(dataset_hash.to_string());
    run
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    pipeline_path: &Path,
    input: Option<PathBuf>,
    out: Option<PathBuf>,
    experiment: Option<String>,
    no_log: bool,
) -> Result<()> {
    let session = Session::open(pipeline_path, input, experiment)?;
    let mut pipeline = session.pipeline()?;
    let params = pipeline.params();
    let fingerprint = pipeline.fingerprint(true);
    let dataset_hash = session.dataset_hash();

    let storage = if no_log { None } else { Some(session.storage().await?) };
    if let Some(previous) = match &storage {
        Some(s) => s.find_run(&fingerprint).await?,
        None => None,
    } {
        info!(
            run = %previous.id,
            score = ?previous.score,
            at = %previous.created_at,
            "identical pipeline was run before"
        );
    }

    info!(experiment = %session.experiment, steps = pipeline.steps().len(), "running pipeline");
    pipeline.run(session.data.clone()).await?;
    session.progress.finish();

    let out = match out {
        Some(p) => p,
        None => session
            .output_dir()?
            .join(format!("{}-{}.csv", session.experiment, config_id(&params))),
    };
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(data) = pipeline.data() {
        export::write_dataset(data, &out)?;
    }

    if let Some(storage) = &storage {
        let experiment_id = storage
            .ensure_experiment(&session.experiment, &pipeline.fingerprint(false))
            .await?;
        let run = run_record(
            &experiment_id,
            fingerprint,
            &params,
            pipeline.statistics(),
            Some(&out),
            &dataset_hash,
        );
        storage.record_run(&run).await?;
        info!(run = %run.id, "run recorded");
    }

    println!();
    println!("{}", pipeline.statistics());
    println!();
    println!("  Output: {}", out.display());
    println!();
    Ok(())
}

async fn cmd_grid(
    pipeline_path: &Path,
    input: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    experiment: Option<String>,
    no_log: bool,
) -> Result<()> {
    let session = Session::open(pipeline_path, input, experiment)?;
    let grid = session.definition.grid();
    if grid.is_empty() {
        return Err(eyre!(
            "{} has no [grid.<step>] table to sweep",
            pipeline_path.display()
        ));
    }
    let pipeline = session.pipeline()?;
    if pipeline.evaluator().is_none() {
        tracing::warn!("no [evaluation] section; configurations will not be scored");
    }

    let out_dir = match out_dir {
        Some(dir) => dir,
        None => session.output_dir()?.join(&session.experiment),
    };
    let mut search = GridSearch::new(pipeline, &grid)?.with_output_dir(&out_dir);
    info!(experiment = %session.experiment, configs = search.configs().len(), "starting grid search");

    search.run(&session.data).await?;
    session.progress.finish();

    let summary = out_dir.join("summary.csv");
    search.write_summary(&summary)?;

    let results = search.results().to_vec();
    let best = search.best().cloned();

    if !no_log {
        let storage = session.storage().await?;
        let dataset_hash = session.dataset_hash();
        let mut pipeline = search.into_pipeline();
        let experiment_id = storage
            .ensure_experiment(&session.experiment, &pipeline.fingerprint(false))
            .await?;
        for result in &results {
            pipeline.update_params(&result.params)?;
            let output = out_dir.join(format!("{}.csv", result.id));
            let run = run_record(
                &experiment_id,
                pipeline.fingerprint(true),
                &result.params,
                &result.statistics,
                Some(&output),
                &dataset_hash,
            );
            storage.record_run(&run).await?;
        }
        info!(runs = results.len(), "grid results recorded");
    }

    println!();
    println!("  {:<18} {:>8} {:>10} {:>10}", "config", "score", "cost", "failures");
    for result in &results {
        let score = result
            .score
            .map(|s| format!("{s:.4}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<18} {:>8} {:>10.6} {:>10}",
            result.id,
            score,
            result.statistics.total_cost(),
            result.statistics.num_failure
        );
    }
    println!();
    match best {
        Some(best) => {
            println!("  Best:    {} ({:.4})", best.id, best.score.unwrap_or_default());
            println!("  Params:  {}", params_to_json(&best.params));
        }
        None => println!("  Best:    - (no configuration was scored)"),
    }
    println!("  Summary: {}", summary.display());
    println!();
    Ok(())
}

async fn cmd_runs_list(experiment: Option<&str>, limit: usize, json: bool) -> Result<()> {
    let config = load_config()?;
    let path = expand_home(&config.defaults.database)?;
    let storage = Storage::open_readonly(&path).await?;

    let (experiment_id, best) = match experiment {
        Some(name) => {
            let exp = storage
                .get_experiment_by_name(name)
                .await?
                .ok_or_else(|| eyre!("no experiment named '{name}'"))?;
            let best = storage.best_run(&exp.id).await?;
            (Some(exp.id), best)
        }
        None => (None, None),
    };
    let runs = storage.list_runs(experiment_id.as_deref(), limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    println!(
        "  {:<25} {:<18} {:>8} {:>10} {:>6} {:>6}",
        "created", "config", "score", "cost", "ok", "failed"
    );
    for run in &runs {
        let score = run
            .score
            .map(|s| format!("{s:.4}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<25} {:<18} {:>8} {:>10.6} {:>6} {:>6}",
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.config_id,
            score,
            run.total_cost(),
            run.num_success,
            run.num_failure
        );
    }
    if let Some(best) = best {
        println!();
        println!(
            "  Best: {} ({:.4}) {}",
            best.config_id,
            best.score.unwrap_or_default(),
            best.params
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
