mod experiments;

pub use experiments::{register_builtins, CommandExperiment, Echo};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use sweep_runner::alloc::numbered_dirs;
use sweep_runner::analysis::{load_results, MissingPolicy, ResultRow, DEFAULT_SEPARATOR};
use sweep_runner::filter::filter_completed;
use sweep_runner::{
    expand, BatchSummary, ExperimentRegistry, FailurePolicy, RunOptions, Runner, TrialStatus,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sweep", version, about = "Run an experiment over a parameter grid")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnErrorArg {
    #[value(name = "record")]
    Record,
    #[value(name = "abort")]
    Abort,
}

impl From<OnErrorArg> for FailurePolicy {
    fn from(value: OnErrorArg) -> Self {
        match value {
            OnErrorArg::Record => FailurePolicy::Record,
            OnErrorArg::Abort => FailurePolicy::Abort,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every configuration of a template that is not yet on disk.
    Run {
        template: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, short)]
        experiment: String,
        /// Treat the template as one configuration: no expansion, no resume.
        #[arg(long)]
        single: bool,
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, value_enum, default_value = "record")]
        on_error: OnErrorArg,
        #[arg(long)]
        retry_failed: bool,
        /// Append to an existing output directory without asking.
        #[arg(long)]
        append: bool,
        #[arg(long)]
        json: bool,
        /// Passed to the experiment's constructor.
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Show what `run` would do.
    Plan {
        template: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print one row per trial: flattened config plus result files.
    Collect {
        dir: PathBuf,
        #[arg(long, num_args = 1..)]
        files: Vec<String>,
        #[arg(long, default_value = DEFAULT_SEPARATOR)]
        separator: String,
        #[arg(long)]
        skip_missing: bool,
        #[arg(long)]
        json: bool,
    },
    /// List registered experiments.
    List {
        #[arg(long)]
        json: bool,
    },
}

pub fn run(registry: ExperimentRegistry) -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command, &registry) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "sweep=debug" } else { "sweep=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands, registry: &ExperimentRegistry) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            template,
            output,
            experiment,
            single,
            parallel,
            workers,
            on_error,
            retry_failed,
            append,
            json,
            args,
        } => {
            let template_value = load_template(&template)?;
            let experiment_impl = registry.build(&experiment, &args)?;
            tracing::debug!("experiment '{}' built with args {:?}", experiment, args);
            if !append && !confirm_append(&output)? {
                bail!("not appending to {}", output.display());
            }
            let options = RunOptions {
                parallel,
                workers,
                failure_policy: on_error.into(),
                retry_failed,
                progress: !json,
                ..RunOptions::default()
            };
            let runner = Runner::new(experiment_impl, &output, options)?;
            if single {
                let record = runner.run_one(&template_value)?;
                let failed = record.status == TrialStatus::Failed;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "run",
                        "mode": "single",
                        "experiment": experiment,
                        "trial_dir": record.dir.display().to_string(),
                        "failed": failed
                    })));
                }
                println!("trial_dir: {}", record.dir.display());
                println!("status: {}", if failed { "failed" } else { "completed" });
                return Ok(None);
            }
            let summary = runner.run_batch(&template_value)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "mode": "batch",
                    "experiment": experiment,
                    "output_dir": output.display().to_string(),
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&output, &summary);
        }
        Commands::Plan {
            template,
            output,
            json,
        } => {
            let configs = expand(&load_template(&template)?)?;
            let total = configs.len();
            let pending = filter_completed(configs, &output)?.pending;
            let pending_json: Vec<Value> = pending.iter().map(|c| c.to_json()).collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "output_dir": output.display().to_string(),
                    "total": total,
                    "skipped": total - pending.len(),
                    "pending": pending_json
                })));
            }
            println!("total: {}", total);
            println!("already_on_disk: {}", total - pending.len());
            println!("pending: {}", pending.len());
            for config in &pending_json {
                println!("  {}", config);
            }
        }
        Commands::Collect {
            dir,
            files,
            separator,
            skip_missing,
            json,
        } => {
            let missing = if skip_missing {
                MissingPolicy::Skip
            } else {
                MissingPolicy::Error
            };
            let rows = load_results(&dir, &files, &separator, missing)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "rows": rows.iter().map(row_to_json).collect::<Vec<_>>()
                })));
            }
            for row in &rows {
                println!("{}", row_to_json(row));
            }
        }
        Commands::List { json } => {
            let entries = registry.list();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "experiments": entries
                        .iter()
                        .map(|(id, summary)| json!({"id": id, "summary": summary}))
                        .collect::<Vec<_>>()
                })));
            }
            for (id, summary) in entries {
                println!("{}\t{}", id, summary);
            }
        }
    }
    Ok(None)
}

/// Reads a template file; `.yaml`/`.yml` as YAML, anything else as JSON.
pub fn load_template(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read template {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("invalid YAML in {}", path.display()))
    } else {
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
    }
}

// Asks before adding trials to a directory that already holds some.
fn confirm_append(output: &Path) -> Result<bool> {
    if !output.is_dir() {
        return Ok(true);
    }
    let existing = numbered_dirs(output)?.len();
    if existing == 0 {
        return Ok(true);
    }
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Err(anyhow!(
            "{} already holds {} trials; pass --append to add to it",
            output.display(),
            existing
        ));
    }
    eprint!(
        "{} already holds {} trials. Append? [y/N] ",
        output.display(),
        existing
    );
    std::io::stderr().flush()?;
    let mut answer = String::new();
    stdin.lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    use sweep_runner::SweepError;
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::Expansion { .. }) => "expansion_error",
        Some(SweepError::Allocation { .. }) => "allocation_error",
        Some(SweepError::Trial { .. }) => "trial_failed",
        Some(SweepError::Encode { .. }) | Some(SweepError::Persistence { .. }) => {
            "persistence_error"
        }
        Some(SweepError::StructuralCorruption { .. }) => "structural_corruption",
        Some(SweepError::UnregisteredExperiment { .. }) => "unregistered_experiment",
        Some(SweepError::ExperimentSetup { .. }) => "experiment_setup_failed",
        Some(_) => "io_error",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Collect { json, .. }
        | Commands::List { json } => *json,
    }
}

fn summary_to_json(summary: &BatchSummary) -> Value {
    json!({
        "total": summary.total,
        "skipped": summary.skipped,
        "completed": summary.completed,
        "failed": summary.failed,
        "trial_dirs": summary
            .trial_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
    })
}

fn row_to_json(row: &ResultRow) -> Value {
    Value::Object(row.columns.clone())
}

fn print_summary(output: &Path, summary: &BatchSummary) {
    println!("output_dir: {}", output.display());
    println!("total: {}", summary.total);
    println!("skipped: {}", summary.skipped);
    println!("completed: {}", summary.completed);
    println!("failed: {}", summary.failed);
}
