#![forbid(unsafe_code)]

//! Drives top-k engine sweeps and turns their outputs into `.stat` tables
//! and ranking verdicts.
//!
//! ```bash
//! tk-harness-cli run --executable "SLIM:./slim --stats" --corpus corpus.json --ks 1,10,100
//! tk-harness-cli stats results/20170304_050607-SLIM/outs.json
//! tk-harness-cli validate --witness witness/outs.json --unit slim/outs.json
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tk_harness::{
    Corpus, ExecutableSpec, ExperimentOutputs, HarnessConfig, OUTPUTS_FILE, ReportConfig,
    build_statistics, load_outputs, run_sweep, validate_outputs, write_outputs, write_stat_files,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "tk-harness-cli", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an engine over every related dataset/query pair and k
    Run(RunArgs),
    /// Average the statistics of a sweep and write its `.stat` tables
    Stats(StatsArgs),
    /// Check the rankings of a sweep against a witness sweep
    Validate(ValidateArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Engine to run, as `NAME:command args`
    #[arg(short, long)]
    executable: String,

    /// JSON file listing dataset and query descriptors
    #[arg(short, long)]
    corpus: PathBuf,

    /// Runs per instance
    #[arg(short, long)]
    runs: Option<usize>,

    /// Values of k to sweep
    #[arg(short, long, value_delimiter = ',')]
    ks: Vec<u64>,

    /// Maximum number of engine processes alive at once
    #[arg(short = 'j', long)]
    max_processes: Option<usize>,

    /// Shared library preloaded into every engine process to track memory
    #[arg(long)]
    preload: Option<PathBuf>,

    #[arg(long)]
    result_root: Option<PathBuf>,

    #[arg(long)]
    tmp_dir: Option<PathBuf>,
}

#[derive(clap::Args)]
struct StatsArgs {
    /// Persisted sweep outputs
    outputs: PathBuf,

    /// YAML file selecting the statistics to tabulate
    #[arg(long)]
    report_config: Option<PathBuf>,

    /// Directory receiving the `.stat` files (default: next to the outputs)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Also average the number after this stdout prefix, per instance
    #[arg(short, long = "prefix")]
    prefixes: Vec<String>,
}

#[derive(clap::Args)]
struct ValidateArgs {
    /// Outputs of the engine trusted to be correct
    #[arg(short, long)]
    witness: PathBuf,

    /// Outputs of the engine under test
    #[arg(short, long)]
    unit: PathBuf,

    /// Stop at the first failing instance
    #[arg(long)]
    stop_on_first_failure: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Stats(args) => stats(args),
        Command::Validate(args) => validate(args),
    }
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = HarnessConfig::default_paths();
    if let Some(runs) = args.runs {
        config.runs = runs;
    }
    if !args.ks.is_empty() {
        config.ks = args.ks;
    }
    if let Some(max_processes) = args.max_processes {
        config.max_processes = max_processes;
    }
    if let Some(root) = args.result_root {
        config.result_root = root;
    }
    if let Some(tmp_dir) = args.tmp_dir {
        config.tmp_dir = tmp_dir;
    }
    config.preload_library = args.preload;
    config.check_preload_library()?;

    let corpus = Corpus::load(&args.corpus)
        .with_context(|| format!("reading corpus {}", args.corpus.display()))?;
    let executable = ExecutableSpec::parse(&args.executable)?;
    config.log_summary(&executable);
    info!(
        datasets = corpus.datasets.len(),
        queries = corpus.queries.len(),
        queries_per_size = ?corpus.queries_per_size(),
        "corpus loaded"
    );

    let staged = executable
        .stage(&config.tmp_dir)
        .with_context(|| format!("staging {}", executable.program()))?;
    let instances = corpus.instances(&config.ks);
    let results = run_sweep(&config, &staged, &instances)?;

    let dir = config.create_result_dir(&executable.name)?;
    let path = dir.join(OUTPUTS_FILE);
    let outputs = ExperimentOutputs::from_results(&results, corpus, config.ks.clone());
    write_outputs(&path, &outputs)?;
    println!("wrote outputs={}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn stats(args: StatsArgs) -> Result<ExitCode> {
    let mut report_config = match &args.report_config {
        Some(path) => ReportConfig::load(path)
            .with_context(|| format!("reading report config {}", path.display()))?,
        None => ReportConfig::default(),
    };
    report_config.prefixed_values.extend(args.prefixes);
    let outputs = load(&args.outputs)?;
    let report = build_statistics(&outputs, &report_config)?;
    println!(
        "instances={} json_runs={} plain_text_runs={} skipped={} derived_total_timings={}",
        report.records.len(),
        report.diagnostics.json_runs,
        report.diagnostics.plain_text_runs,
        report.diagnostics.skipped(),
        report.derived_total_timings
    );
    for (prefix, values) in &report.prefixed {
        for (instance, value) in values {
            println!("{instance} {prefix:?}={value}");
        }
    }

    let out_dir = args.out_dir.unwrap_or_else(|| {
        args.outputs
            .parent()
            .map_or_else(|| PathBuf::from("stats"), |dir| dir.join("stats"))
    });
    let written = write_stat_files(&out_dir, &report.tables, &report_config)?;
    println!("wrote stat_files={} dir={}", written.len(), out_dir.display());
    Ok(ExitCode::SUCCESS)
}

fn validate(args: ValidateArgs) -> Result<ExitCode> {
    let witness = load(&args.witness)?;
    let unit = load(&args.unit)?;
    let report = validate_outputs(&witness, &unit, args.stop_on_first_failure);

    for verdict in &report.instances {
        let (colour, tag) = if verdict.passed() {
            (GREEN, "SUCCESS")
        } else {
            (RED, "FAILURE")
        };
        println!("{colour}{tag}{RESET} {} runs={}", verdict.instance, verdict.runs_checked);
    }
    if let Some(errors) = &report.error_report {
        eprint!("{errors}");
    }

    if report.success {
        println!("{} agrees with {}", report.unit, report.witness);
        Ok(ExitCode::SUCCESS)
    } else {
        println!(
            "{} disagrees with {} on {} instance(s)",
            report.unit,
            report.witness,
            report.failed_instances().count()
        );
        Ok(ExitCode::FAILURE)
    }
}

fn load(path: &Path) -> Result<ExperimentOutputs> {
    load_outputs(path).with_context(|| format!("reading outputs {}", path.display()))
}
