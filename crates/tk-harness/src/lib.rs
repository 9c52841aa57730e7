#![forbid(unsafe_code)]

pub mod config;
pub mod outputs;
pub mod runner;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tk_stats::{
    AggregateRecord, AggregationDiagnostics, StatsError, compute_averages, derive_total_timing,
    prefixed_value_table,
};
use tk_table::{StatTable, TableBuilder, TableError, render_stat_table};
use tk_types::{ExperimentInstanceKey, OutputChannel};
use tk_validate::{ValidationReport, validate_all};
use tracing::{debug, info, warn};

pub use config::{ExecutableSpec, HarnessConfig, PRELOAD_ENV, ReportConfig};
pub use outputs::{
    Corpus, ExperimentOutputs, InstanceRecord, OUTPUTS_FILE, load_outputs, min_count_per_size,
    write_outputs,
};
pub use runner::run_sweep;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("invalid executable {0:?}, expected NAME:command")]
    InvalidExecutable(String),
    #[error("preload library {} does not exist", .0.display())]
    PreloadLibraryMissing(PathBuf),
    #[error("sweep runner failed: {0}")]
    Runner(String),
    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Averages and tables derived from one persisted sweep.
#[derive(Debug, Clone)]
pub struct StatisticsReport {
    pub records: BTreeMap<ExperimentInstanceKey, AggregateRecord>,
    pub diagnostics: AggregationDiagnostics,
    /// Runs that received a derived total timing.
    pub derived_total_timings: usize,
    pub tables: Vec<StatTable>,
    /// Per-instance averages of each configured stdout prefix.
    pub prefixed: BTreeMap<String, BTreeMap<ExperimentInstanceKey, f64>>,
}

/// Averages stdout and stderr statistics of every instance and builds the
/// `.stat` tables over them.
///
/// Stdout runs first get their total timing derived. Plain-text stderr
/// groups are merged into the stdout record of the same instance.
pub fn build_statistics(
    outputs: &ExperimentOutputs,
    report: &ReportConfig,
) -> Result<StatisticsReport, HarnessError> {
    let mut results = outputs.results();
    let derived_total_timings = derive_total_timing(&mut results.instances);

    let mut aggregation = compute_averages(
        &results.instances,
        OutputChannel::Stdout,
        &report.stdout_layers(),
    )?;
    aggregation.merge_top_level(compute_averages(
        &results.instances,
        OutputChannel::Stderr,
        &report.text_layers,
    )?);
    if aggregation.diagnostics.skipped() > 0 {
        warn!(
            name = %outputs.name,
            missing = aggregation.diagnostics.missing_paths,
            malformed = aggregation.diagnostics.malformed_paths,
            shape_mismatches = aggregation.diagnostics.shape_mismatches,
            "some statistics were skipped while averaging"
        );
    }

    let ks = outputs.sweep_ks();
    let tables = TableBuilder::new(
        &outputs.name,
        &aggregation.records,
        &outputs.corpus.datasets,
        &outputs.corpus.queries,
        &ks,
    )
    .with_symbols(&report.symbols)
    .stat_tables(&report.table_layers(), &report.round_layers);
    info!(
        name = %outputs.name,
        instances = aggregation.records.len(),
        tables = tables.len(),
        "statistics built"
    );

    let mut prefixed = BTreeMap::new();
    for prefix in &report.prefixed_values {
        let values = prefixed_value_table(&results.instances, OutputChannel::Stdout, prefix)?;
        debug!(prefix, instances = values.len(), "prefixed values averaged");
        prefixed.insert(prefix.clone(), values);
    }

    Ok(StatisticsReport {
        records: aggregation.records,
        diagnostics: aggregation.diagnostics,
        derived_total_timings,
        tables,
        prefixed,
    })
}

/// Writes every kept table into `dir` and returns the written paths.
pub fn write_stat_files(
    dir: &Path,
    tables: &[StatTable],
    report: &ReportConfig,
) -> Result<Vec<PathBuf>, HarnessError> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for table in tables {
        if !report.keeps(table.stat_prefix()) {
            debug!(file = %table.file_name, "stat table filtered out");
            continue;
        }
        let path = dir.join(&table.file_name);
        fs::write(&path, render_stat_table(table)?)?;
        written.push(path);
    }
    info!(dir = %dir.display(), files = written.len(), "stat files written");
    Ok(written)
}

/// Validates the rankings of `unit` against those of `witness`, run by run.
#[must_use]
pub fn validate_outputs(
    witness: &ExperimentOutputs,
    unit: &ExperimentOutputs,
    stop_on_first_failure: bool,
) -> ValidationReport {
    validate_all(&witness.results(), &unit.results(), stop_on_first_failure)
}
