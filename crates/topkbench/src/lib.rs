#![forbid(unsafe_code)]

//! One import for the whole harness.
//!
//! ```no_run
//! use topkbench::{ReportConfig, build_statistics, load_outputs, write_stat_files};
//!
//! # fn main() -> Result<(), topkbench::HarnessError> {
//! let outputs = load_outputs("results/20170304_050607-SLIM/outs.json".as_ref())?;
//! let report = ReportConfig::default();
//! let stats = build_statistics(&outputs, &report)?;
//! write_stat_files("stats".as_ref(), &stats.tables, &report)?;
//! # Ok(())
//! # }
//! ```

pub use tk_harness::{
    Corpus, ExecutableSpec, ExperimentOutputs, HarnessConfig, HarnessError, InstanceRecord,
    OUTPUTS_FILE, ReportConfig, StatisticsReport, build_statistics, load_outputs,
    min_count_per_size, run_sweep, validate_outputs, write_outputs, write_stat_files,
};
pub use tk_stats::{
    AggregateRecord, Aggregation, AggregationDiagnostics, StatExtractor, StatsError,
    average_prefixed_value, compute_average_histogram, compute_averages, derive_total_timing,
    prefixed_value_table,
};
pub use tk_table::{
    AxisValue, Pivot, SizeSymbol, StatTable, TableBuilder, TableError, render_stat_table,
};
pub use tk_types::{
    ClusteredRanking, Distance, ExecutionResults, ExperimentInstanceKey, Histogram, InstanceRuns,
    OutputChannel, Ranking, RankingEntry, StatPath, StatTree, StatValue, TypeError,
};
pub use tk_validate::{
    RankingMismatch, ValidationError, ValidationReport, lazy_compare, validate_all,
    validate_ranking_outputs, validate_rankings,
};
