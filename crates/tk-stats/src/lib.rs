#![forbid(unsafe_code)]

mod aggregate;
mod derived;
mod extract;
mod histogram;

use thiserror::Error;

pub use aggregate::{
    AggregateRecord, Aggregation, AggregationDiagnostics, InstanceAccumulator, compute_averages,
};
pub use derived::{TOTAL_TIMING_KEY, derive_total_timing};
pub use extract::{
    ExtractionMode, PathOutcome, RunStats, StatExtractor, average_prefixed_value,
    prefixed_value_table,
};
pub use histogram::compute_average_histogram;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error(transparent)]
    Pattern(#[from] regex::Error),
    #[error("value {raw:?} after {label:?} is not a number")]
    MalformedNumber { label: String, raw: String },
}
