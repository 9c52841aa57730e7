#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tk_types::{ClusteredRanking, Distance, ExecutionResults, ExperimentInstanceKey, Ranking, TypeError};
use tracing::{debug, warn};

/// Key under which engines print their result list.
pub const RANKING_KEY: &str = "ranking";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankingMismatch {
    #[error("distance bucket count mismatch: unit={unit}, witness={witness}")]
    BucketCount { unit: usize, witness: usize },
    #[error("distance {distance} is absent from the witness ranking")]
    MissingDistance { distance: Distance },
    #[error("bucket {rank} at distance {distance} mismatch: unit={unit:?}, witness={witness:?}")]
    Members {
        rank: usize,
        distance: Distance,
        unit: Vec<String>,
        witness: Vec<String>,
    },
    #[error("boundary bucket at distance {distance} size mismatch: unit={unit}, witness={witness}")]
    BoundaryCount {
        distance: Distance,
        unit: usize,
        witness: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Unit,
    Witness,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unit => "unit",
            Self::Witness => "witness",
        })
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{side} output is not a json document: {source}")]
    InvalidJson {
        side: Side,
        #[source]
        source: serde_json::Error,
    },
    #[error("{side} output has no \"ranking\" entry")]
    MissingRanking { side: Side },
    #[error("{side} ranking is malformed: {source}")]
    MalformedRanking {
        side: Side,
        #[source]
        source: TypeError,
    },
    #[error(transparent)]
    Mismatch(#[from] RankingMismatch),
}

/// Compares two clustered rankings.
///
/// Both must hold the same number of distance buckets and the same
/// distances. Every bucket below the largest distance must contain the same
/// identifiers. The largest bucket is where the top-k cut falls, so any
/// subset of the tied results is correct there and only the sizes must
/// agree.
pub fn lazy_compare(
    unit: &ClusteredRanking,
    witness: &ClusteredRanking,
) -> Result<(), RankingMismatch> {
    if unit.bucket_count() != witness.bucket_count() {
        return Err(RankingMismatch::BucketCount {
            unit: unit.bucket_count(),
            witness: witness.bucket_count(),
        });
    }
    let last = unit.bucket_count();
    for (rank, (distance, unit_ids)) in (1..).zip(unit.iter()) {
        let witness_ids = witness
            .get(distance)
            .ok_or(RankingMismatch::MissingDistance {
                distance: *distance,
            })?;
        if rank < last {
            let mut left = unit_ids.to_vec();
            let mut right = witness_ids.to_vec();
            left.sort_unstable();
            right.sort_unstable();
            if left != right {
                return Err(RankingMismatch::Members {
                    rank,
                    distance: *distance,
                    unit: left,
                    witness: right,
                });
            }
        } else if unit_ids.len() != witness_ids.len() {
            return Err(RankingMismatch::BoundaryCount {
                distance: *distance,
                unit: unit_ids.len(),
                witness: witness_ids.len(),
            });
        }
    }
    Ok(())
}

#[must_use]
pub fn validate_rankings(unit: &Ranking, witness: &Ranking) -> bool {
    lazy_compare(
        &ClusteredRanking::from_ranking(unit),
        &ClusteredRanking::from_ranking(witness),
    )
    .is_ok()
}

pub fn parse_ranking_output(stdout: &str, side: Side) -> Result<Ranking, ValidationError> {
    let document: Value = serde_json::from_str(stdout)
        .map_err(|source| ValidationError::InvalidJson { side, source })?;
    let ranking = document
        .get(RANKING_KEY)
        .ok_or(ValidationError::MissingRanking { side })?;
    Ranking::from_json(ranking).map_err(|source| ValidationError::MalformedRanking { side, source })
}

/// Validates one pair of captured stdout payloads.
pub fn validate_ranking_outputs(unit_stdout: &str, witness_stdout: &str) -> Result<(), ValidationError> {
    let unit = parse_ranking_output(unit_stdout, Side::Unit)?;
    let witness = parse_ranking_output(witness_stdout, Side::Witness)?;
    lazy_compare(
        &ClusteredRanking::from_ranking(&unit),
        &ClusteredRanking::from_ranking(&witness),
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// `None` when the whole instance is missing on one side.
    pub run: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceVerdict {
    pub instance: ExperimentInstanceKey,
    pub runs_checked: usize,
    pub failures: Vec<RunFailure>,
}

impl InstanceVerdict {
    fn new(instance: ExperimentInstanceKey) -> Self {
        Self {
            instance,
            runs_checked: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub unit: String,
    pub witness: String,
    pub success: bool,
    pub error_report: Option<String>,
    pub instances: Vec<InstanceVerdict>,
}

impl ValidationReport {
    pub fn failed_instances(&self) -> impl Iterator<Item = &InstanceVerdict> {
        self.instances.iter().filter(|verdict| !verdict.passed())
    }

    #[must_use]
    pub fn into_outcome(self) -> (bool, Option<String>) {
        (self.success, self.error_report)
    }
}

/// Compares every run of every witness instance against the unit's run at
/// the same position.
///
/// Failures are collected into one error report with a line per failing
/// run. With `stop_on_first_failure` the report ends at the first failing
/// instance.
#[must_use]
pub fn validate_all(
    witness: &ExecutionResults,
    unit: &ExecutionResults,
    stop_on_first_failure: bool,
) -> ValidationReport {
    let mut instances = Vec::new();
    let mut lines = Vec::new();

    for (key, witness_runs) in &witness.instances {
        let mut verdict = InstanceVerdict::new(key.clone());
        match unit.instances.get(key) {
            None => {
                warn!(instance = %key, unit = %unit.name, "instance missing from unit results");
                verdict.failures.push(RunFailure {
                    run: None,
                    reason: format!("instance missing from {} results", unit.name),
                });
            }
            Some(unit_runs) => {
                if unit_runs.stdout.len() != witness_runs.stdout.len() {
                    warn!(
                        instance = %key,
                        unit_runs = unit_runs.stdout.len(),
                        witness_runs = witness_runs.stdout.len(),
                        "run counts differ, comparing common prefix"
                    );
                }
                for (run, (unit_stdout, witness_stdout)) in
                    unit_runs.stdout.iter().zip(&witness_runs.stdout).enumerate()
                {
                    verdict.runs_checked += 1;
                    if let Err(err) = validate_ranking_outputs(unit_stdout, witness_stdout) {
                        debug!(instance = %key, run, error = %err, "ranking mismatch");
                        verdict.failures.push(RunFailure {
                            run: Some(run),
                            reason: err.to_string(),
                        });
                        if stop_on_first_failure {
                            break;
                        }
                    }
                }
            }
        }
        let failed = !verdict.passed();
        lines.extend(failure_lines(unit, witness, &verdict));
        instances.push(verdict);
        if failed && stop_on_first_failure {
            return finish(unit, witness, instances, lines);
        }
    }

    for key in unit
        .instances
        .keys()
        .filter(|key| !witness.instances.contains_key(*key))
    {
        warn!(instance = %key, witness = %witness.name, "instance missing from witness results");
        let mut verdict = InstanceVerdict::new(key.clone());
        verdict.failures.push(RunFailure {
            run: None,
            reason: format!("instance missing from {} results", witness.name),
        });
        lines.extend(failure_lines(unit, witness, &verdict));
        instances.push(verdict);
        if stop_on_first_failure {
            break;
        }
    }

    finish(unit, witness, instances, lines)
}

fn failure_lines(
    unit: &ExecutionResults,
    witness: &ExecutionResults,
    verdict: &InstanceVerdict,
) -> Vec<String> {
    verdict
        .failures
        .iter()
        .map(|failure| {
            let run = failure
                .run
                .map(|run| format!(" run {run}"))
                .unwrap_or_default();
            format!(
                "Error while validating outputs for instance ({}, {}, {}){run}: {}.",
                unit.name, witness.name, verdict.instance, failure.reason
            )
        })
        .collect()
}

fn finish(
    unit: &ExecutionResults,
    witness: &ExecutionResults,
    instances: Vec<InstanceVerdict>,
    lines: Vec<String>,
) -> ValidationReport {
    let success = lines.is_empty();
    ValidationReport {
        unit: unit.name.clone(),
        witness: witness.name.clone(),
        success,
        error_report: (!success).then(|| {
            let mut report = lines.join("\n");
            report.push('\n');
            report
        }),
        instances,
    }
}
