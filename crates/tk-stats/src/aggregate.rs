use std::collections::BTreeMap;

use serde::Serialize;
use tk_types::{
    ExperimentInstanceKey, Histogram, InstanceRuns, OutputChannel, StatPath, StatTree, StatValue,
    resolve, resolve_subtree,
};
use tracing::debug;

use crate::StatsError;
use crate::extract::{ExtractionMode, PathOutcome, RunStats, StatExtractor};

/// Counters describing what was skipped while averaging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationDiagnostics {
    pub json_runs: usize,
    pub plain_text_runs: usize,
    pub missing_paths: usize,
    pub malformed_paths: usize,
    pub shape_mismatches: usize,
}

impl AggregationDiagnostics {
    pub fn absorb(&mut self, other: &Self) {
        self.json_runs += other.json_runs;
        self.plain_text_runs += other.plain_text_runs;
        self.missing_paths += other.missing_paths;
        self.malformed_paths += other.malformed_paths;
        self.shape_mismatches += other.shape_mismatches;
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.missing_paths + self.malformed_paths + self.shape_mismatches
    }
}

/// Averaged statistics of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateRecord {
    pub runs: usize,
    pub stats: StatTree,
}

impl AggregateRecord {
    #[must_use]
    pub fn resolve(&self, path: &StatPath) -> Option<&StatValue> {
        resolve(&self.stats, path)
    }

    #[must_use]
    pub fn subtree(&self, path: &StatPath) -> Option<&StatTree> {
        resolve_subtree(&self.stats, path)
    }

    /// Copies every top-level group of `other` into this record, replacing
    /// groups of the same name.
    pub fn merge_top_level(&mut self, other: Self) {
        self.stats.extend(other.stats);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregation {
    pub records: BTreeMap<ExperimentInstanceKey, AggregateRecord>,
    pub diagnostics: AggregationDiagnostics,
}

impl Aggregation {
    /// Merges `other` into matching records; instances only present in
    /// `other` are adopted as they are.
    pub fn merge_top_level(&mut self, other: Self) {
        for (key, record) in other.records {
            match self.records.get_mut(&key) {
                Some(existing) => existing.merge_top_level(record),
                None => {
                    self.records.insert(key, record);
                }
            }
        }
        self.diagnostics.absorb(&other.diagnostics);
    }
}

/// Averages the statistics found at `paths` over all runs of every instance.
///
/// Each leaf is divided by the number of runs that actually supplied it, so
/// a run whose output could not be parsed for a path does not drag that
/// path's average down. Under a `rounds` path every round index is averaged
/// on its own.
pub fn compute_averages(
    instances: &BTreeMap<ExperimentInstanceKey, InstanceRuns>,
    channel: OutputChannel,
    paths: &[StatPath],
) -> Result<Aggregation, StatsError> {
    let extractor = StatExtractor::new(paths)?;
    let mut aggregation = Aggregation::default();
    for (key, runs) in instances {
        let mut accumulator = InstanceAccumulator::new();
        for text in runs.channel(channel) {
            accumulator.add_run(&extractor.extract(text));
        }
        let (record, diagnostics) = accumulator.finish();
        debug!(
            instance = %key,
            channel = channel.as_str(),
            runs = record.runs,
            skipped = diagnostics.skipped(),
            "averaged instance statistics"
        );
        aggregation.diagnostics.absorb(&diagnostics);
        aggregation.records.insert(key.clone(), record);
    }
    Ok(aggregation)
}

#[derive(Debug, Clone, PartialEq)]
enum SumNode {
    Scalar { sum: f64, runs: usize },
    Histogram { bins: Histogram, runs: usize },
    Subtree(BTreeMap<String, SumNode>),
}

impl SumNode {
    fn seed(value: &StatValue) -> Self {
        match value {
            StatValue::Scalar(value) => Self::Scalar {
                sum: *value,
                runs: 1,
            },
            StatValue::Histogram(bins) => Self::Histogram {
                bins: bins.clone(),
                runs: 1,
            },
            StatValue::Subtree(tree) => Self::Subtree(
                tree.iter()
                    .map(|(key, child)| (key.clone(), Self::seed(child)))
                    .collect(),
            ),
        }
    }

    fn average(self) -> StatValue {
        match self {
            Self::Scalar { sum, runs } => StatValue::Scalar(sum / runs as f64),
            Self::Histogram { bins, runs } => StatValue::Histogram(
                bins.into_iter()
                    .map(|(bucket, value)| (bucket, value / runs as f64))
                    .collect(),
            ),
            Self::Subtree(children) => StatValue::Subtree(
                children
                    .into_iter()
                    .map(|(key, child)| (key, child.average()))
                    .collect(),
            ),
        }
    }
}

/// Running sums of one instance. `finish` performs the division.
#[derive(Debug, Clone, Default)]
pub struct InstanceAccumulator {
    root: BTreeMap<String, SumNode>,
    runs: usize,
    diagnostics: AggregationDiagnostics,
}

impl InstanceAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_run(&mut self, stats: &RunStats) {
        self.runs += 1;
        match stats.mode {
            ExtractionMode::Json => self.diagnostics.json_runs += 1,
            ExtractionMode::PlainText => self.diagnostics.plain_text_runs += 1,
        }
        for (path, outcome) in &stats.outcomes {
            match outcome {
                PathOutcome::Found(tree) => self.add_path(path, tree),
                PathOutcome::Missing => {
                    self.diagnostics.missing_paths += 1;
                    debug!(%path, run = self.runs, "stat path missing");
                }
                PathOutcome::Malformed(reason) => {
                    self.diagnostics.malformed_paths += 1;
                    debug!(%path, run = self.runs, %reason, "stat path unreadable");
                }
                PathOutcome::ShapeMismatch(reason) => {
                    self.diagnostics.shape_mismatches += 1;
                    debug!(%path, run = self.runs, %reason, "stat path does not lead to a group");
                }
            }
        }
    }

    fn add_path(&mut self, path: &StatPath, tree: &StatTree) {
        let Some(target) = subtree_mut(&mut self.root, path.labels()) else {
            self.diagnostics.shape_mismatches += 1;
            return;
        };
        if !path.has_rounds() {
            self.diagnostics.shape_mismatches += add_tree(target, tree);
            return;
        }
        for (round, stats) in tree {
            let Some(round_stats) = stats.as_subtree().filter(|_| round.parse::<u64>().is_ok())
            else {
                debug!(%path, %round, "round entry is not an indexed group");
                self.diagnostics.shape_mismatches += 1;
                continue;
            };
            match target
                .entry(round.clone())
                .or_insert_with(|| SumNode::Subtree(BTreeMap::new()))
            {
                SumNode::Subtree(children) => {
                    self.diagnostics.shape_mismatches += add_tree(children, round_stats);
                }
                _ => self.diagnostics.shape_mismatches += 1,
            }
        }
    }

    #[must_use]
    pub fn finish(self) -> (AggregateRecord, AggregationDiagnostics) {
        let stats = self
            .root
            .into_iter()
            .map(|(key, node)| (key, node.average()))
            .collect();
        (
            AggregateRecord {
                runs: self.runs,
                stats,
            },
            self.diagnostics,
        )
    }
}

/// Walks to `labels`, creating empty groups on the way. `None` when a
/// non-group value already occupies one of the labels.
fn subtree_mut<'a>(
    root: &'a mut BTreeMap<String, SumNode>,
    labels: &[String],
) -> Option<&'a mut BTreeMap<String, SumNode>> {
    let mut current = root;
    for label in labels {
        match current
            .entry(label.clone())
            .or_insert_with(|| SumNode::Subtree(BTreeMap::new()))
        {
            SumNode::Subtree(children) => current = children,
            _ => return None,
        }
    }
    Some(current)
}

/// Adds `stats` into `sums` key by key and returns the number of values
/// skipped because their shape disagreed with what was accumulated so far.
fn add_tree(sums: &mut BTreeMap<String, SumNode>, stats: &StatTree) -> usize {
    let mut mismatches = 0;
    for (key, value) in stats {
        let Some(node) = sums.get_mut(key) else {
            sums.insert(key.clone(), SumNode::seed(value));
            continue;
        };
        match (node, value) {
            (SumNode::Scalar { sum, runs }, StatValue::Scalar(value)) => {
                *sum += value;
                *runs += 1;
            }
            (SumNode::Histogram { bins, runs }, StatValue::Histogram(incoming)) => {
                if add_histogram(bins, incoming) {
                    *runs += 1;
                } else {
                    debug!(%key, expected = bins.len(), found = incoming.len(), "histogram shape differs");
                    mismatches += 1;
                }
            }
            (SumNode::Subtree(children), StatValue::Subtree(tree)) => {
                mismatches += add_tree(children, tree);
            }
            (_, value) => {
                debug!(%key, found = ?value.kind(), "statistic changed kind between runs");
                mismatches += 1;
            }
        }
    }
    mismatches
}

/// Sums positionally. Lengths and bucket labels must agree.
fn add_histogram(bins: &mut Histogram, incoming: &Histogram) -> bool {
    if bins.len() != incoming.len()
        || bins
            .iter()
            .zip(incoming)
            .any(|((left, _), (right, _))| left != right)
    {
        return false;
    }
    for (slot, (_, value)) in bins.iter_mut().zip(incoming) {
        slot.1 += value;
    }
    true
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use tk_types::{ExperimentInstanceKey, InstanceRuns, OutputChannel, StatPath, StatValue};

    use super::{AggregateRecord, compute_averages};

    fn key(k: u64) -> ExperimentInstanceKey {
        ExperimentInstanceKey::new("data/xmark1.xml", "q/xmark1/xmark1_q1.xml", k)
    }

    fn instance(stdout: &[&str]) -> InstanceRuns {
        InstanceRuns {
            stdout: stdout.iter().map(|s| (*s).to_owned()).collect(),
            stderr: vec![String::new(); stdout.len()],
        }
    }

    fn scalar(record: &AggregateRecord, labels: &[&str]) -> Option<f64> {
        record
            .resolve(&StatPath::new(labels.iter().copied()))
            .and_then(StatValue::as_scalar)
    }

    #[test]
    fn scalars_are_averaged_over_runs() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(10),
            instance(&[
                r#"{"statistics": {"filter": {"global": {"timingfiltering": 10, "candidates": 4}}}}"#,
                r#"{"statistics": {"filter": {"global": {"timingfiltering": 20, "candidates": 4}}}}"#,
                r#"{"statistics": {"filter": {"global": {"timingfiltering": 30, "candidates": 4}}}}"#,
            ]),
        );
        let aggregation = compute_averages(
            &instances,
            OutputChannel::Stdout,
            &[StatPath::new(["filter", "global"])],
        )
            .expect("averages");
        let record = &aggregation.records[&key(10)];
        assert_eq!(record.runs, 3);
        assert_eq!(
            scalar(record, &["filter", "global", "timingfiltering"]),
            Some(20.0)
        );
        assert_eq!(scalar(record, &["filter", "global", "candidates"]), Some(4.0));
        assert_eq!(aggregation.diagnostics.json_runs, 3);
    }

    #[test]
    fn histograms_are_averaged_positionally() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(1),
            instance(&[
                r#"{"statistics": {"index": {"sizehist": [[1, 2], [2, 4]]}}}"#,
                r#"{"statistics": {"index": {"sizehist": [[1, 4], [2, 8]]}}}"#,
                r#"{"statistics": {"index": {"sizehist": [[1, 4]]}}}"#,
            ]),
        );
        let aggregation =
            compute_averages(&instances, OutputChannel::Stdout, &[StatPath::new(["index"])])
                .expect("averages");
        let record = &aggregation.records[&key(1)];
        assert_eq!(
            record.resolve(&StatPath::new(["index", "sizehist"])),
            Some(&StatValue::Histogram(vec![(1, 3.0), (2, 6.0)]))
        );
        assert_eq!(aggregation.diagnostics.shape_mismatches, 1);
    }

    #[test]
    fn rounds_are_averaged_by_their_own_run_count() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(5),
            instance(&[
                r#"{"statistics": {"filter": {"rounds": {"0": {"t": 2}, "1": {"t": 10}}}}}"#,
                r#"{"statistics": {"filter": {"rounds": {"0": {"t": 4}}}}}"#,
            ]),
        );
        instances.insert(
            key(6),
            instance(&[
                r#"{"statistics": {"filter": {"rounds": {"0": {"t": 1}, "1": {"t": 1}, "2": {"t": 7}}}}}"#,
            ]),
        );
        let aggregation = compute_averages(
            &instances,
            OutputChannel::Stdout,
            &[StatPath::new(["filter", "rounds"])],
        )
            .expect("averages");
        let first = &aggregation.records[&key(5)];
        assert_eq!(scalar(first, &["filter", "rounds", "0", "t"]), Some(3.0));
        assert_eq!(scalar(first, &["filter", "rounds", "1", "t"]), Some(10.0));
        assert_eq!(scalar(first, &["filter", "rounds", "2", "t"]), None);
        let second = &aggregation.records[&key(6)];
        assert_eq!(scalar(second, &["filter", "rounds", "2", "t"]), Some(7.0));
    }

    #[test]
    fn missing_paths_are_skipped_without_affecting_other_paths() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(3),
            instance(&[
                r#"{"statistics": {"index": {"timingindexing": 8}}}"#,
                r#"{"statistics": {"index": {"timingindexing": 4}, "filter": {"global": {"timingfiltering": 6}}}}"#,
            ]),
        );
        let aggregation = compute_averages(
            &instances,
            OutputChannel::Stdout,
            &[StatPath::new(["index"]), StatPath::new(["filter", "global"])],
        )
            .expect("averages");
        let record = &aggregation.records[&key(3)];
        assert_eq!(scalar(record, &["index", "timingindexing"]), Some(6.0));
        assert_eq!(
            scalar(record, &["filter", "global", "timingfiltering"]),
            Some(6.0)
        );
        assert_eq!(aggregation.diagnostics.missing_paths, 1);
    }

    #[test]
    fn absent_rounds_exclude_the_run_from_round_averages_only() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(8),
            instance(&[
                r#"{"statistics": {"filter": {"global": {"t": 2}, "rounds": {"0": {"t": 6}}}}}"#,
                r#"{"statistics": {"filter": {"global": {"t": 4}}}}"#,
            ]),
        );
        let aggregation = compute_averages(
            &instances,
            OutputChannel::Stdout,
            &[StatPath::new(["filter", "global"]), StatPath::new(["filter", "rounds"])],
        )
            .expect("averages");
        let record = &aggregation.records[&key(8)];
        assert_eq!(scalar(record, &["filter", "global", "t"]), Some(3.0));
        assert_eq!(scalar(record, &["filter", "rounds", "0", "t"]), Some(6.0));
        assert_eq!(aggregation.diagnostics.missing_paths, 1);
    }

    #[test]
    fn unparsable_runs_do_not_contribute_to_the_divisor() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(4),
            instance(&[
                r#"{"statistics": {"index": {"timingindexing": 9}}}"#,
                "segmentation fault",
            ]),
        );
        let aggregation =
            compute_averages(&instances, OutputChannel::Stdout, &[StatPath::new(["index"])])
                .expect("averages");
        let record = &aggregation.records[&key(4)];
        assert_eq!(record.runs, 2);
        assert_eq!(scalar(record, &["index", "timingindexing"]), Some(9.0));
        assert_eq!(aggregation.diagnostics.plain_text_runs, 1);
    }

    #[test]
    fn plain_text_stderr_is_averaged_under_its_path() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(2),
            InstanceRuns {
                stdout: vec![String::new(), String::new()],
                stderr: vec![
                    "heap total: 5, heap peak: 100, stack peak: 3".to_owned(),
                    "heap total: 5, heap peak: 300, stack peak: 3".to_owned(),
                ],
            },
        );
        let aggregation = compute_averages(
            &instances,
            OutputChannel::Stderr,
            &[StatPath::new(["heap peak"])],
        )
            .expect("averages");
        let record = &aggregation.records[&key(2)];
        assert_eq!(scalar(record, &["heap peak", "heap peak"]), Some(200.0));
    }

    #[test]
    fn merge_replaces_top_level_groups() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(7),
            InstanceRuns {
                stdout: vec![r#"{"statistics": {"index": {"timingindexing": 1}}}"#.to_owned()],
                stderr: vec!["heap peak: 42".to_owned()],
            },
        );
        let mut stdout =
            compute_averages(&instances, OutputChannel::Stdout, &[StatPath::new(["index"])])
                .expect("averages");
        let stderr = compute_averages(
            &instances,
            OutputChannel::Stderr,
            &[StatPath::new(["heap peak"])],
        )
            .expect("averages");
        stdout.merge_top_level(stderr);
        let record = &stdout.records[&key(7)];
        assert_eq!(scalar(record, &["index", "timingindexing"]), Some(1.0));
        assert_eq!(scalar(record, &["heap peak", "heap peak"]), Some(42.0));
    }

    #[test]
    fn scalar_in_place_of_a_group_counts_as_a_shape_mismatch() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(9),
            instance(&[
                r#"{"statistics": {"index": 3}}"#,
                r#"{"statistics": {"index": {"timingindexing": 5}}}"#,
            ]),
        );
        let aggregation =
            compute_averages(&instances, OutputChannel::Stdout, &[StatPath::new(["index"])])
                .expect("averages");
        assert_eq!(aggregation.diagnostics.shape_mismatches, 1);
        assert_eq!(aggregation.diagnostics.malformed_paths, 0);
        let record = &aggregation.records[&key(9)];
        assert_eq!(scalar(record, &["index", "timingindexing"]), Some(5.0));
    }

    #[test]
    fn repeated_plain_text_labels_contribute_their_first_value() {
        let mut instances = BTreeMap::new();
        instances.insert(
            key(11),
            InstanceRuns {
                stdout: Vec::new(),
                stderr: vec![
                    "heap peak: 100\nheap peak: 300\n".to_owned(),
                    "heap peak: 200\n".to_owned(),
                ],
            },
        );
        let aggregation = compute_averages(
            &instances,
            OutputChannel::Stderr,
            &[StatPath::new(["heap peak"])],
        )
        .expect("averages");
        let record = &aggregation.records[&key(11)];
        assert_eq!(scalar(record, &["heap peak", "heap peak"]), Some(150.0));
    }

    proptest! {
        #[test]
        fn identical_runs_average_to_the_single_run(value in -1.0e6f64..1.0e6, runs in 1usize..12) {
            let text = format!(r#"{{"statistics": {{"index": {{"timingindexing": {value}}}}}}}"#);
            let mut instances = BTreeMap::new();
            instances.insert(key(1), InstanceRuns { stdout: vec![text; runs], stderr: Vec::new() });
            let aggregation = compute_averages(&instances, OutputChannel::Stdout, &[StatPath::new(["index"])]).expect("averages");
            let averaged = scalar(&aggregation.records[&key(1)], &["index", "timingindexing"])
                .expect("leaf present");
            prop_assert!((averaged - value).abs() <= value.abs() * 1e-12 + 1e-12);
        }
    }
}
