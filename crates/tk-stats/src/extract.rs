use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};
use tk_types::{
    ExperimentInstanceKey, InstanceRuns, OutputChannel, StatPath, StatTree, StatValue,
    stat_tree_from_json,
};
use tracing::debug;

use crate::StatsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Json,
    PlainText,
}

/// What one stat path yielded for a single run.
#[derive(Debug, Clone, PartialEq)]
pub enum PathOutcome {
    Found(StatTree),
    Missing,
    /// A value under the path could not be read as a statistic.
    Malformed(String),
    /// A label on the way down names a value instead of a group.
    ShapeMismatch(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    pub mode: ExtractionMode,
    pub outcomes: Vec<(StatPath, PathOutcome)>,
}

impl RunStats {
    #[must_use]
    pub fn found(&self, path: &StatPath) -> Option<&StatTree> {
        self.outcomes
            .iter()
            .find_map(|(candidate, outcome)| match outcome {
                PathOutcome::Found(tree) if candidate == path => Some(tree),
                _ => None,
            })
    }
}

/// Reads a fixed set of stat paths out of captured run text.
///
/// The plain-text label patterns are compiled once in [`StatExtractor::new`]
/// and reused for every run.
#[derive(Debug, Clone)]
pub struct StatExtractor {
    paths: Vec<StatPath>,
    label_patterns: BTreeMap<String, Regex>,
}

impl StatExtractor {
    pub fn new(paths: &[StatPath]) -> Result<Self, StatsError> {
        let mut label_patterns = BTreeMap::new();
        for label in paths.iter().flat_map(StatPath::labels) {
            if !label_patterns.contains_key(label) {
                label_patterns.insert(label.clone(), label_pattern(label)?);
            }
        }
        Ok(Self {
            paths: paths.to_vec(),
            label_patterns,
        })
    }

    #[must_use]
    pub fn paths(&self) -> &[StatPath] {
        &self.paths
    }

    /// Extracts every path from one run's captured text.
    ///
    /// Text that decodes as a JSON document carrying a `statistics` object is
    /// read structurally. Anything else is scanned for `label: number` pairs,
    /// one per label of each path, and the labels found form the path's tree.
    #[must_use]
    pub fn extract(&self, text: &str) -> RunStats {
        match statistics_object(text) {
            Some(statistics) => RunStats {
                mode: ExtractionMode::Json,
                outcomes: self
                    .paths
                    .iter()
                    .map(|path| (path.clone(), extract_json_path(&statistics, path)))
                    .collect(),
            },
            None => RunStats {
                mode: ExtractionMode::PlainText,
                outcomes: self
                    .paths
                    .iter()
                    .map(|path| (path.clone(), self.extract_text_path(text, path)))
                    .collect(),
            },
        }
    }

    fn extract_text_path(&self, text: &str, path: &StatPath) -> PathOutcome {
        let mut tree = StatTree::new();
        for label in path.labels() {
            let Some(pattern) = self.label_patterns.get(label) else {
                continue;
            };
            match first_number(pattern, text, label) {
                Ok(Some(value)) => {
                    tree.insert(label.clone(), StatValue::Scalar(value));
                }
                Ok(None) => {}
                Err(err) => return PathOutcome::Malformed(format!("{path}: {err}")),
            }
        }
        if tree.is_empty() {
            PathOutcome::Missing
        } else {
            PathOutcome::Found(tree)
        }
    }
}

fn statistics_object(text: &str) -> Option<Map<String, Value>> {
    let mut document: Value = serde_json::from_str(text).ok()?;
    match document.get_mut("statistics")?.take() {
        Value::Object(statistics) => Some(statistics),
        _ => None,
    }
}

fn extract_json_path(statistics: &Map<String, Value>, path: &StatPath) -> PathOutcome {
    let mut current = statistics;
    for label in path.labels() {
        match current.get(label) {
            Some(Value::Object(child)) => current = child,
            Some(other) => {
                return PathOutcome::ShapeMismatch(format!(
                    "{path} reaches a non-object value at {label:?}: {other}"
                ));
            }
            None => return PathOutcome::Missing,
        }
    }
    match stat_tree_from_json(current) {
        Ok(tree) => PathOutcome::Found(tree),
        Err(err) => PathOutcome::Malformed(format!("{path}: {err}")),
    }
}

fn label_pattern(label: &str) -> Result<Regex, StatsError> {
    Ok(Regex::new(&format!(
        r"\s*{}\s*:\s*(\d+\.*\d*)",
        regex::escape(label)
    ))?)
}

/// `prefix`, an optional descriptive tail such as `(in ms)`, then the number.
fn prefixed_pattern(prefix: &str) -> Result<Regex, StatsError> {
    Ok(Regex::new(&format!(
        r"\s*{}[a-zA-Z0-9\-/\.\(\)_,\s]*:\s*(\d+\.*\d*)",
        regex::escape(prefix)
    ))?)
}

/// The number of the first `pattern` match in `text`. Later matches are
/// ignored.
fn first_number(pattern: &Regex, text: &str, label: &str) -> Result<Option<f64>, StatsError> {
    let Some(captures) = pattern.captures(text) else {
        return Ok(None);
    };
    let raw = &captures[1];
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| StatsError::MalformedNumber {
            label: label.to_owned(),
            raw: raw.to_owned(),
        })
}

fn average_matches(pattern: &Regex, outputs: &[String], prefix: &str) -> Option<f64> {
    let mut sum = 0.0;
    let mut matched = 0_usize;
    for (run, output) in outputs.iter().enumerate() {
        match first_number(pattern, output, prefix) {
            Ok(Some(value)) => {
                sum += value;
                matched += 1;
            }
            Ok(None) => {}
            Err(err) => debug!(run, %err, "prefixed value skipped"),
        }
    }
    (matched > 0).then(|| sum / matched as f64)
}

/// Averages the first number following `prefix` (and an optional
/// descriptive tail such as `(in ms)`) across all runs that contain it.
///
/// Returns `None` when no run matches.
pub fn average_prefixed_value(outputs: &[String], prefix: &str) -> Result<Option<f64>, StatsError> {
    Ok(average_matches(&prefixed_pattern(prefix)?, outputs, prefix))
}

/// [`average_prefixed_value`] for every instance, reading `channel`.
///
/// Instances where no run mentions `prefix` are left out of the table.
pub fn prefixed_value_table(
    instances: &BTreeMap<ExperimentInstanceKey, InstanceRuns>,
    channel: OutputChannel,
    prefix: &str,
) -> Result<BTreeMap<ExperimentInstanceKey, f64>, StatsError> {
    let pattern = prefixed_pattern(prefix)?;
    let mut table = BTreeMap::new();
    for (key, runs) in instances {
        match average_matches(&pattern, runs.channel(channel), prefix) {
            Some(value) => {
                table.insert(key.clone(), value);
            }
            None => debug!(instance = %key, prefix, "prefix not found in any run"),
        }
    }
    Ok(table)
}
