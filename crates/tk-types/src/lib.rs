#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Path label marking a per-round statistics group.
pub const ROUNDS_LABEL: &str = "rounds";

/// One measured configuration: a dataset file, a query file and a result count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExperimentInstanceKey {
    pub dataset: String,
    pub query: String,
    pub k: u64,
}

impl ExperimentInstanceKey {
    #[must_use]
    pub fn new(dataset: impl Into<String>, query: impl Into<String>, k: u64) -> Self {
        Self {
            dataset: dataset.into(),
            query: query.into(),
            k,
        }
    }

    #[must_use]
    pub fn dataset_name(&self) -> &str {
        last_path_component(&self.dataset)
    }

    #[must_use]
    pub fn query_name(&self) -> &str {
        last_path_component(&self.query)
    }
}

impl fmt::Display for ExperimentInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T={}, Q={}, k={}",
            self.dataset_name(),
            self.query_name(),
            self.k
        )
    }
}

#[must_use]
pub fn last_path_component(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// File name without its final extension.
#[must_use]
pub fn file_stem(path: &str) -> &str {
    let name = last_path_component(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(dot) => &name[..dot],
    }
}

/// A query belongs to a dataset when the query file name embeds the
/// dataset stem followed by an underscore (`xmark1.xml` -> `xmark1_q3.xml`).
#[must_use]
pub fn is_related_query(dataset_path: &str, query_path: &str) -> bool {
    let marker = format!("{}_", file_stem(dataset_path));
    last_path_component(query_path).contains(&marker)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl OutputChannel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Captured output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRun {
    pub stdout: String,
    pub stderr: String,
}

/// All runs of one instance, stored per channel in run order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRuns {
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
}

impl InstanceRuns {
    #[must_use]
    pub fn channel(&self, channel: OutputChannel) -> &[String] {
        match channel {
            OutputChannel::Stdout => &self.stdout,
            OutputChannel::Stderr => &self.stderr,
        }
    }

    pub fn push(&mut self, run: RawRun) {
        self.stdout.push(run.stdout);
        self.stderr.push(run.stderr);
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.stdout.len().max(self.stderr.len())
    }
}

/// Outputs of one named executable over a sweep of instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResults {
    pub name: String,
    pub instances: BTreeMap<ExperimentInstanceKey, InstanceRuns>,
}

impl ExecutionResults {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: BTreeMap::new(),
        }
    }
}

/// Size metadata of a dataset or query tree file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDescriptor {
    pub path: String,
    pub size_mb: f64,
    pub size_nodes: u64,
}

impl TreeDescriptor {
    #[must_use]
    pub fn new(path: impl Into<String>, size_mb: f64, size_nodes: u64) -> Self {
        Self {
            path: path.into(),
            size_mb,
            size_nodes,
        }
    }

    #[must_use]
    pub fn file_stem(&self) -> &str {
        file_stem(&self.path)
    }
}

/// Ordered label sequence addressing a node of a statistics tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatPath(Vec<String>);

impl StatPath {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn has_rounds(&self) -> bool {
        self.0.iter().any(|label| label == ROUNDS_LABEL)
    }
}

impl fmt::Display for StatPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Ordered `(bucket, value)` pairs.
pub type Histogram = Vec<(i64, f64)>;

pub type StatTree = BTreeMap<String, StatValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Scalar,
    Histogram,
    Subtree,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Scalar(f64),
    Histogram(Histogram),
    Subtree(StatTree),
}

impl StatValue {
    /// Converts a decoded JSON statistic. Numbers, booleans and numeric
    /// strings become scalars, arrays become histograms and objects subtrees.
    pub fn from_json(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(histogram_bin)
                .collect::<Result<Histogram, _>>()
                .map(Self::Histogram),
            Value::Object(map) => stat_tree_from_json(map).map(Self::Subtree),
            scalar => json_number(scalar).map(Self::Scalar),
        }
    }

    #[must_use]
    pub fn kind(&self) -> StatKind {
        match self {
            Self::Scalar(_) => StatKind::Scalar,
            Self::Histogram(_) => StatKind::Histogram,
            Self::Subtree(_) => StatKind::Subtree,
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_histogram(&self) -> Option<&Histogram> {
        match self {
            Self::Histogram(bins) => Some(bins),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_subtree(&self) -> Option<&StatTree> {
        match self {
            Self::Subtree(tree) => Some(tree),
            _ => None,
        }
    }
}

pub fn stat_tree_from_json(map: &Map<String, Value>) -> Result<StatTree, TypeError> {
    map.iter()
        .map(|(key, child)| Ok((key.clone(), StatValue::from_json(child)?)))
        .collect()
}

/// Reads a JSON number, boolean or numeric string as `f64`.
pub fn json_number(value: &Value) -> Result<f64, TypeError> {
    match value {
        Value::Number(number) => number.as_f64().ok_or_else(|| TypeError::NonNumericValue {
            value: number.to_string(),
        }),
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| TypeError::NonNumericValue {
                value: text.clone(),
            }),
        Value::Null | Value::Array(_) | Value::Object(_) => Err(TypeError::UnsupportedJson {
            kind: json_kind(value),
        }),
    }
}

fn histogram_bin(value: &Value) -> Result<(i64, f64), TypeError> {
    match value.as_array().map(Vec::as_slice) {
        Some([bucket, count]) => Ok((histogram_bucket(bucket)?, json_number(count)?)),
        _ => Err(TypeError::MalformedHistogramBin {
            found: value.to_string(),
        }),
    }
}

fn histogram_bucket(value: &Value) -> Result<i64, TypeError> {
    if let Some(bucket) = value.as_i64() {
        return Ok(bucket);
    }
    let number = json_number(value)?;
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Ok(number as i64)
    } else {
        Err(TypeError::NonIntegerBucket {
            value: value.to_string(),
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Follows `path` without creating anything. The root path is not a value.
#[must_use]
pub fn resolve<'a>(tree: &'a StatTree, path: &StatPath) -> Option<&'a StatValue> {
    let (last, parents) = path.labels().split_last()?;
    resolve_subtree_labels(tree, parents)?.get(last)
}

/// Follows `path` to a subtree; the root path resolves to `tree` itself.
#[must_use]
pub fn resolve_subtree<'a>(tree: &'a StatTree, path: &StatPath) -> Option<&'a StatTree> {
    resolve_subtree_labels(tree, path.labels())
}

fn resolve_subtree_labels<'a>(tree: &'a StatTree, labels: &[String]) -> Option<&'a StatTree> {
    labels
        .iter()
        .try_fold(tree, |current, label| current.get(label)?.as_subtree())
}

/// Distance of a ranked result. NaN is rejected and `-0.0` folds into `0.0`,
/// which makes the total order usable as a map key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distance(f64);

impl Distance {
    pub fn new(value: f64) -> Result<Self, TypeError> {
        if value.is_nan() {
            return Err(TypeError::NanDistance);
        }
        Ok(Self(if value == 0.0 { 0.0 } else { value }))
    }

    pub fn from_json(value: &Value) -> Result<Self, TypeError> {
        Self::new(json_number(value)?)
    }

    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for Distance {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Distance {}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub id: String,
    pub distance: Distance,
}

/// Ordered top-k result list as emitted by an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ranking(Vec<RankingEntry>);

impl Ranking {
    #[must_use]
    pub fn new(entries: Vec<RankingEntry>) -> Self {
        Self(entries)
    }

    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        pairs
            .into_iter()
            .map(|(id, distance)| {
                Ok(RankingEntry {
                    id: id.into(),
                    distance: Distance::new(distance)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Parses `[[id, distance], ...]`. Identifiers may be strings or numbers.
    pub fn from_json(value: &Value) -> Result<Self, TypeError> {
        let items = value.as_array().ok_or_else(|| TypeError::MalformedRanking {
            found: json_kind(value).to_owned(),
        })?;
        items
            .iter()
            .map(|item| match item.as_array().map(Vec::as_slice) {
                Some([id, distance]) => Ok(RankingEntry {
                    id: ranking_id(id)?,
                    distance: Distance::from_json(distance)?,
                }),
                _ => Err(TypeError::MalformedRanking {
                    found: item.to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    #[must_use]
    pub fn entries(&self) -> &[RankingEntry] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn ranking_id(value: &Value) -> Result<String, TypeError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(TypeError::MalformedRanking {
            found: other.to_string(),
        }),
    }
}

/// Ranking grouped into buckets of equal distance, ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusteredRanking {
    buckets: BTreeMap<Distance, Vec<String>>,
}

impl ClusteredRanking {
    #[must_use]
    pub fn from_ranking(ranking: &Ranking) -> Self {
        let mut buckets: BTreeMap<Distance, Vec<String>> = BTreeMap::new();
        for entry in ranking.entries() {
            buckets
                .entry(entry.distance)
                .or_default()
                .push(entry.id.clone());
        }
        Self { buckets }
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[must_use]
    pub fn get(&self, distance: &Distance) -> Option<&[String]> {
        self.buckets.get(distance).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Distance, &[String])> {
        self.buckets
            .iter()
            .map(|(distance, ids)| (distance, ids.as_slice()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeError {
    #[error("value {value:?} is not numeric")]
    NonNumericValue { value: String },
    #[error("json {kind} cannot be read as a statistic")]
    UnsupportedJson { kind: &'static str },
    #[error("histogram bin must be a [bucket, value] pair, found {found}")]
    MalformedHistogramBin { found: String },
    #[error("histogram bucket {value} is not an integer")]
    NonIntegerBucket { value: String },
    #[error("distance must not be NaN")]
    NanDistance,
    #[error("ranking must be a list of [identifier, distance] pairs, found {found}")]
    MalformedRanking { found: String },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ClusteredRanking, Distance, ExperimentInstanceKey, Ranking, StatPath, StatValue, TypeError,
        file_stem, is_related_query, resolve, resolve_subtree,
    };

    #[test]
    fn json_statistics_convert_into_typed_tree() {
        let value = json!({
            "timingfiltering": 12.5,
            "candidates": "7",
            "lengthhist": [[1, 3], ["2", 4.5]],
            "rounds": {"0": {"timing": 1}}
        });
        let StatValue::Subtree(tree) = StatValue::from_json(&value).expect("convert") else {
            panic!("expected subtree");
        };
        assert_eq!(tree["timingfiltering"], StatValue::Scalar(12.5));
        assert_eq!(tree["candidates"], StatValue::Scalar(7.0));
        assert_eq!(
            tree["lengthhist"],
            StatValue::Histogram(vec![(1, 3.0), (2, 4.5)])
        );
        let round = resolve(&tree, &StatPath::new(["rounds", "0", "timing"]));
        assert_eq!(round, Some(&StatValue::Scalar(1.0)));
    }

    #[test]
    fn non_numeric_strings_are_rejected() {
        let err = StatValue::from_json(&json!({"algorithm": "slim"})).expect_err("must fail");
        assert!(matches!(err, TypeError::NonNumericValue { .. }));
        let err = StatValue::from_json(&json!([[1.5, 2]])).expect_err("must fail");
        assert!(matches!(err, TypeError::NonIntegerBucket { .. }));
    }

    #[test]
    fn resolve_never_creates_and_root_resolves_to_tree() {
        let StatValue::Subtree(tree) =
            StatValue::from_json(&json!({"filter": {"global": {"a": 1}}})).expect("convert")
        else {
            panic!("expected subtree");
        };
        assert!(resolve(&tree, &StatPath::new(["filter", "missing"])).is_none());
        assert!(resolve(&tree, &StatPath::root()).is_none());
        assert_eq!(
            resolve_subtree(&tree, &StatPath::root()).map(|t| t.len()),
            Some(1)
        );
        assert!(resolve_subtree(&tree, &StatPath::new(["filter", "global", "a"])).is_none());
    }

    #[test]
    fn clustering_groups_equal_distances_in_ascending_order() {
        let ranking = Ranking::from_json(&json!([["a", 2], ["b", 1.0], [7, "2.0"], ["d", -0.0]]))
            .expect("ranking");
        let clustered = ClusteredRanking::from_ranking(&ranking);
        let buckets: Vec<(f64, Vec<String>)> = clustered
            .iter()
            .map(|(distance, ids)| (distance.value(), ids.to_vec()))
            .collect();
        assert_eq!(
            buckets,
            vec![
                (0.0, vec!["d".to_owned()]),
                (1.0, vec!["b".to_owned()]),
                (2.0, vec!["a".to_owned(), "7".to_owned()]),
            ]
        );
    }

    #[test]
    fn nan_distances_are_rejected() {
        assert_eq!(Distance::new(f64::NAN), Err(TypeError::NanDistance));
        assert!(Ranking::from_json(&json!([["a"]])).is_err());
        assert!(Ranking::from_json(&json!({"a": 1})).is_err());
    }

    #[test]
    fn instance_key_display_uses_file_names() {
        let key = ExperimentInstanceKey::new("data/xmark1.xml", "queries/xmark1/xmark1_q4.xml", 10);
        assert_eq!(key.to_string(), "T=xmark1.xml, Q=xmark1_q4.xml, k=10");
    }

    #[test]
    fn related_queries_embed_the_dataset_stem() {
        assert_eq!(file_stem("a/b/dblp.xml"), "dblp");
        assert!(is_related_query("data/dblp.xml", "q/dblp/dblp_q1.xml"));
        assert!(!is_related_query("data/dblp.xml", "q/xmark1/xmark1_q1.xml"));
        assert!(!is_related_query("data/xmark1.xml", "q/xmark16_q1.xml"));
    }

    #[test]
    fn stat_path_detects_rounds_label() {
        assert!(StatPath::new(["filter", "rounds"]).has_rounds());
        assert!(!StatPath::new(["filter", "global"]).has_rounds());
        assert_eq!(StatPath::new(["filter", "global"]).to_string(), "filter/global");
    }
}
