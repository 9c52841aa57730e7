use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tk_types::{ExecutionResults, ExperimentInstanceKey, InstanceRuns, TreeDescriptor, is_related_query};

use crate::HarnessError;

/// Default file name of a persisted sweep inside its result directory.
pub const OUTPUTS_FILE: &str = "outs.json";

/// Dataset and query descriptors a sweep runs over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    #[serde(default)]
    pub datasets: Vec<TreeDescriptor>,
    #[serde(default)]
    pub queries: Vec<TreeDescriptor>,
}

impl Corpus {
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let mut corpus: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        corpus.sort();
        Ok(corpus)
    }

    /// Datasets by size in MB, queries by node count.
    pub fn sort(&mut self) {
        self.datasets
            .sort_by(|left, right| left.size_mb.total_cmp(&right.size_mb));
        self.queries.sort_by_key(|query| query.size_nodes);
    }

    /// Every related (dataset, query) pair crossed with `ks`, in sweep order.
    #[must_use]
    pub fn instances(&self, ks: &[u64]) -> Vec<ExperimentInstanceKey> {
        let mut instances = Vec::new();
        for dataset in &self.datasets {
            for query in &self.queries {
                if !is_related_query(&dataset.path, &query.path) {
                    continue;
                }
                instances.extend(
                    ks.iter()
                        .map(|&k| ExperimentInstanceKey::new(&dataset.path, &query.path, k)),
                );
            }
        }
        instances
    }

    /// Smallest number of queries sharing one node count.
    #[must_use]
    pub fn queries_per_size(&self) -> Option<usize> {
        min_count_per_size(&self.queries)
    }
}

#[must_use]
pub fn min_count_per_size(descriptors: &[TreeDescriptor]) -> Option<usize> {
    let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
    for descriptor in descriptors {
        *counts.entry(descriptor.size_nodes).or_default() += 1;
    }
    counts.into_values().min()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub dataset: String,
    pub query: String,
    pub k: u64,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
}

/// Everything a sweep produced, as persisted between the run and report
/// stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentOutputs {
    pub name: String,
    #[serde(default)]
    pub ks: Vec<u64>,
    #[serde(flatten)]
    pub corpus: Corpus,
    pub instances: Vec<InstanceRecord>,
}

impl ExperimentOutputs {
    #[must_use]
    pub fn from_results(results: &ExecutionResults, corpus: Corpus, ks: Vec<u64>) -> Self {
        Self {
            name: results.name.clone(),
            ks,
            corpus,
            instances: results
                .instances
                .iter()
                .map(|(key, runs)| InstanceRecord {
                    dataset: key.dataset.clone(),
                    query: key.query.clone(),
                    k: key.k,
                    stdout: runs.stdout.clone(),
                    stderr: runs.stderr.clone(),
                })
                .collect(),
        }
    }

    /// Keyed view of the persisted runs. Records repeating an instance are
    /// appended to its runs.
    #[must_use]
    pub fn results(&self) -> ExecutionResults {
        let mut instances: BTreeMap<ExperimentInstanceKey, InstanceRuns> = BTreeMap::new();
        for record in &self.instances {
            let runs = instances
                .entry(ExperimentInstanceKey::new(
                    &record.dataset,
                    &record.query,
                    record.k,
                ))
                .or_default();
            runs.stdout.extend(record.stdout.iter().cloned());
            runs.stderr.extend(record.stderr.iter().cloned());
        }
        ExecutionResults {
            name: self.name.clone(),
            instances,
        }
    }

    /// Ks of the sweep; falls back to the ks seen in the instances.
    #[must_use]
    pub fn sweep_ks(&self) -> Vec<u64> {
        if !self.ks.is_empty() {
            return self.ks.clone();
        }
        let mut ks: Vec<u64> = self.instances.iter().map(|record| record.k).collect();
        ks.sort_unstable();
        ks.dedup();
        ks
    }
}

pub fn load_outputs(path: &Path) -> Result<ExperimentOutputs, HarnessError> {
    let text = fs::read_to_string(path)?;
    let mut outputs: ExperimentOutputs = serde_json::from_str(&text)?;
    outputs.corpus.sort();
    Ok(outputs)
}

pub fn write_outputs(path: &Path, outputs: &ExperimentOutputs) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(outputs)?)?;
    Ok(())
}
