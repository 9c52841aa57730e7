use std::collections::BTreeMap;

use serde_json::Value;
use tk_types::{ExperimentInstanceKey, InstanceRuns, json_number};
use tracing::debug;

pub const TOTAL_TIMING_KEY: &str = "timingtotal";

/// Adds `filter.global.timingtotal = index.timingindexing +
/// filter.global.timingfiltering` to every JSON stdout run that reports both
/// timings. Returns the number of runs rewritten.
pub fn derive_total_timing(instances: &mut BTreeMap<ExperimentInstanceKey, InstanceRuns>) -> usize {
    let mut rewritten = 0;
    for (key, runs) in instances.iter_mut() {
        for (run, text) in runs.stdout.iter_mut().enumerate() {
            match with_total_timing(text) {
                Some(updated) => {
                    *text = updated;
                    rewritten += 1;
                }
                None => debug!(instance = %key, run, "no total timing derived"),
            }
        }
    }
    rewritten
}

fn with_total_timing(text: &str) -> Option<String> {
    let mut document: Value = serde_json::from_str(text).ok()?;
    let statistics = document.get_mut("statistics")?;
    let indexing = json_number(statistics.pointer("/index/timingindexing")?).ok()?;
    let global = statistics.pointer_mut("/filter/global")?.as_object_mut()?;
    let filtering = json_number(global.get("timingfiltering")?).ok()?;
    global.insert(TOTAL_TIMING_KEY.to_owned(), Value::from(indexing + filtering));
    serde_json::to_string(&document).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Value;
    use tk_types::{ExperimentInstanceKey, InstanceRuns};

    use super::derive_total_timing;

    #[test]
    fn total_timing_is_added_next_to_filtering_time() {
        let key = ExperimentInstanceKey::new("d.xml", "d_q.xml", 1);
        let mut instances = BTreeMap::from([(
            key.clone(),
            InstanceRuns {
                stdout: vec![
                    r#"{"statistics": {"index": {"timingindexing": 3}, "filter": {"global": {"timingfiltering": "4.5"}}}}"#.to_owned(),
                    r#"{"statistics": {"index": {}}}"#.to_owned(),
                    "plain".to_owned(),
                ],
                stderr: Vec::new(),
            },
        )]);
        assert_eq!(derive_total_timing(&mut instances), 1);
        let runs = &instances[&key];
        let document: Value = serde_json::from_str(&runs.stdout[0]).expect("json");
        assert_eq!(
            document.pointer("/statistics/filter/global/timingtotal"),
            Some(&Value::from(7.5))
        );
        assert_eq!(runs.stdout[2], "plain");
    }
}
