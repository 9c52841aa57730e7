use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;

use tk_types::{ExecutionResults, ExperimentInstanceKey, RawRun};
use tracing::{debug, info, warn};

use crate::HarnessError;
use crate::config::{ExecutableSpec, HarnessConfig, PRELOAD_ENV};

/// Runs `executable` `config.runs` times for every instance with at most
/// `config.max_processes` children alive at once.
///
/// Each child receives `k`, the dataset path and the query path appended to
/// the command. The preload library and extra variables are set on the
/// child only. Runs are stored in run order regardless of completion order.
pub fn run_sweep(
    config: &HarnessConfig,
    executable: &ExecutableSpec,
    instances: &[ExperimentInstanceKey],
) -> Result<ExecutionResults, HarnessError> {
    let jobs: Vec<(&ExperimentInstanceKey, usize)> = instances
        .iter()
        .flat_map(|key| (0..config.runs).map(move |run| (key, run)))
        .collect();
    let total = jobs.len();
    let queue = Mutex::new(jobs.into_iter());
    let finished: Mutex<Vec<(ExperimentInstanceKey, usize, RawRun)>> =
        Mutex::new(Vec::with_capacity(total));
    let workers = config.max_processes.clamp(1, total.max(1));

    info!(executable = %executable.name, jobs = total, workers, "spawning sweep");
    let (queue_ref, finished_ref) = (&queue, &finished);
    thread::scope(|scope| -> Result<(), HarnessError> {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(move || -> Result<(), HarnessError> {
                    loop {
                        let next = queue_ref.lock().map_err(|_| poisoned("job queue"))?.next();
                        let Some((key, run)) = next else {
                            return Ok(());
                        };
                        let output = run_instance(config, executable, key)?;
                        debug!(instance = %key, run, "run finished");
                        finished_ref
                            .lock()
                            .map_err(|_| poisoned("result list"))?
                            .push((key.clone(), run, output));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| HarnessError::Runner("sweep worker panicked".to_owned()))??;
        }
        Ok(())
    })?;

    let mut finished = finished
        .into_inner()
        .map_err(|_| poisoned("result list"))?;
    finished.sort_by(|left, right| (&left.0, left.1).cmp(&(&right.0, right.1)));

    let mut results = ExecutionResults::new(executable.name.clone());
    for (key, _, output) in finished {
        results.instances.entry(key).or_default().push(output);
    }
    info!(executable = %executable.name, instances = results.instances.len(), "all instances terminated");
    Ok(results)
}

fn poisoned(what: &str) -> HarnessError {
    HarnessError::Runner(format!("{what} lock poisoned"))
}

fn run_instance(
    config: &HarnessConfig,
    executable: &ExecutableSpec,
    key: &ExperimentInstanceKey,
) -> Result<RawRun, HarnessError> {
    let (program, args) = executable
        .command
        .split_first()
        .ok_or_else(|| HarnessError::InvalidExecutable(executable.name.clone()))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .arg(key.k.to_string())
        .arg(&key.dataset)
        .arg(&key.query)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(library) = &config.preload_library {
        command.env(PRELOAD_ENV, library);
    }
    command.envs(config.extra_env.iter().map(|(name, value)| (name, value)));

    let output = command.output().map_err(|source| HarnessError::Spawn {
        program: program.clone(),
        source,
    })?;
    if !output.status.success() {
        warn!(
            instance = %key,
            status = output.status.code().unwrap_or(-1),
            "engine exited unsuccessfully; output kept"
        );
    }
    Ok(RawRun {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
