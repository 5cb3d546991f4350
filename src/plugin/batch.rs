//! Batch plugin: hand nodes to an external queue as job scripts
//!
//! Interfaces that expose a [`BatchInterface`] surface are materialized as a
//! `job.sh` in the node's working directory, handed to a configurable submit
//! command (`sh` by default, `qsub`/`sbatch` in real deployments), and then
//! watched through a sentinel `exit_code` file the script drops on
//! completion. Interfaces without a batch surface fall back to local
//! execution on the blocking pool, so mixed workflows still run.
//!
//! Settings arrive through the run's opaque plugin argument blob:
//!
//! ```json
//! { "submit_cmd": "qsub", "submit_args": ["-cwd"], "poll_max_ms": 10000 }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::error::EngineError;
use crate::event_log::EventKind;
use crate::fingerprint::Fingerprint;
use crate::interface::Interface;
use crate::node::{execute_prepared, NodeState, RetryPolicy};
use crate::report::ExecutionReport;
use crate::schema::ResolvedInputs;
use crate::store::NodeResult;

use super::{
    dependencies_satisfied, first_failed_dependency, prepare, record_cached, record_finished,
    record_preparation_failure, record_propagated, ExecutionPlugin, PipelineRun,
};

/// Queue-facing knobs, deserialized from the run's plugin argument blob
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Command that receives the job script as its last argument
    pub submit_cmd: String,
    /// Arguments inserted before the script path
    pub submit_args: Vec<String>,
    /// Resubmissions attempted when the submit command itself fails
    pub max_submit_retries: u32,
    /// Initial sentinel poll interval; doubles up to `poll_max_ms`
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            submit_cmd: "sh".to_string(),
            submit_args: Vec::new(),
            max_submit_retries: 3,
            poll_initial_ms: 100,
            poll_max_ms: 5_000,
        }
    }
}

#[derive(Debug)]
pub struct BatchPlugin {
    settings: BatchSettings,
}

impl BatchPlugin {
    pub fn from_args(args: &serde_json::Value) -> Result<Self, EngineError> {
        let settings = match args {
            serde_json::Value::Null => BatchSettings::default(),
            other => serde_json::from_value(other.clone()).map_err(|e| {
                EngineError::PluginArgs {
                    plugin: "batch".to_string(),
                    details: e.to_string(),
                }
            })?,
        };
        Ok(Self { settings })
    }
}

#[async_trait]
impl ExecutionPlugin for BatchPlugin {
    fn name(&self) -> &'static str {
        "batch"
    }

    #[instrument(skip_all, fields(workflow = %run.name, submit = %self.settings.submit_cmd))]
    async fn run(&self, run: &mut PipelineRun) -> Result<ExecutionReport, EngineError> {
        let started = Instant::now();
        run.events.emit(EventKind::RunStarted {
            workflow: run.name.clone(),
            node_count: run.dag.len(),
        });

        let mut report = ExecutionReport::new(run.name.clone(), run.store.clone());
        let mut waiting: VecDeque<Arc<str>> = run.dag.topological_order()?.into();
        let mut active: JoinSet<(Arc<str>, ResolvedInputs, NodeResult)> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Arc<str>> = HashMap::new();

        loop {
            let mut progress = false;

            let mut still_waiting = VecDeque::with_capacity(waiting.len());
            while let Some(name) = waiting.pop_front() {
                if run.config.abort_requested() {
                    still_waiting.push_back(name);
                    continue;
                }
                if let Some(upstream) = first_failed_dependency(&run.dag, &run.store, &name) {
                    record_propagated(run, &mut report, &name, &upstream);
                    progress = true;
                    continue;
                }
                if !dependencies_satisfied(&run.dag, &run.store, &name) {
                    still_waiting.push_back(name);
                    continue;
                }
                if active.len() >= run.config.max_workers {
                    still_waiting.push_back(name);
                    continue;
                }

                if let Some(node) = run.nodes.get_mut(&name) {
                    node.state = NodeState::Ready;
                }
                run.events.emit(EventKind::NodeScheduled {
                    node: Arc::clone(&name),
                    dependencies: run.dag.dependencies(&name).to_vec(),
                });

                let prepared = match prepare(run, &name) {
                    Ok(prepared) => prepared,
                    Err(err) => {
                        record_preparation_failure(run, &mut report, &name, err);
                        progress = true;
                        continue;
                    }
                };

                if let Some(entry) = run.cache.lookup(&prepared.fingerprint) {
                    record_cached(run, &mut report, &name, &prepared, entry);
                    progress = true;
                    continue;
                }

                if let Some(node) = run.nodes.get_mut(&name) {
                    node.state = NodeState::Running;
                }
                run.events.emit(EventKind::NodeStarted {
                    node: Arc::clone(&name),
                    fingerprint: prepared.fingerprint.to_string(),
                });

                let interface = Arc::clone(run.nodes[name.as_ref()].interface());
                let retry = run.nodes[name.as_ref()].retry;
                let cache = run.cache.clone();
                let task_name = Arc::clone(&name);
                let handle = if interface.as_batch().is_some() {
                    let settings = self.settings.clone();
                    active.spawn(async move {
                        let result = run_batch_job(
                            Arc::clone(&task_name),
                            interface,
                            prepared.inputs.clone(),
                            prepared.fingerprint,
                            prepared.work_dir,
                            cache,
                            retry,
                            settings,
                        )
                        .await;
                        (task_name, prepared.inputs, result)
                    })
                } else {
                    // No command-line surface: run locally like the pool does
                    active.spawn_blocking(move || {
                        let result = execute_prepared(
                            Arc::clone(&task_name),
                            interface,
                            prepared.inputs.clone(),
                            prepared.fingerprint,
                            prepared.work_dir,
                            cache,
                            retry,
                        );
                        (task_name, prepared.inputs, result)
                    })
                };
                in_flight.insert(handle.id(), name);
                progress = true;
            }
            waiting = still_waiting;

            if active.is_empty() {
                if progress && !waiting.is_empty() {
                    continue;
                }
                break;
            }

            match active.join_next_with_id().await {
                Some(Ok((id, (name, inputs, result)))) => {
                    in_flight.remove(&id);
                    record_finished(run, &mut report, &name, result, inputs);
                }
                Some(Err(join_err)) => {
                    if let Some(name) = in_flight.remove(&join_err.id()) {
                        let result = NodeResult::failed(
                            format!("worker panicked: {}", join_err),
                            Duration::ZERO,
                        );
                        record_finished(run, &mut report, &name, result, ResolvedInputs::new());
                    }
                }
                None => {}
            }
        }

        if run.config.abort_requested() && !waiting.is_empty() {
            report.aborted = true;
            run.events.emit(EventKind::RunAborted);
        }

        report.duration = started.elapsed();
        run.events.emit(EventKind::RunCompleted {
            success: report.success(),
            total_duration_ms: report.duration.as_millis() as u64,
        });
        Ok(report)
    }
}

// ============================================================================
// JOB LIFECYCLE
// ============================================================================

/// Run one batchable node: script, submit, poll, collect, cache
#[allow(clippy::too_many_arguments)]
async fn run_batch_job(
    name: Arc<str>,
    interface: Arc<dyn Interface>,
    inputs: ResolvedInputs,
    fp: Fingerprint,
    work_dir: PathBuf,
    cache: CacheStore,
    retry: RetryPolicy,
    settings: BatchSettings,
) -> NodeResult {
    let started = Instant::now();

    let batch = match interface.as_batch() {
        Some(batch) => batch,
        None => {
            return NodeResult::failed(
                "interface has no batch surface".to_string(),
                started.elapsed(),
            )
        }
    };

    if work_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            return NodeResult::failed(
                format!("could not clean working directory: {}", e),
                started.elapsed(),
            );
        }
    }
    if let Err(e) = std::fs::create_dir_all(&work_dir) {
        return NodeResult::failed(
            format!("could not create working directory: {}", e),
            started.elapsed(),
        );
    }

    let argv = match batch.command_line(&inputs) {
        Ok(argv) => argv,
        Err(e) => return NodeResult::failed(e.to_string(), started.elapsed()),
    };
    let script = match write_job_script(&work_dir, &argv) {
        Ok(path) => path,
        Err(e) => {
            return NodeResult::failed(
                format!("could not write job script: {}", e),
                started.elapsed(),
            )
        }
    };

    let mut attempt = 0u32;
    loop {
        // Stale sentinel from a previous attempt would be read as completion
        let _ = std::fs::remove_file(work_dir.join("exit_code"));

        let exit_code = match submit_and_poll(&script, &work_dir, &settings).await {
            Ok(code) => code,
            Err(e) => return NodeResult::failed(e, started.elapsed()),
        };

        let stdout = std::fs::read_to_string(work_dir.join("stdout.log")).unwrap_or_default();
        let stderr = std::fs::read_to_string(work_dir.join("stderr.log")).unwrap_or_default();

        if exit_code != 0 {
            if attempt < retry.max_retries {
                attempt += 1;
                debug!(node = %name, attempt, exit_code, "retrying failed batch job");
                continue;
            }
            return NodeResult::failed(
                format!(
                    "batch job exited with status {}: {}",
                    exit_code,
                    stderr.trim()
                ),
                started.elapsed(),
            );
        }

        let outputs = match batch.collect_outputs(&inputs, &work_dir, &stdout) {
            Ok(outputs) => outputs,
            Err(e) => return NodeResult::failed(e.to_string(), started.elapsed()),
        };

        let runtime = started.elapsed();
        let entry = CacheEntry::new(
            outputs.clone(),
            Some(exit_code),
            stdout,
            stderr,
            work_dir.clone(),
            runtime,
        );
        if let Err(e) = cache.store(&fp, &entry) {
            warn!(node = %name, error = %e, "failed to persist cache entry");
        }
        return NodeResult::done(outputs, runtime, fp, work_dir);
    }
}

/// Submit the job script and poll the sentinel file until it appears
///
/// The submit command exiting nonzero without a sentinel means the queue
/// rejected the job; that is retried up to `max_submit_retries` times. A
/// successful submit whose job is still pending keeps polling with
/// exponential backoff.
async fn submit_and_poll(
    script: &Path,
    work_dir: &Path,
    settings: &BatchSettings,
) -> Result<i32, String> {
    let sentinel = work_dir.join("exit_code");
    let mut attempt = 0u32;

    'submit: loop {
        let mut cmd = tokio::process::Command::new(&settings.submit_cmd);
        cmd.args(&settings.submit_args)
            .arg(script)
            .current_dir(work_dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if attempt < settings.max_submit_retries {
                    attempt += 1;
                    warn!(attempt, error = %e, "submit command failed to spawn, retrying");
                    tokio::time::sleep(Duration::from_millis(settings.poll_initial_ms)).await;
                    continue 'submit;
                }
                return Err(format!(
                    "could not spawn submit command '{}': {}",
                    settings.submit_cmd, e
                ));
            }
        };

        let mut delay = Duration::from_millis(settings.poll_initial_ms.max(1));
        loop {
            if sentinel.exists() {
                let raw = std::fs::read_to_string(&sentinel)
                    .map_err(|e| format!("could not read exit sentinel: {}", e))?;
                return raw
                    .trim()
                    .parse::<i32>()
                    .map_err(|e| format!("malformed exit sentinel '{}': {}", raw.trim(), e));
            }

            if let Ok(Some(status)) = child.try_wait() {
                if !status.success() && !sentinel.exists() {
                    if attempt < settings.max_submit_retries {
                        attempt += 1;
                        warn!(attempt, %status, "submit command rejected the job, retrying");
                        tokio::time::sleep(delay).await;
                        continue 'submit;
                    }
                    return Err(format!(
                        "submit command '{}' exited with {}",
                        settings.submit_cmd, status
                    ));
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(settings.poll_max_ms.max(1)));
        }
    }
}

fn sh_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Write `job.sh`: runs the tool in the working directory, captures both
/// streams, and drops the exit code into the sentinel file
fn write_job_script(work_dir: &Path, argv: &[String]) -> std::io::Result<PathBuf> {
    let mut script = String::from("#!/bin/sh\n");
    let _ = writeln!(script, "cd {}", sh_quote(&work_dir.display().to_string()));
    let cmd: Vec<String> = argv.iter().map(|a| sh_quote(a)).collect();
    let _ = writeln!(script, "{} > stdout.log 2> stderr.log", cmd.join(" "));
    script.push_str("status=$?\necho $status > exit_code\nexit $status\n");

    let path = work_dir.join("job.sh");
    std::fs::write(&path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}
