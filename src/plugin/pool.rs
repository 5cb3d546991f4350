//! Pool plugin: bounded concurrent execution on the local machine
//!
//! Keeps up to `max_workers` nodes running at once on the blocking thread
//! pool. The scheduler alternates between a submission scan (everything whose
//! dependencies are satisfied, up to the worker bound) and waiting for one
//! completion, which may unblock further submissions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::error::EngineError;
use crate::event_log::EventKind;
use crate::node::{execute_prepared, NodeState};
use crate::report::ExecutionReport;
use crate::schema::ResolvedInputs;
use crate::store::NodeResult;

use super::{
    dependencies_satisfied, first_failed_dependency, prepare, record_cached, record_finished,
    record_preparation_failure, record_propagated, ExecutionPlugin, PipelineRun,
};

pub struct PoolPlugin;

#[async_trait]
impl ExecutionPlugin for PoolPlugin {
    fn name(&self) -> &'static str {
        "pool"
    }

    #[instrument(skip_all, fields(workflow = %run.name, workers = run.config.max_workers))]
    async fn run(&self, run: &mut PipelineRun) -> Result<ExecutionReport, EngineError> {
        let started = Instant::now();
        run.events.emit(EventKind::RunStarted {
            workflow: run.name.clone(),
            node_count: run.dag.len(),
        });

        let mut report = ExecutionReport::new(run.name.clone(), run.store.clone());
        // Topological order keeps the scan cheap: eligible nodes cluster at
        // the front of the queue.
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
                let handle = active.spawn_blocking(move || {
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
                });
                in_flight.insert(handle.id(), name);
                progress = true;
            }
            waiting = still_waiting;

            if active.is_empty() {
                if progress && !waiting.is_empty() {
                    // A cache hit or propagation may have unblocked more work
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
