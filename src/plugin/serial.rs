//! Serial plugin: one node at a time, in topological order
//!
//! The simplest scheduler and the reference for the shared contract. Useful
//! for debugging because node output ordering is deterministic.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::instrument;

use crate::error::EngineError;
use crate::event_log::EventKind;
use crate::node::{execute_prepared, NodeState};
use crate::report::ExecutionReport;
use crate::store::NodeResult;

use super::{
    first_failed_dependency, prepare, record_cached, record_finished, record_preparation_failure,
    record_propagated, ExecutionPlugin, PipelineRun,
};

pub struct SerialPlugin;

#[async_trait]
impl ExecutionPlugin for SerialPlugin {
    fn name(&self) -> &'static str {
        "serial"
    }

    #[instrument(skip_all, fields(workflow = %run.name))]
    async fn run(&self, run: &mut PipelineRun) -> Result<ExecutionReport, EngineError> {
        let started = Instant::now();
        run.events.emit(EventKind::RunStarted {
            workflow: run.name.clone(),
            node_count: run.dag.len(),
        });

        let mut report = ExecutionReport::new(run.name.clone(), run.store.clone());
        let order = run.dag.topological_order()?;

        for name in order {
            if run.config.abort_requested() {
                report.aborted = true;
                run.events.emit(EventKind::RunAborted);
                break;
            }

            run.events.emit(EventKind::NodeScheduled {
                node: Arc::clone(&name),
                dependencies: run.dag.dependencies(&name).to_vec(),
            });

            if let Some(upstream) = first_failed_dependency(&run.dag, &run.store, &name) {
                record_propagated(run, &mut report, &name, &upstream);
                continue;
            }

            if let Some(node) = run.nodes.get_mut(&name) {
                node.state = NodeState::Ready;
            }
            let prepared = match prepare(run, &name) {
                Ok(prepared) => prepared,
                Err(err) => {
                    record_preparation_failure(run, &mut report, &name, err);
                    continue;
                }
            };

            if let Some(entry) = run.cache.lookup(&prepared.fingerprint) {
                record_cached(run, &mut report, &name, &prepared, entry);
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
            let task_inputs = prepared.inputs.clone();
            let fp = prepared.fingerprint.clone();
            let work_dir = prepared.work_dir.clone();

            let result = tokio::task::spawn_blocking(move || {
                execute_prepared(task_name, interface, task_inputs, fp, work_dir, cache, retry)
            })
            .await
            .unwrap_or_else(|e| {
                NodeResult::failed(format!("worker panicked: {}", e), started.elapsed())
            });

            record_finished(run, &mut report, &name, result, prepared.inputs);
        }

        report.duration = started.elapsed();
        run.events.emit(EventKind::RunCompleted {
            success: report.success(),
            total_duration_ms: report.duration.as_millis() as u64,
        });
        Ok(report)
    }
}
