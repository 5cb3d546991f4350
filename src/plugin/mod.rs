//! Pluggable execution backends
//!
//! A plugin walks the flattened DAG and decides when and where each node
//! runs, subject only to the dependency partial order. All variants share
//! the same contract:
//!
//! - a node is submitted exactly when every dependency reached Done/Cached
//! - a node whose dependency failed is marked Failed (propagated) without
//!   its interface ever running; independent branches continue
//! - submission order among simultaneously eligible nodes is unspecified
//!
//! Plugins are selected by name through [`create_plugin`].

mod batch;
mod pool;
mod serial;

pub use batch::{BatchPlugin, BatchSettings};
pub use pool::PoolPlugin;
pub use serial::SerialPlugin;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::RunConfig;
use crate::dag::Dag;
use crate::error::EngineError;
use crate::event_log::{EventKind, EventLog};
use crate::fingerprint::Fingerprint;
use crate::node::{Node, NodeState};
use crate::report::{self, ExecutionReport, NodeOutcome};
use crate::schema::ResolvedInputs;
use crate::store::{NodeResult, NodeStatus, ResultStore};
use crate::workflow::FlatWorkflow;

/// Everything one `Workflow::run` call owns while executing
pub struct PipelineRun {
    pub name: String,
    pub dag: Dag,
    pub nodes: HashMap<Arc<str>, Node>,
    pub config: RunConfig,
    pub cache: CacheStore,
    pub store: ResultStore,
    pub events: EventLog,
}

impl PipelineRun {
    pub fn new(flat: FlatWorkflow, config: RunConfig) -> Result<Self, EngineError> {
        let cache = CacheStore::open(config.cache_dir())?;
        Ok(Self {
            name: flat.name,
            dag: flat.dag,
            nodes: flat.nodes,
            config,
            cache,
            store: ResultStore::new(),
            events: EventLog::new(),
        })
    }
}

/// Scheduler/backend contract shared by every plugin variant
#[async_trait]
pub trait ExecutionPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Block until every reachable node is terminal (or the run aborts)
    async fn run(&self, run: &mut PipelineRun) -> Result<ExecutionReport, EngineError>;
}

impl std::fmt::Debug for dyn ExecutionPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlugin")
            .field("name", &self.name())
            .finish()
    }
}

static PLUGIN_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("linear", "serial"),
        ("debug", "serial"),
        ("local", "pool"),
        ("multiproc", "pool"),
        ("queue", "batch"),
        ("sge", "batch"),
    ])
});

/// Instantiate a plugin by name; `args` is an opaque, plugin-defined blob
pub fn create_plugin(
    name: &str,
    args: &serde_json::Value,
) -> Result<Box<dyn ExecutionPlugin>, EngineError> {
    let canonical = PLUGIN_ALIASES.get(name).copied().unwrap_or(name);
    match canonical {
        "serial" => Ok(Box::new(SerialPlugin)),
        "pool" => Ok(Box::new(PoolPlugin)),
        "batch" => Ok(Box::new(BatchPlugin::from_args(args)?)),
        _ => Err(EngineError::UnknownPlugin {
            name: name.to_string(),
        }),
    }
}

// ============================================================================
// SHARED SCHEDULING HELPERS
// ============================================================================

/// Node inputs resolved and fingerprinted, ready to submit
pub(crate) struct Prepared {
    pub inputs: ResolvedInputs,
    pub fingerprint: Fingerprint,
    pub work_dir: PathBuf,
}

pub(crate) fn prepare(run: &PipelineRun, name: &str) -> Result<Prepared, EngineError> {
    let node = &run.nodes[name];
    let inputs = node.resolve_inputs(&run.store)?;
    let fingerprint = node.fingerprint(&inputs)?;
    let work_dir = node.work_dir(run.config.work_root());
    Ok(Prepared {
        inputs,
        fingerprint,
        work_dir,
    })
}

/// First dependency of `name` that finished Failed, if any
pub(crate) fn first_failed_dependency(
    dag: &Dag,
    store: &ResultStore,
    name: &str,
) -> Option<Arc<str>> {
    dag.dependencies(name)
        .iter()
        .find(|dep| {
            store
                .get(dep)
                .map(|r| !r.is_success())
                .unwrap_or(false)
        })
        .cloned()
}

/// Whether every dependency of `name` reached Done/Cached
pub(crate) fn dependencies_satisfied(dag: &Dag, store: &ResultStore, name: &str) -> bool {
    dag.dependencies(name).iter().all(|dep| store.is_success(dep))
}

/// Mark a node failed because an upstream dependency failed
pub(crate) fn record_propagated(
    run: &mut PipelineRun,
    report: &mut ExecutionReport,
    name: &Arc<str>,
    upstream: &str,
) {
    if let Some(node) = run.nodes.get_mut(name) {
        node.state = NodeState::Failed;
    }
    let result = NodeResult::propagated(upstream);
    run.events.emit(EventKind::NodeFailed {
        node: Arc::clone(name),
        error: format!("upstream node '{}' failed", upstream),
        propagated: true,
    });
    report.record(
        Arc::clone(name),
        NodeOutcome::Failed {
            error: format!("upstream node '{}' failed", upstream),
            propagated: true,
        },
    );
    run.store.insert(Arc::clone(name), result);
}

/// Record a cache hit: the node reaches Cached without running
pub(crate) fn record_cached(
    run: &mut PipelineRun,
    report: &mut ExecutionReport,
    name: &Arc<str>,
    prepared: &Prepared,
    entry: crate::cache::CacheEntry,
) {
    if let Some(node) = run.nodes.get_mut(name) {
        node.state = NodeState::Cached;
    }
    run.events.emit(EventKind::NodeCacheHit {
        node: Arc::clone(name),
        fingerprint: prepared.fingerprint.to_string(),
    });
    info!(node = %name, fingerprint = prepared.fingerprint.short(), "cache hit, skipping execution");
    run.store.insert(
        Arc::clone(name),
        NodeResult::cached(entry.outputs, prepared.fingerprint.clone(), entry.work_dir),
    );
    report.record(Arc::clone(name), NodeOutcome::Cached);
}

/// Record a finished execution (Done or root-cause Failed)
///
/// Root-cause failures additionally drop a crash record under the run's
/// crash directory.
pub(crate) fn record_finished(
    run: &mut PipelineRun,
    report: &mut ExecutionReport,
    name: &Arc<str>,
    result: NodeResult,
    inputs: ResolvedInputs,
) {
    let outcome = NodeOutcome::from_status(&result.status);
    match &result.status {
        NodeStatus::Failed { error, .. } => {
            if let Some(node) = run.nodes.get_mut(name) {
                node.state = NodeState::Failed;
            }
            run.events.emit(EventKind::NodeFailed {
                node: Arc::clone(name),
                error: error.clone(),
                propagated: false,
            });
            report::write_crash_record(
                &run.config.crash_dir(),
                &run.name,
                name,
                error,
                inputs,
                result.work_dir.clone(),
            );
        }
        _ => {
            if let Some(node) = run.nodes.get_mut(name) {
                node.state = NodeState::Done;
            }
            run.events.emit(EventKind::NodeCompleted {
                node: Arc::clone(name),
                duration_ms: result.duration.as_millis() as u64,
            });
        }
    }
    report.record(Arc::clone(name), outcome);
    run.store.insert(Arc::clone(name), result);
}

/// Record a node that failed before its interface could run (resolution or
/// fingerprinting error). Treated as a root-cause failure of that node.
pub(crate) fn record_preparation_failure(
    run: &mut PipelineRun,
    report: &mut ExecutionReport,
    name: &Arc<str>,
    err: EngineError,
) {
    let result = NodeResult::failed(err.to_string(), std::time::Duration::ZERO);
    record_finished(run, report, name, result, ResolvedInputs::new());
}
