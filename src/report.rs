//! Execution reports and crash records
//!
//! The report is the single source of truth for a run's outcome: every
//! reachable node appears with a terminal state, and root-cause failures are
//! distinguished from propagated ones. On a root-cause failure the engine
//! also drops a self-contained crash record (identity, resolved inputs,
//! error, working directory) so the node can be inspected and re-run in
//! isolation later.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::schema::ResolvedInputs;
use crate::store::{NodeStatus, ResultStore};

/// Terminal outcome of one node in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeOutcome {
    Done,
    Cached,
    Failed { error: String, propagated: bool },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Done | NodeOutcome::Cached)
    }

    pub fn from_status(status: &NodeStatus) -> Self {
        match status {
            NodeStatus::Done => NodeOutcome::Done,
            NodeStatus::Cached => NodeOutcome::Cached,
            NodeStatus::Failed { error, propagated } => NodeOutcome::Failed {
                error: error.clone(),
                propagated: *propagated,
            },
        }
    }
}

/// Summary of one `Workflow::run` call
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub workflow: String,
    outcomes: BTreeMap<Arc<str>, NodeOutcome>,
    /// Per-node results, retrievable even when the run as a whole failed
    pub results: ResultStore,
    pub duration: Duration,
    pub aborted: bool,
}

impl ExecutionReport {
    pub fn new(workflow: impl Into<String>, results: ResultStore) -> Self {
        Self {
            workflow: workflow.into(),
            outcomes: BTreeMap::new(),
            results,
            duration: Duration::ZERO,
            aborted: false,
        }
    }

    pub fn record(&mut self, node: Arc<str>, outcome: NodeOutcome) {
        self.outcomes.insert(node, outcome);
    }

    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(node)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &NodeOutcome)> {
        self.outcomes.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// True when every node reached Done or Cached
    pub fn success(&self) -> bool {
        !self.aborted && self.outcomes.values().all(|o| o.is_success())
    }

    pub fn completed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }

    /// Nodes that failed on their own, not because of an upstream failure
    pub fn root_failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|(node, outcome)| match outcome {
            NodeOutcome::Failed {
                error,
                propagated: false,
            } => Some((node.as_ref(), error.as_str())),
            _ => None,
        })
    }
}

/// Self-contained failure record for offline inspection and rerun
#[derive(Debug, Serialize, Deserialize)]
pub struct CrashRecord {
    pub node: String,
    pub workflow: String,
    pub error: String,
    pub inputs: ResolvedInputs,
    pub work_dir: Option<PathBuf>,
}

impl CrashRecord {
    /// Write the record as JSON under `crash_dir`, one file per failed node
    pub fn write(&self, crash_dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(crash_dir)?;
        // Node paths contain dots; keep them, they are fine in file names
        let path = crash_dir.join(format!("crash-{}.json", self.node));
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// Emit a crash record, logging rather than failing if the write itself fails
pub fn write_crash_record(
    crash_dir: &Path,
    workflow: &str,
    node: &str,
    err: &str,
    inputs: ResolvedInputs,
    work_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    let record = CrashRecord {
        node: node.to_string(),
        workflow: workflow.to_string(),
        error: err.to_string(),
        inputs,
        work_dir,
    };
    match record.write(crash_dir) {
        Ok(path) => Some(path),
        Err(e) => {
            error!(node, error = %e, "failed to write crash record");
            None
        }
    }
}
