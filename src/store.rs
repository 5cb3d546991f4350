//! In-memory node result map shared across workers
//!
//! Lock-free via DashMap; every plugin variant writes results here as nodes
//! finish and input resolution reads upstream outputs from it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::fingerprint::Fingerprint;
use crate::schema::{FieldValue, OutputMap};

/// Terminal status of one node run
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    /// Interface actually ran and succeeded
    Done,
    /// Result reused from the cache store
    Cached,
    /// Interface raised, or an upstream dependency failed (`propagated`)
    Failed { error: String, propagated: bool },
}

impl NodeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Cached)
    }
}

/// One node's result with execution metadata
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub outputs: OutputMap,
    pub status: NodeStatus,
    pub duration: Duration,
    pub fingerprint: Option<Fingerprint>,
    pub work_dir: Option<PathBuf>,
}

impl NodeResult {
    pub fn done(
        outputs: OutputMap,
        duration: Duration,
        fingerprint: Fingerprint,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            outputs,
            status: NodeStatus::Done,
            duration,
            fingerprint: Some(fingerprint),
            work_dir: Some(work_dir),
        }
    }

    pub fn cached(outputs: OutputMap, fingerprint: Fingerprint, work_dir: PathBuf) -> Self {
        Self {
            outputs,
            status: NodeStatus::Cached,
            duration: Duration::ZERO,
            fingerprint: Some(fingerprint),
            work_dir: Some(work_dir),
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            outputs: OutputMap::new(),
            status: NodeStatus::Failed {
                error: error.into(),
                propagated: false,
            },
            duration,
            fingerprint: None,
            work_dir: None,
        }
    }

    pub fn propagated(upstream: &str) -> Self {
        Self {
            outputs: OutputMap::new(),
            status: NodeStatus::Failed {
                error: format!("upstream node '{}' failed", upstream),
                propagated: true,
            },
            duration: Duration::ZERO,
            fingerprint: None,
            work_dir: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Thread-safe node name -> NodeResult map
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: Arc<DashMap<Arc<str>, NodeResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: Arc<str>, result: NodeResult) {
        self.results.insert(node, result);
    }

    pub fn get(&self, node: &str) -> Option<NodeResult> {
        self.results.get(node).map(|r| r.clone())
    }

    pub fn contains(&self, node: &str) -> bool {
        self.results.contains_key(node)
    }

    pub fn is_success(&self, node: &str) -> bool {
        self.get(node).map(|r| r.is_success()).unwrap_or(false)
    }

    /// Look up one output field of a finished node
    pub fn get_output(&self, node: &str, field: &str) -> Option<FieldValue> {
        self.results
            .get(node)
            .and_then(|r| r.outputs.get(field).cloned())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
