//! Run configuration, threaded explicitly through `Workflow::run`
//!
//! No ambient globals: everything a run needs (base directory, worker bound,
//! backend-specific arguments) travels in one struct. Backend arguments are
//! an opaque JSON blob; each plugin deserializes its own settings from it and
//! ignores the rest.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Configuration for one `Workflow::run` call
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Everything lives under here: `work/` (node sandboxes), `cache/`
    /// (fingerprint store), `crash/` (failure records)
    pub base_dir: PathBuf,

    /// Worker bound for the pool plugin (and in-flight bound for batch)
    pub max_workers: usize,

    /// Opaque plugin-specific arguments (e.g. batch submit command)
    pub plugin_args: serde_json::Value,

    /// Cooperative run-level abort: stops new submissions, lets running
    /// nodes finish
    abort: Arc<AtomicBool>,
}

impl RunConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_workers: 4,
            plugin_args: serde_json::Value::Null,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_plugin_args(mut self, args: serde_json::Value) -> Self {
        self.plugin_args = args;
        self
    }

    /// Handle that outside code (signal handlers, UIs) can use to abort
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.abort),
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.base_dir.join("crash")
    }

    pub fn work_root(&self) -> &Path {
        &self.base_dir
    }
}

/// Cloneable run-abort switch
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_flag_is_shared() {
        let config = RunConfig::new("/tmp/run");
        let handle = config.abort_handle();
        assert!(!config.abort_requested());
        handle.abort();
        assert!(config.abort_requested());

        // Clones observe the same flag
        let clone = config.clone();
        assert!(clone.abort_requested());
    }

    #[test]
    fn worker_bound_is_at_least_one() {
        let config = RunConfig::new("/tmp/run").with_max_workers(0);
        assert_eq!(config.max_workers, 1);
    }
}
