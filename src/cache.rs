//! Persistent fingerprint-keyed result store
//!
//! One directory per fingerprint under a base directory, each holding a
//! single `entry.json`. Writes go through a temp file plus rename so a
//! concurrent reader never observes a partial entry. A corrupt or unreadable
//! entry degrades to a cache miss with a warning: caching is an optimization,
//! never a correctness dependency.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::fingerprint::Fingerprint;
use crate::schema::OutputMap;

const ENTRY_FILE: &str = "entry.json";

/// Everything persisted for one completed node run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub outputs: OutputMap,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Working directory the run executed in (informational; not hashed)
    pub work_dir: PathBuf,
    pub created_unix: u64,
    pub runtime_ms: u64,
}

impl CacheEntry {
    pub fn new(
        outputs: OutputMap,
        exit_status: Option<i32>,
        stdout: String,
        stderr: String,
        work_dir: PathBuf,
        runtime: Duration,
    ) -> Self {
        Self {
            outputs,
            exit_status,
            stdout,
            stderr,
            work_dir,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            runtime_ms: runtime.as_millis() as u64,
        }
    }
}

/// Durable fingerprint -> CacheEntry map on the filesystem
///
/// Cheap to clone; clones share the same base directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(fp.as_str()).join(ENTRY_FILE)
    }

    /// Look up a previous result; corruption is a miss, never an error
    pub fn lookup(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        let path = self.entry_path(fp);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(fingerprint = fp.short(), error = %e, "cache entry unreadable, treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => {
                debug!(fingerprint = fp.short(), "cache hit");
                Some(entry)
            }
            Err(e) => {
                warn!(fingerprint = fp.short(), error = %e, "cache entry corrupt, treating as miss");
                None
            }
        }
    }

    /// Persist a result atomically (temp file in the same directory, then rename)
    pub fn store(&self, fp: &Fingerprint, entry: &CacheEntry) -> Result<(), EngineError> {
        let dir = self.root.join(fp.as_str());
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, entry)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        tmp.flush()?;
        tmp.persist(dir.join(ENTRY_FILE))
            .map_err(|e| EngineError::Io(e.error))?;

        debug!(fingerprint = fp.short(), "cache entry stored");
        Ok(())
    }

    /// Manual invalidation; absence is not an error
    pub fn invalidate(&self, fp: &Fingerprint) -> Result<(), EngineError> {
        let dir = self.root.join(fp.as_str());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}
