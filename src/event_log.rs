//! Append-only run audit trail
//!
//! Thread-safe event log shared across scheduler workers:
//! - Event: envelope with id + timestamp + kind
//! - EventKind: run-level and node-level variants
//! - EventLog: cloneable handle over one shared, append-only list

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Single event in the run log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since run start (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// All event types
///
/// Uses Arc<str> for node fields to enable zero-cost cloning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // RUN LEVEL
    // ═══════════════════════════════════════════
    RunStarted {
        workflow: String,
        node_count: usize,
    },
    RunCompleted {
        success: bool,
        total_duration_ms: u64,
    },
    RunAborted,

    // ═══════════════════════════════════════════
    // NODE LEVEL
    // ═══════════════════════════════════════════
    NodeScheduled {
        node: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    NodeStarted {
        node: Arc<str>,
        fingerprint: String,
    },
    NodeCacheHit {
        node: Arc<str>,
        fingerprint: String,
    },
    NodeCompleted {
        node: Arc<str>,
        duration_ms: u64,
    },
    NodeFailed {
        node: Arc<str>,
        error: String,
        /// True when this node never ran because an upstream node failed
        propagated: bool,
    },
}

impl EventKind {
    /// Extract the node name if this is a node-level event
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeScheduled { node, .. }
            | Self::NodeStarted { node, .. }
            | Self::NodeCacheHit { node, .. }
            | Self::NodeCompleted { node, .. }
            | Self::NodeFailed { node, .. } => Some(node),
            Self::RunStarted { .. } | Self::RunCompleted { .. } | Self::RunAborted => None,
        }
    }

    pub fn is_run_event(&self) -> bool {
        matches!(
            self,
            Self::RunStarted { .. } | Self::RunCompleted { .. } | Self::RunAborted
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create a new event log (call at run start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };
        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Filter events by node name
    pub fn filter_node(&self, node: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.node() == Some(node))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let log = EventLog::new();
        let a = log.emit(EventKind::RunStarted {
            workflow: "wf".into(),
            node_count: 2,
        });
        let b = log.emit(EventKind::NodeCompleted {
            node: Arc::from("bet"),
            duration_ms: 5,
        });
        assert!(b > a);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn filter_by_node() {
        let log = EventLog::new();
        log.emit(EventKind::NodeStarted {
            node: Arc::from("bet"),
            fingerprint: "abc".into(),
        });
        log.emit(EventKind::NodeStarted {
            node: Arc::from("fast"),
            fingerprint: "def".into(),
        });
        log.emit(EventKind::NodeCompleted {
            node: Arc::from("bet"),
            duration_ms: 10,
        });

        let bet_events = log.filter_node("bet");
        assert_eq!(bet_events.len(), 2);
        assert!(bet_events.iter().all(|e| e.kind.node() == Some("bet")));
    }

    #[test]
    fn clones_share_the_log() {
        let log = EventLog::new();
        let clone = log.clone();
        clone.emit(EventKind::RunAborted);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_serialize_to_tagged_json() {
        let log = EventLog::new();
        log.emit(EventKind::NodeCacheHit {
            node: Arc::from("bet"),
            fingerprint: "abc123".into(),
        });
        let json = serde_json::to_string(&log.events()).unwrap();
        assert!(json.contains("\"type\":\"node_cache_hit\""));
    }
}
