//! axonflow: a content-addressed DAG engine for tool pipelines
//!
//! Pipelines are graphs of nodes, each wrapping one interface (an external
//! tool or an in-process function) with a typed input/output schema. Nodes
//! connect field-to-field, workflows nest, and execution is handed to a
//! pluggable backend (serial, worker pool, or batch queue).
//!
//! Results are cached under a fingerprint of interface identity plus the
//! fully resolved inputs, with file inputs entering the digest by content.
//! Re-running an unchanged pipeline touches no tool; changing one upstream
//! value re-runs exactly the affected subgraph.
//!
//! ```no_run
//! use std::sync::Arc;
//! use axonflow::prelude::*;
//!
//! # async fn demo(square: Arc<dyn Interface>, addten: Arc<dyn Interface>) -> Result<(), EngineError> {
//! let mut wf = Workflow::new("demo");
//! wf.add_node(Node::new("square", square))?;
//! wf.add_node(Node::new("addten", addten))?;
//! wf.node_mut("square")?.set_input("x", FieldValue::Int(3))?;
//! wf.connect("square", "y", "addten", "x")?;
//!
//! let report = wf.run("pool", RunConfig::new("/tmp/demo")).await?;
//! assert!(report.success());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// GRAPH CONSTRUCTION
// ============================================================================

pub mod dag;
pub mod interface;
pub mod node;
pub mod pipeline_file;
pub mod schema;
pub mod workflow;

// ============================================================================
// EXECUTION
// ============================================================================

pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod plugin;
pub mod store;

// ============================================================================
// OBSERVABILITY
// ============================================================================

pub mod error;
pub mod event_log;
pub mod report;

/// The names most callers need
pub mod prelude {
    pub use crate::config::{AbortHandle, RunConfig};
    pub use crate::error::{EngineError, FixSuggestion};
    pub use crate::interface::{
        ArgSpec, CommandInterface, FnInterface, Interface, InterfaceFailure,
    };
    pub use crate::node::{Binding, Node};
    pub use crate::report::{ExecutionReport, NodeOutcome};
    pub use crate::schema::{FieldKind, FieldSpec, FieldValue, OutputMap, ResolvedInputs, Schema};
    pub use crate::workflow::Workflow;
}
