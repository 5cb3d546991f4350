//! Engine error types with fix suggestions

use thiserror::Error;

use crate::interface::InterfaceFailure;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// Which side of an interface schema a field belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDirection {
    Input,
    Output,
}

impl std::fmt::Display for FieldDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldDirection::Input => write!(f, "input"),
            FieldDirection::Output => write!(f, "output"),
        }
    }
}

/// All error variants are part of the public API.
/// Construction-time errors (schema, names, cycles) abort before any node
/// executes; execution-time errors are scoped to a node and its dependents.
#[derive(Error, Debug)]
pub enum EngineError {
    // ─────────────────────────────────────────────────────────────
    // Construction-time: schema / graph authoring errors
    // ─────────────────────────────────────────────────────────────
    #[error("Interface '{interface}' declares no {direction} field '{field}'")]
    UnknownField {
        interface: String,
        field: String,
        direction: FieldDirection,
    },

    #[error("Input '{field}' on node '{node}' already has a source")]
    DuplicateBinding { node: String, field: String },

    #[error("Duplicate name '{name}' in workflow '{workflow}'")]
    DuplicateName { workflow: String, name: String },

    #[error("Invalid name '{name}': dots are reserved for workflow paths")]
    InvalidName { name: String },

    #[error("No node or workflow named '{name}' in workflow '{workflow}'")]
    UnknownNode { workflow: String, name: String },

    #[error("Dependency cycle through node '{node}'")]
    CyclicGraph { node: String },

    // ─────────────────────────────────────────────────────────────
    // Execution-time: scoped to one node
    // ─────────────────────────────────────────────────────────────
    #[error("Node '{node}' has no value for mandatory input '{field}'")]
    UnresolvedInput { node: String, field: String },

    #[error("Upstream output '{source_node}.{field}' needed by node '{node}' is not available")]
    UnresolvedUpstream {
        node: String,
        source_node: String,
        field: String,
    },

    #[error("Value for '{field}' on node '{node}' does not match declared type {expected}")]
    TypeMismatch {
        node: String,
        field: String,
        expected: String,
    },

    #[error("Interface run failed on node '{node}': {failure}")]
    InterfaceExecution {
        node: String,
        failure: InterfaceFailure,
    },

    // ─────────────────────────────────────────────────────────────
    // Environment / configuration
    // ─────────────────────────────────────────────────────────────
    #[error("Unknown execution plugin '{name}' (available: serial, pool, batch)")]
    UnknownPlugin { name: String },

    #[error("Invalid plugin arguments for '{plugin}': {details}")]
    PluginArgs { plugin: String, details: String },

    #[error("Pipeline file error: {0}")]
    PipelineFile(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixSuggestion for EngineError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            EngineError::UnknownField { .. } => {
                Some("Check the interface's declared fields; connections are validated at connect() time")
            }
            EngineError::DuplicateBinding { .. } => {
                Some("An input accepts exactly one provider; remove the earlier literal or edge")
            }
            EngineError::DuplicateName { .. } => {
                Some("Node and sub-workflow names must be unique within a workflow")
            }
            EngineError::InvalidName { .. } => {
                Some("Use plain identifiers; dotted paths are built by the engine when flattening")
            }
            EngineError::UnknownNode { .. } => {
                Some("Use the dotted path of a registered node, e.g. 'preproc.bet'")
            }
            EngineError::CyclicGraph { .. } => {
                Some("Pipelines must be acyclic; remove one edge on the reported cycle")
            }
            EngineError::UnresolvedInput { .. } => {
                Some("Bind the field with a literal value or connect an upstream output")
            }
            EngineError::UnresolvedUpstream { .. } => None,
            EngineError::TypeMismatch { .. } => {
                Some("Match the literal to the field's declared kind (file inputs need FieldValue::File)")
            }
            EngineError::InterfaceExecution { .. } => {
                Some("Inspect the node's working directory and crash record for stderr and inputs")
            }
            EngineError::UnknownPlugin { .. } => Some("Pick one of: serial, pool, batch"),
            EngineError::PluginArgs { .. } => {
                Some("Plugin arguments are a JSON object; see the plugin's settings struct")
            }
            EngineError::PipelineFile(_) => Some("Check node ids, edge endpoints and the schema line"),
            EngineError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            EngineError::Io(_) => Some("Check file path and permissions"),
        }
    }
}

impl EngineError {
    /// True for errors that can only arise while authoring the graph.
    /// These always abort a run before any interface executes.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownField { .. }
                | EngineError::DuplicateBinding { .. }
                | EngineError::DuplicateName { .. }
                | EngineError::InvalidName { .. }
                | EngineError::UnknownNode { .. }
                | EngineError::CyclicGraph { .. }
        )
    }
}
