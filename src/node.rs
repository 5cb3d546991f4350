//! Graph nodes: one interface bound to concrete inputs
//!
//! A node owns its interface, its input bindings (literals or edges to
//! upstream outputs), a working directory and lifecycle state. Execution is
//! cache-checked: the node's fingerprint is looked up before the interface
//! runs, and a successful run persists its result under that fingerprint.
//! A failed run never writes a cache entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::cache::{CacheEntry, CacheStore};
use crate::error::{EngineError, FieldDirection};
use crate::fingerprint::{self, Fingerprint};
use crate::interface::{Interface, RunContext};
use crate::schema::{FieldValue, ResolvedInputs};
use crate::store::{NodeResult, ResultStore};

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Cached,
    Done,
    Failed,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Cached | NodeState::Done | NodeState::Failed)
    }

    /// Terminal and usable as a dependency
    pub fn is_satisfied(self) -> bool {
        matches!(self, NodeState::Cached | NodeState::Done)
    }
}

/// Source of one input field's value
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Literal(FieldValue),
    /// Edge from an upstream node's output field
    Link { node: String, field: String },
}

/// Opt-in bounded retry of root-cause failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

/// One bound unit of work in the workflow graph
#[derive(Debug)]
pub struct Node {
    name: Arc<str>,
    interface: Arc<dyn Interface>,
    bindings: BTreeMap<String, Binding>,
    pub state: NodeState,
    pub retry: RetryPolicy,
}

impl Node {
    pub fn new(name: impl Into<String>, interface: Arc<dyn Interface>) -> Self {
        Self {
            name: Arc::from(name.into().as_str()),
            interface,
            bindings: BTreeMap::new(),
            state: NodeState::Pending,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryPolicy { max_retries };
        self
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn interface(&self) -> &Arc<dyn Interface> {
        &self.interface
    }

    pub fn bindings(&self) -> &BTreeMap<String, Binding> {
        &self.bindings
    }

    /// Register a source for `field`
    ///
    /// Fails if the field is not declared on the interface's input schema,
    /// if it already has a source, or if a literal does not match the
    /// declared kind. An input has at most one source.
    pub fn connect_input(
        &mut self,
        field: impl Into<String>,
        binding: Binding,
    ) -> Result<(), EngineError> {
        let field = field.into();
        let spec = self.interface.input_schema().get(&field).ok_or_else(|| {
            EngineError::UnknownField {
                interface: self.interface.name().to_string(),
                field: field.clone(),
                direction: FieldDirection::Input,
            }
        })?;

        if self.bindings.contains_key(&field) {
            return Err(EngineError::DuplicateBinding {
                node: self.name.to_string(),
                field,
            });
        }

        if let Binding::Literal(value) = &binding {
            if !value.conforms_to(&spec.kind) {
                return Err(EngineError::TypeMismatch {
                    node: self.name.to_string(),
                    field,
                    expected: spec.kind.to_string(),
                });
            }
        }

        self.bindings.insert(field, binding);
        Ok(())
    }

    /// Shorthand for a literal binding
    pub fn set_input(
        &mut self,
        field: impl Into<String>,
        value: FieldValue,
    ) -> Result<(), EngineError> {
        self.connect_input(field, Binding::Literal(value))
    }

    /// Names of upstream nodes this node's inputs reference
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.bindings.values().filter_map(|b| match b {
            Binding::Link { node, .. } => Some(node.as_str()),
            Binding::Literal(_) => None,
        })
    }

    /// Prefix this node's name and its link targets with a workflow path.
    /// Used when flattening nested workflows into one namespace.
    pub(crate) fn rebase(&mut self, prefix: &str) {
        if prefix.is_empty() {
            return;
        }
        self.name = Arc::from(format!("{}.{}", prefix, self.name));
        for binding in self.bindings.values_mut() {
            if let Binding::Link { node, .. } = binding {
                *node = format!("{}.{}", prefix, node);
            }
        }
    }

    /// Insert an already-absolute link binding during flattening
    pub(crate) fn bind_edge(
        &mut self,
        field: &str,
        source_node: String,
        source_field: String,
    ) -> Result<(), EngineError> {
        if self.bindings.contains_key(field) {
            return Err(EngineError::DuplicateBinding {
                node: self.name.to_string(),
                field: field.to_string(),
            });
        }
        self.bindings.insert(
            field.to_string(),
            Binding::Link {
                node: source_node,
                field: source_field,
            },
        );
        Ok(())
    }

    /// Produce the concrete input mapping for execution
    ///
    /// All upstream dependencies must already be satisfied in the store;
    /// anything else here is a scheduler bug and fails this node.
    pub fn resolve_inputs(&self, store: &ResultStore) -> Result<ResolvedInputs, EngineError> {
        let mut resolved = ResolvedInputs::new();

        for (field, spec) in self.interface.input_schema().iter() {
            let value = match self.bindings.get(field) {
                Some(Binding::Literal(value)) => Some(value.clone()),
                Some(Binding::Link { node, field: src_field }) => {
                    match store.get_output(node, src_field) {
                        Some(value) => Some(value),
                        None => {
                            return Err(EngineError::UnresolvedUpstream {
                                node: self.name.to_string(),
                                source_node: node.clone(),
                                field: src_field.clone(),
                            })
                        }
                    }
                }
                None => spec.default.clone(),
            };

            match value {
                Some(value) => {
                    resolved.insert(field.to_string(), value);
                }
                None if spec.mandatory => {
                    return Err(EngineError::UnresolvedInput {
                        node: self.name.to_string(),
                        field: field.to_string(),
                    })
                }
                None => {}
            }
        }

        Ok(resolved)
    }

    /// Cache key for the given resolved inputs
    ///
    /// Stable across process restarts and independent of the base directory:
    /// only interface identity and logical input values enter the digest.
    pub fn fingerprint(&self, inputs: &ResolvedInputs) -> Result<Fingerprint, EngineError> {
        fingerprint::fingerprint(self.interface.name(), self.interface.version(), inputs)
    }

    /// Working directory for this node under a base directory
    pub fn work_dir(&self, base: &Path) -> PathBuf {
        base.join("work").join(self.name.as_ref())
    }
}

/// Run one prepared node to completion (blocking)
///
/// Shared by every plugin variant: creates a clean working directory, runs
/// the interface with bounded retries, and persists the result to the cache
/// store on success only. Called through `spawn_blocking` from schedulers.
#[instrument(skip_all, fields(node = %name))]
pub fn execute_prepared(
    name: Arc<str>,
    interface: Arc<dyn Interface>,
    inputs: ResolvedInputs,
    fp: Fingerprint,
    work_dir: PathBuf,
    cache: CacheStore,
    retry: RetryPolicy,
) -> NodeResult {
    let started = Instant::now();

    if work_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            return NodeResult::failed(
                format!("could not clean working directory: {}", e),
                started.elapsed(),
            );
        }
    }
    if let Err(e) = std::fs::create_dir_all(&work_dir) {
        return NodeResult::failed(
            format!("could not create working directory: {}", e),
            started.elapsed(),
        );
    }

    let ctx = RunContext {
        work_dir: work_dir.clone(),
    };

    let mut attempt = 0u32;
    let failure = loop {
        match interface.run(&inputs, &ctx) {
            Ok(output) => {
                let runtime = started.elapsed();
                let entry = CacheEntry::new(
                    output.outputs.clone(),
                    output.exit_status,
                    output.stdout,
                    output.stderr,
                    work_dir.clone(),
                    runtime,
                );
                if let Err(e) = cache.store(&fp, &entry) {
                    // The computation succeeded; a failed cache write only
                    // costs a recomputation next run.
                    tracing::warn!(error = %e, "failed to persist cache entry");
                }
                return NodeResult::done(output.outputs, runtime, fp, work_dir);
            }
            Err(failure) if attempt < retry.max_retries => {
                attempt += 1;
                debug!(attempt, error = %failure, "retrying failed interface run");
            }
            Err(failure) => break failure,
        }
    };

    let err = EngineError::InterfaceExecution {
        node: name.to_string(),
        failure,
    };
    NodeResult::failed(err.to_string(), started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{FnInterface, InterfaceFailure};
    use crate::schema::{FieldKind, FieldSpec, OutputMap, Schema};

    fn square_interface() -> FnInterface {
        FnInterface::new(
            "square",
            Schema::new().field("x", FieldSpec::mandatory(FieldKind::Int)),
            Schema::new().field("y", FieldSpec::mandatory(FieldKind::Int)),
            |inputs| {
                let x = match inputs.get("x") {
                    Some(FieldValue::Int(x)) => *x,
                    _ => return Err(InterfaceFailure::new("missing x")),
                };
                let mut out = OutputMap::new();
                out.insert("y".to_string(), FieldValue::Int(x * x));
                Ok(out)
            },
        )
    }

    #[test]
    fn state_classification() {
        assert!(!NodeState::Pending.is_terminal());
        assert!(!NodeState::Running.is_terminal());
        assert!(NodeState::Cached.is_terminal());
        assert!(NodeState::Failed.is_terminal());
        assert!(NodeState::Done.is_satisfied());
        assert!(!NodeState::Failed.is_satisfied());
    }

    #[test]
    fn connect_unknown_field_is_schema_error() {
        let mut node = Node::new("square", Arc::new(square_interface()));
        let err = node.set_input("nope", FieldValue::Int(1)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownField { .. }));
    }

    #[test]
    fn double_binding_is_rejected() {
        let mut node = Node::new("square", Arc::new(square_interface()));
        node.set_input("x", FieldValue::Int(1)).unwrap();
        let err = node.set_input("x", FieldValue::Int(2)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateBinding { .. }));
    }

    #[test]
    fn literal_type_is_checked_at_connect_time() {
        let mut node = Node::new("square", Arc::new(square_interface()));
        let err = node.set_input("x", FieldValue::Str("three".into())).unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
    }

    #[test]
    fn resolve_missing_mandatory_input_fails() {
        let node = Node::new("square", Arc::new(square_interface()));
        let store = ResultStore::new();
        let err = node.resolve_inputs(&store).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedInput { .. }));
    }

    #[test]
    fn resolve_unfinished_upstream_fails() {
        let mut node = Node::new("addten", Arc::new(square_interface()));
        node.connect_input(
            "x",
            Binding::Link {
                node: "square".to_string(),
                field: "y".to_string(),
            },
        )
        .unwrap();
        let store = ResultStore::new();
        let err = node.resolve_inputs(&store).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedUpstream { .. }));
    }

    #[test]
    fn defaults_fill_unbound_optionals() {
        let iface = FnInterface::new(
            "smooth",
            Schema::new()
                .field("in_file", FieldSpec::mandatory(FieldKind::Str))
                .field(
                    "sigma",
                    FieldSpec::with_default(FieldKind::Float, FieldValue::Float(2.0)),
                ),
            Schema::new(),
            |_| Ok(OutputMap::new()),
        );
        let mut node = Node::new("smooth", Arc::new(iface));
        node.set_input("in_file", FieldValue::Str("t1.nii".into())).unwrap();

        let inputs = node.resolve_inputs(&ResultStore::new()).unwrap();
        assert_eq!(inputs.get("sigma"), Some(&FieldValue::Float(2.0)));
    }

    #[test]
    fn rebase_prefixes_name_and_links() {
        let mut node = Node::new("addten", Arc::new(square_interface()));
        node.connect_input(
            "x",
            Binding::Link {
                node: "square".to_string(),
                field: "y".to_string(),
            },
        )
        .unwrap();

        node.rebase("preproc");
        assert_eq!(node.name().as_ref(), "preproc.addten");
        assert_eq!(node.dependencies().collect::<Vec<_>>(), vec!["preproc.square"]);
    }

    #[test]
    fn execute_prepared_caches_success() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();

        let iface = Arc::new(square_interface());
        let node = Node::new("square", iface.clone());
        let mut inputs = ResolvedInputs::new();
        inputs.insert("x".to_string(), FieldValue::Int(3));
        let fp = node.fingerprint(&inputs).unwrap();

        let result = execute_prepared(
            node.name().clone(),
            iface,
            inputs,
            fp.clone(),
            dir.path().join("work/square"),
            cache.clone(),
            RetryPolicy::default(),
        );

        assert!(result.is_success());
        assert_eq!(result.outputs.get("y"), Some(&FieldValue::Int(9)));
        assert!(cache.lookup(&fp).is_some());
    }

    #[test]
    fn execute_prepared_failure_writes_no_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();

        let iface: Arc<dyn Interface> = Arc::new(FnInterface::new(
            "broken",
            Schema::new(),
            Schema::new(),
            |_| Err(InterfaceFailure::new("tool crashed")),
        ));
        let inputs = ResolvedInputs::new();
        let fp = fingerprint::fingerprint("broken", "0", &inputs).unwrap();

        let result = execute_prepared(
            Arc::from("broken"),
            iface,
            inputs,
            fp.clone(),
            dir.path().join("work/broken"),
            cache.clone(),
            RetryPolicy::default(),
        );

        assert!(!result.is_success());
        assert!(cache.lookup(&fp).is_none(), "failed run must not cache");
    }

    #[test]
    fn retries_are_bounded_and_counted() {
        let iface = FnInterface::new("flaky", Schema::new(), Schema::new(), |_| {
            Err(InterfaceFailure::new("always fails"))
        });
        let counter = iface.call_counter();
        let iface: Arc<dyn Interface> = Arc::new(iface);

        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path().join("cache")).unwrap();
        let inputs = ResolvedInputs::new();
        let fp = fingerprint::fingerprint("flaky", "0", &inputs).unwrap();

        let result = execute_prepared(
            Arc::from("flaky"),
            iface,
            inputs,
            fp,
            dir.path().join("work/flaky"),
            cache,
            RetryPolicy { max_retries: 2 },
        );

        assert!(!result.is_success());
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
