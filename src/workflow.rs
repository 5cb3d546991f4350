//! Nestable workflow container and flattening
//!
//! A workflow owns nodes and child workflows in a flat arena (`Vec` of
//! elements, name-indexed); nesting is expressed through indices, never
//! shared mutable references, so flattening is a plain read-only traversal.
//! Field-level edges are validated against the declared schemas at connect()
//! time; structural validity (acyclicity, single provider per input) is
//! established once at flatten() time and the execution plugins may assume
//! it thereafter.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::RunConfig;
use crate::dag::Dag;
use crate::error::{EngineError, FieldDirection};
use crate::node::Node;
use crate::plugin::{create_plugin, PipelineRun};
use crate::report::ExecutionReport;

/// Arena element: a leaf node or a nested workflow
#[derive(Debug)]
pub enum Element {
    Node(Node),
    Workflow(Workflow),
}

impl Element {
    fn name(&self) -> &str {
        match self {
            Element::Node(node) => node.name(),
            Element::Workflow(wf) => &wf.name,
        }
    }
}

/// A field-level edge, paths relative to the workflow that recorded it
#[derive(Debug, Clone)]
struct Edge {
    src: String,
    src_field: String,
    dst: String,
    dst_field: String,
}

/// Named, nestable container of nodes and child workflows
#[derive(Debug)]
pub struct Workflow {
    name: String,
    elements: Vec<Element>,
    /// First path segment -> arena index
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, element: Element) -> Result<(), EngineError> {
        let name = element.name().to_string();
        if name.is_empty() || name.contains('.') {
            return Err(EngineError::InvalidName { name });
        }
        if self.index.contains_key(&name) {
            return Err(EngineError::DuplicateName {
                workflow: self.name.clone(),
                name,
            });
        }
        self.index.insert(name, self.elements.len());
        self.elements.push(element);
        Ok(())
    }

    /// Register a node under this workflow's namespace
    pub fn add_node(&mut self, node: Node) -> Result<(), EngineError> {
        self.register(Element::Node(node))
    }

    /// Register a nested workflow
    pub fn add_workflow(&mut self, workflow: Workflow) -> Result<(), EngineError> {
        self.register(Element::Workflow(workflow))
    }

    /// Mutable access to a direct or nested node by dotted path
    pub fn node_mut(&mut self, path: &str) -> Result<&mut Node, EngineError> {
        let workflow_name = self.name.clone();
        match path.split_once('.') {
            None => match self.index.get(path).copied() {
                Some(i) => match &mut self.elements[i] {
                    Element::Node(node) => Ok(node),
                    Element::Workflow(_) => Err(EngineError::UnknownNode {
                        workflow: workflow_name,
                        name: path.to_string(),
                    }),
                },
                None => Err(EngineError::UnknownNode {
                    workflow: workflow_name,
                    name: path.to_string(),
                }),
            },
            Some((head, rest)) => match self.index.get(head).copied() {
                Some(i) => match &mut self.elements[i] {
                    Element::Workflow(wf) => wf.node_mut(rest),
                    Element::Node(_) => Err(EngineError::UnknownNode {
                        workflow: workflow_name,
                        name: path.to_string(),
                    }),
                },
                None => Err(EngineError::UnknownNode {
                    workflow: workflow_name,
                    name: path.to_string(),
                }),
            },
        }
    }

    /// Shared access to a direct or nested node by dotted path
    pub fn node(&self, path: &str) -> Result<&Node, EngineError> {
        match path.split_once('.') {
            None => match self.index.get(path).copied() {
                Some(i) => match &self.elements[i] {
                    Element::Node(node) => Ok(node),
                    Element::Workflow(_) => Err(self.unknown(path)),
                },
                None => Err(self.unknown(path)),
            },
            Some((head, rest)) => match self.index.get(head).copied() {
                Some(i) => match &self.elements[i] {
                    Element::Workflow(wf) => wf.node(rest),
                    Element::Node(_) => Err(self.unknown(path)),
                },
                None => Err(self.unknown(path)),
            },
        }
    }

    fn unknown(&self, path: &str) -> EngineError {
        EngineError::UnknownNode {
            workflow: self.name.clone(),
            name: path.to_string(),
        }
    }

    /// Whether `field` on the node at `path` already has a provider
    /// (a literal binding, a direct link, or an edge at any nesting level)
    fn input_has_source(&self, path: &str, field: &str) -> bool {
        if let Ok(node) = self.node(path) {
            if node.bindings().contains_key(field) {
                return true;
            }
        }
        if self
            .edges
            .iter()
            .any(|e| e.dst == path && e.dst_field == field)
        {
            return true;
        }
        if let Some((head, rest)) = path.split_once('.') {
            if let Some(i) = self.index.get(head).copied() {
                if let Element::Workflow(wf) = &self.elements[i] {
                    return wf.input_has_source(rest, field);
                }
            }
        }
        false
    }

    /// Add a directed data edge: `src.src_field -> dst.dst_field`
    ///
    /// Field names are validated against the declared schemas here, at
    /// connect time, so an undeclared field fails fast instead of at run
    /// time. A destination field accepts exactly one provider.
    pub fn connect(
        &mut self,
        src: &str,
        src_field: &str,
        dst: &str,
        dst_field: &str,
    ) -> Result<(), EngineError> {
        let src_node = self.node(src)?;
        if !src_node.interface().output_schema().contains(src_field) {
            return Err(EngineError::UnknownField {
                interface: src_node.interface().name().to_string(),
                field: src_field.to_string(),
                direction: FieldDirection::Output,
            });
        }

        let dst_node = self.node(dst)?;
        if !dst_node.interface().input_schema().contains(dst_field) {
            return Err(EngineError::UnknownField {
                interface: dst_node.interface().name().to_string(),
                field: dst_field.to_string(),
                direction: FieldDirection::Input,
            });
        }

        if self.input_has_source(dst, dst_field) {
            return Err(EngineError::DuplicateBinding {
                node: dst.to_string(),
                field: dst_field.to_string(),
            });
        }

        self.edges.push(Edge {
            src: src.to_string(),
            src_field: src_field.to_string(),
            dst: dst.to_string(),
            dst_field: dst_field.to_string(),
        });
        Ok(())
    }

    /// Recursively inline nested workflows into one leaf-node DAG
    ///
    /// Node names become dotted paths (`parent.child.node`) and every edge is
    /// re-expressed over leaf nodes. Acyclicity and the one-provider-per-input
    /// rule are enforced here; after a successful flatten the plugins never
    /// fail for structural reasons.
    pub fn flatten(self) -> Result<FlatWorkflow, EngineError> {
        let workflow_name = self.name.clone();
        let mut nodes: Vec<Node> = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();
        collect(self, "", &mut nodes, &mut edges);

        let mut node_map: HashMap<Arc<str>, Node> = HashMap::with_capacity(nodes.len());
        let mut names: Vec<Arc<str>> = Vec::with_capacity(nodes.len());
        for node in nodes {
            names.push(node.name().clone());
            node_map.insert(node.name().clone(), node);
        }

        // Apply field edges as link bindings on their destination nodes.
        // bind_edge re-checks the single-provider rule globally, catching a
        // parent edge and a child edge that target the same field.
        for edge in &edges {
            if !node_map.contains_key(edge.src.as_str()) {
                return Err(EngineError::UnknownNode {
                    workflow: workflow_name.clone(),
                    name: edge.src.clone(),
                });
            }
            let dst = node_map
                .get_mut(edge.dst.as_str())
                .ok_or_else(|| EngineError::UnknownNode {
                    workflow: workflow_name.clone(),
                    name: edge.dst.clone(),
                })?;
            dst.bind_edge(&edge.dst_field, edge.src.clone(), edge.src_field.clone())?;
        }

        // Node-level dependency edges come from the applied bindings, which
        // also covers links wired directly via Node::connect_input.
        let mut dag_edges: Vec<(Arc<str>, Arc<str>)> = Vec::new();
        for name in &names {
            let node = &node_map[name];
            for dep in node.dependencies() {
                let dep: Arc<str> = node_map
                    .get_key_value(dep)
                    .map(|(k, _)| Arc::clone(k))
                    .ok_or_else(|| EngineError::UnknownNode {
                        workflow: workflow_name.clone(),
                        name: dep.to_string(),
                    })?;
                dag_edges.push((dep, Arc::clone(name)));
            }
        }

        let dag = Dag::new(names, &dag_edges)?;
        // Cycles are a construction-time error; detect them now, not mid-run
        dag.topological_order()?;

        debug!(
            workflow = workflow_name,
            nodes = dag.len(),
            "workflow flattened"
        );

        Ok(FlatWorkflow {
            name: workflow_name,
            dag,
            nodes: node_map,
        })
    }

    /// Flatten, pick the named plugin and execute to completion
    pub async fn run(
        self,
        plugin_name: &str,
        config: RunConfig,
    ) -> Result<ExecutionReport, EngineError> {
        let flat = self.flatten()?;
        let plugin = create_plugin(plugin_name, &config.plugin_args)?;
        let mut run = PipelineRun::new(flat, config)?;
        plugin.run(&mut run).await
    }
}

fn collect(workflow: Workflow, prefix: &str, nodes: &mut Vec<Node>, edges: &mut Vec<Edge>) {
    let path = if prefix.is_empty() {
        String::new()
    } else {
        prefix.to_string()
    };

    for mut edge in workflow.edges {
        if !path.is_empty() {
            edge.src = format!("{}.{}", path, edge.src);
            edge.dst = format!("{}.{}", path, edge.dst);
        }
        edges.push(edge);
    }

    for element in workflow.elements {
        match element {
            Element::Node(mut node) => {
                node.rebase(&path);
                nodes.push(node);
            }
            Element::Workflow(child) => {
                let child_prefix = if path.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}.{}", path, child.name)
                };
                collect(child, &child_prefix, nodes, edges);
            }
        }
    }
}

/// One flattened, validated workflow ready for scheduling
#[derive(Debug)]
pub struct FlatWorkflow {
    pub name: String,
    pub dag: Dag,
    pub nodes: HashMap<Arc<str>, Node>,
}

impl FlatWorkflow {
    /// Graphviz DOT dump of the leaf-node graph
    pub fn to_dot(&self) -> String {
        self.dag.to_dot(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{FnInterface, InterfaceFailure};
    use crate::schema::{FieldKind, FieldSpec, FieldValue, OutputMap, Schema};

    fn int_interface(name: &str) -> Arc<FnInterface> {
        Arc::new(FnInterface::new(
            name,
            Schema::new().field("x", FieldSpec::mandatory(FieldKind::Int)),
            Schema::new().field("y", FieldSpec::mandatory(FieldKind::Int)),
            |inputs| {
                let x = match inputs.get("x") {
                    Some(FieldValue::Int(x)) => *x,
                    _ => return Err(InterfaceFailure::new("missing x")),
                };
                let mut out = OutputMap::new();
                out.insert("y".to_string(), FieldValue::Int(x + 1));
                Ok(out)
            },
        ))
    }

    fn node(name: &str) -> Node {
        Node::new(name, int_interface(name))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut wf = Workflow::new("test");
        wf.add_node(node("a")).unwrap();
        let err = wf.add_node(node("a")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateName { .. }));
    }

    #[test]
    fn dotted_names_are_rejected() {
        let mut wf = Workflow::new("test");
        let err = wf.add_node(node("a.b")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidName { .. }));
    }

    #[test]
    fn connect_validates_fields_at_call_time() {
        let mut wf = Workflow::new("test");
        wf.add_node(node("a")).unwrap();
        wf.add_node(node("b")).unwrap();

        let err = wf.connect("a", "nope", "b", "x").unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownField {
                direction: FieldDirection::Output,
                ..
            }
        ));

        let err = wf.connect("a", "y", "b", "nope").unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownField {
                direction: FieldDirection::Input,
                ..
            }
        ));

        wf.connect("a", "y", "b", "x").unwrap();
    }

    #[test]
    fn second_provider_for_same_input_is_rejected() {
        let mut wf = Workflow::new("test");
        wf.add_node(node("a")).unwrap();
        wf.add_node(node("b")).unwrap();
        wf.add_node(node("c")).unwrap();

        wf.connect("a", "y", "c", "x").unwrap();
        let err = wf.connect("b", "y", "c", "x").unwrap_err();
        assert!(matches!(err, EngineError::DuplicateBinding { .. }));
    }

    #[test]
    fn literal_then_edge_on_same_field_is_rejected() {
        let mut wf = Workflow::new("test");
        let mut b = node("b");
        b.set_input("x", FieldValue::Int(1)).unwrap();
        wf.add_node(node("a")).unwrap();
        wf.add_node(b).unwrap();

        let err = wf.connect("a", "y", "b", "x").unwrap_err();
        assert!(matches!(err, EngineError::DuplicateBinding { .. }));
    }

    #[test]
    fn connect_unknown_node_fails() {
        let mut wf = Workflow::new("test");
        wf.add_node(node("a")).unwrap();
        let err = wf.connect("a", "y", "ghost", "x").unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode { .. }));
    }

    #[test]
    fn flatten_rewrites_nested_names_to_dotted_paths() {
        let mut inner = Workflow::new("preproc");
        inner.add_node(node("bet")).unwrap();
        inner.add_node(node("fast")).unwrap();
        inner.connect("bet", "y", "fast", "x").unwrap();

        let mut outer = Workflow::new("pipeline");
        outer.add_workflow(inner).unwrap();
        outer.add_node(node("report")).unwrap();
        outer.connect("preproc.fast", "y", "report", "x").unwrap();

        let flat = outer.flatten().unwrap();
        assert_eq!(flat.dag.len(), 3);
        assert!(flat.dag.contains("preproc.bet"));
        assert!(flat.dag.contains("preproc.fast"));
        assert!(flat.dag.contains("report"));
        assert_eq!(
            flat.dag
                .dependencies("report")
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>(),
            vec!["preproc.fast"]
        );
    }

    #[test]
    fn flatten_detects_cycles() {
        let mut wf = Workflow::new("test");
        wf.add_node(node("a")).unwrap();
        wf.add_node(node("b")).unwrap();
        wf.connect("a", "y", "b", "x").unwrap();
        wf.connect("b", "y", "a", "x").unwrap();

        let err = wf.flatten().unwrap_err();
        assert!(matches!(err, EngineError::CyclicGraph { .. }));
    }

    #[test]
    fn cross_level_double_binding_is_rejected() {
        let mut inner = Workflow::new("inner");
        inner.add_node(node("src")).unwrap();
        inner.add_node(node("sink")).unwrap();
        inner.connect("src", "y", "sink", "x").unwrap();

        let mut outer = Workflow::new("outer");
        outer.add_node(node("other")).unwrap();
        outer.add_workflow(inner).unwrap();
        // The child's edge already provides sink.x
        let err = outer.connect("other", "y", "inner.sink", "x").unwrap_err();
        assert!(matches!(err, EngineError::DuplicateBinding { .. }));
    }

    #[test]
    fn two_level_nesting_flattens() {
        let mut level2 = Workflow::new("reg");
        level2.add_node(node("flirt")).unwrap();

        let mut level1 = Workflow::new("anat");
        level1.add_workflow(level2).unwrap();
        level1.add_node(node("bet")).unwrap();
        level1.connect("bet", "y", "reg.flirt", "x").unwrap();

        let mut top = Workflow::new("study");
        top.add_workflow(level1).unwrap();

        let flat = top.flatten().unwrap();
        assert!(flat.dag.contains("anat.reg.flirt"));
        assert!(flat.dag.contains("anat.bet"));
        assert_eq!(
            flat.dag
                .dependencies("anat.reg.flirt")
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>(),
            vec!["anat.bet"]
        );
    }
}
