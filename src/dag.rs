//! Flattened dependency graph (Arc<str> keyed)
//!
//! Built once from a flattened workflow, validated once (acyclicity), then
//! shared read-only across scheduler workers. Uses Arc<str> for zero-cost
//! cloning of node names.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::EngineError;

/// DFS bookkeeping for the topological sort
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    /// Discovered but not yet fully explored (on the DFS stack)
    OnStack,
    Explored,
}

/// Immutable node-level dependency graph
#[derive(Debug)]
pub struct Dag {
    /// node -> successors
    adjacency: HashMap<Arc<str>, Vec<Arc<str>>>,
    /// node -> predecessors (dependencies)
    predecessors: HashMap<Arc<str>, Vec<Arc<str>>>,
    /// All node names in insertion order (keeps traversal deterministic)
    names: Vec<Arc<str>>,
    name_set: HashSet<Arc<str>>,
}

impl Dag {
    /// Build from node names plus (source, target) edges
    ///
    /// Edges referencing unknown nodes are a construction bug upstream and
    /// rejected here as a backstop.
    pub fn new(
        names: Vec<Arc<str>>,
        edges: &[(Arc<str>, Arc<str>)],
    ) -> Result<Self, EngineError> {
        let mut adjacency: HashMap<Arc<str>, Vec<Arc<str>>> =
            HashMap::with_capacity(names.len());
        let mut predecessors: HashMap<Arc<str>, Vec<Arc<str>>> =
            HashMap::with_capacity(names.len());
        let mut name_set: HashSet<Arc<str>> = HashSet::with_capacity(names.len());

        for name in &names {
            name_set.insert(Arc::clone(name));
            adjacency.insert(Arc::clone(name), Vec::new());
            predecessors.insert(Arc::clone(name), Vec::new());
        }

        for (source, target) in edges {
            for endpoint in [source, target] {
                if !name_set.contains(endpoint) {
                    return Err(EngineError::UnknownNode {
                        workflow: String::new(),
                        name: endpoint.to_string(),
                    });
                }
            }
            let successors = adjacency.entry(Arc::clone(source)).or_default();
            if !successors.contains(target) {
                successors.push(Arc::clone(target));
                predecessors
                    .entry(Arc::clone(target))
                    .or_default()
                    .push(Arc::clone(source));
            }
        }

        Ok(Self {
            adjacency,
            predecessors,
            names,
            name_set,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_set.contains(name)
    }

    /// Dependencies (upstream nodes) of one node
    #[inline]
    pub fn dependencies(&self, name: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.predecessors
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// Successors (downstream nodes) of one node
    #[inline]
    pub fn successors(&self, name: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.adjacency
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// Nodes with no dependencies
    pub fn roots(&self) -> Vec<Arc<str>> {
        self.names
            .iter()
            .filter(|name| self.dependencies(name).is_empty())
            .cloned()
            .collect()
    }

    /// Classic DFS topological sort with on-stack cycle detection
    ///
    /// Post-order append then reverse. A node re-encountered while still on
    /// the DFS stack is on a cycle; that raises `CyclicGraphError` naming it
    /// rather than failing silently, since cycles are always an authoring bug.
    pub fn topological_order(&self) -> Result<Vec<Arc<str>>, EngineError> {
        let mut marks: HashMap<&str, Mark> = self
            .names
            .iter()
            .map(|name| (name.as_ref(), Mark::Unvisited))
            .collect();
        let mut post_order: Vec<Arc<str>> = Vec::with_capacity(self.names.len());

        for name in &self.names {
            if marks[name.as_ref()] == Mark::Unvisited {
                self.visit(name, &mut marks, &mut post_order)?;
            }
        }

        post_order.reverse();
        Ok(post_order)
    }

    fn visit<'a>(
        &'a self,
        name: &'a Arc<str>,
        marks: &mut HashMap<&'a str, Mark>,
        post_order: &mut Vec<Arc<str>>,
    ) -> Result<(), EngineError> {
        marks.insert(name.as_ref(), Mark::OnStack);
        for next in self.successors(name) {
            match marks[next.as_ref()] {
                Mark::Unvisited => self.visit(next, marks, post_order)?,
                Mark::OnStack => {
                    return Err(EngineError::CyclicGraph {
                        node: next.to_string(),
                    })
                }
                Mark::Explored => {}
            }
        }
        marks.insert(name.as_ref(), Mark::Explored);
        post_order.push(Arc::clone(name));
        Ok(())
    }

    /// Whether `to` is reachable from `from` (BFS)
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            for next in self.successors(current) {
                if next.as_ref() == to {
                    return true;
                }
                if visited.insert(next.as_ref()) {
                    queue.push_back(next.as_ref());
                }
            }
        }

        false
    }

    /// Dump as Graphviz DOT for debugging
    pub fn to_dot(&self, graph_name: &str) -> String {
        let mut dot = format!("digraph \"{}\" {{\n", graph_name);
        for name in &self.names {
            let _ = writeln!(dot, "  \"{}\";", name);
        }
        for name in &self.names {
            for next in self.successors(name) {
                let _ = writeln!(dot, "  \"{}\" -> \"{}\";", name, next);
            }
        }
        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(names: &[&str], edges: &[(&str, &str)]) -> Result<Dag, EngineError> {
        let names: Vec<Arc<str>> = names.iter().map(|n| Arc::from(*n)).collect();
        let edges: Vec<(Arc<str>, Arc<str>)> = edges
            .iter()
            .map(|(a, b)| (Arc::from(*a), Arc::from(*b)))
            .collect();
        Dag::new(names, &edges)
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let dag = dag(
            &["bet", "fast", "flirt", "report"],
            &[("bet", "fast"), ("bet", "flirt"), ("fast", "report"), ("flirt", "report")],
        )
        .unwrap();

        let order = dag.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x.as_ref() == n).unwrap();
        assert!(pos("bet") < pos("fast"));
        assert!(pos("bet") < pos("flirt"));
        assert!(pos("fast") < pos("report"));
        assert!(pos("flirt") < pos("report"));
    }

    #[test]
    fn cycle_is_detected_and_named() {
        let dag = dag(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]).unwrap();
        let err = dag.topological_order().unwrap_err();
        match err {
            EngineError::CyclicGraph { node } => {
                assert!(["a", "b", "c"].contains(&node.as_str()));
            }
            other => panic!("expected CyclicGraph, got {other}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let dag = dag(&["a"], &[("a", "a")]).unwrap();
        assert!(matches!(
            dag.topological_order(),
            Err(EngineError::CyclicGraph { .. })
        ));
    }

    #[test]
    fn roots_and_dependencies() {
        let dag = dag(&["a", "b", "c"], &[("a", "c"), ("b", "c")]).unwrap();
        let roots: Vec<_> = dag.roots().iter().map(|n| n.to_string()).collect();
        assert_eq!(roots, vec!["a", "b"]);
        assert_eq!(dag.dependencies("c").len(), 2);
        assert!(dag.dependencies("a").is_empty());
    }

    #[test]
    fn duplicate_edges_collapse() {
        let dag = dag(&["a", "b"], &[("a", "b"), ("a", "b")]).unwrap();
        assert_eq!(dag.successors("a").len(), 1);
        assert_eq!(dag.dependencies("b").len(), 1);
    }

    #[test]
    fn has_path_follows_edges_only_forward() {
        let dag = dag(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c")]).unwrap();
        assert!(dag.has_path("a", "c"));
        assert!(!dag.has_path("c", "a"));
        assert!(!dag.has_path("a", "d"));
        assert!(dag.has_path("d", "d"));
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let err = dag(&["a"], &[("a", "ghost")]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode { .. }));
    }

    #[test]
    fn dot_output_lists_nodes_and_edges() {
        let dag = dag(&["a", "b"], &[("a", "b")]).unwrap();
        let dot = dag.to_dot("pipeline");
        assert!(dot.contains("digraph \"pipeline\""));
        assert!(dot.contains("\"a\" -> \"b\";"));
    }
}
