// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::task::{Key, TaskGraph};
use crate::errors::{DistError, Result};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DagNode {
    /// Keys this one reads.
    deps: BTreeSet<Key>,
    /// Keys that read this one.
    dependents: BTreeSet<Key>,
}

/// `dependencies` / `dependents` adjacency of a task graph.
///
/// Construction rejects graphs that reference undefined keys or contain a
/// cycle, so every holder of a `DependencyIndex` can assume a well-formed DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyIndex {
    nodes: BTreeMap<Key, DagNode>,
    /// Topological order (dependencies before dependents).
    order: Vec<Key>,
}

impl DependencyIndex {
    /// Build the index from a task graph.
    pub fn from_graph(graph: &TaskGraph) -> Result<Self> {
        let mut nodes: BTreeMap<Key, DagNode> = BTreeMap::new();

        // First pass: dependencies straight from the expressions.
        for (key, expr) in graph.iter() {
            let deps = expr.references();
            for dep in deps.iter() {
                if !graph.contains_key(dep) {
                    return Err(DistError::MissingDependency {
                        key: key.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            nodes.insert(
                key.clone(),
                DagNode {
                    deps,
                    dependents: BTreeSet::new(),
                },
            );
        }

        // Second pass: dependents are the exact transpose.
        let edges: Vec<(Key, Key)> = nodes
            .iter()
            .flat_map(|(k, n)| n.deps.iter().map(move |d| (d.clone(), k.clone())))
            .collect();
        for (dep, key) in edges {
            if let Some(node) = nodes.get_mut(&dep) {
                node.dependents.insert(key);
            }
        }

        let order = topological_order(&nodes)?;
        Ok(Self { nodes, order })
    }

    /// Build directly from a `dependencies` map (keys absent from the map but
    /// mentioned as dependencies are added as leaves).
    pub fn from_dependencies(dependencies: &BTreeMap<Key, BTreeSet<Key>>) -> Result<Self> {
        let mut nodes: BTreeMap<Key, DagNode> = BTreeMap::new();
        for (key, deps) in dependencies {
            nodes.entry(key.clone()).or_default().deps = deps.clone();
            for dep in deps {
                nodes.entry(dep.clone()).or_default().dependents.insert(key.clone());
            }
        }
        let order = topological_order(&nodes)?;
        Ok(Self { nodes, order })
    }

    /// All keys, in key order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.nodes.contains_key(key)
    }

    /// Immediate dependencies of a key.
    pub fn dependencies_of(&self, key: &Key) -> &BTreeSet<Key> {
        static EMPTY: BTreeSet<Key> = BTreeSet::new();
        self.nodes.get(key).map(|n| &n.deps).unwrap_or(&EMPTY)
    }

    /// Immediate dependents of a key.
    pub fn dependents_of(&self, key: &Key) -> &BTreeSet<Key> {
        static EMPTY: BTreeSet<Key> = BTreeSet::new();
        self.nodes.get(key).map(|n| &n.dependents).unwrap_or(&EMPTY)
    }

    /// Keys nothing depends on.
    pub fn sinks(&self) -> BTreeSet<Key> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.dependents.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Dependencies before dependents.
    pub fn order(&self) -> &[Key] {
        &self.order
    }

    /// Materialized `dependencies` map.
    pub fn dependencies(&self) -> BTreeMap<Key, BTreeSet<Key>> {
        self.nodes
            .iter()
            .map(|(k, n)| (k.clone(), n.deps.clone()))
            .collect()
    }

    /// Materialized `dependents` map.
    pub fn dependents(&self) -> BTreeMap<Key, BTreeSet<Key>> {
        self.nodes
            .iter()
            .map(|(k, n)| (k.clone(), n.dependents.clone()))
            .collect()
    }
}

/// Edge direction: dep -> key. A topological sort fails iff there is a cycle.
fn topological_order(nodes: &BTreeMap<Key, DagNode>) -> Result<Vec<Key>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for key in nodes.keys() {
        graph.add_node(key.as_str());
    }
    for (key, node) in nodes.iter() {
        for dep in node.deps.iter() {
            graph.add_edge(dep.as_str(), key.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(Key::from).collect()),
        Err(cycle) => Err(DistError::CyclicGraph(format!(
            "cycle detected in task graph involving key '{}'",
            cycle.node_id()
        ))),
    }
}

/// Restrict `graph` to the `requested` keys and everything they transitively
/// depend on.
pub fn cull(graph: &TaskGraph, requested: &BTreeSet<Key>) -> Result<TaskGraph> {
    let mut out = TaskGraph::new();
    let mut stack: Vec<Key> = Vec::new();

    for key in requested {
        if !graph.contains_key(key) {
            return Err(DistError::UnknownKey(key.clone()));
        }
        stack.push(key.clone());
    }

    while let Some(key) = stack.pop() {
        if out.contains_key(&key) {
            continue;
        }
        let Some(expr) = graph.get(&key) else {
            // Reported with context by `DependencyIndex::from_graph`.
            continue;
        };
        stack.extend(expr.references());
        out.insert(key, expr.clone());
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::task::TaskExpr;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn set(keys: &[&str]) -> BTreeSet<Key> {
        keys.iter().map(|s| Key::from(*s)).collect()
    }

    fn chain_graph() -> TaskGraph {
        let mut g = TaskGraph::new();
        g.insert(k("x"), TaskExpr::literal(1));
        g.insert(k("y"), TaskExpr::apply("inc", vec![TaskExpr::key("x")]));
        g.insert(
            k("z"),
            TaskExpr::apply(
                "add",
                vec![
                    TaskExpr::apply("inc", vec![TaskExpr::key("y")]),
                    TaskExpr::key("x"),
                ],
            ),
        );
        g.insert(k("other"), TaskExpr::literal(5));
        g
    }

    #[test]
    fn dependents_are_transpose_of_dependencies() {
        let index = DependencyIndex::from_graph(&chain_graph()).unwrap();
        assert_eq!(index.dependencies_of(&k("z")), &set(&["x", "y"]));
        assert_eq!(index.dependents_of(&k("x")), &set(&["y", "z"]));
        assert!(index.dependents_of(&k("z")).is_empty());

        for key in index.keys() {
            for dep in index.dependencies_of(key) {
                assert!(index.dependents_of(dep).contains(key));
            }
            for dependent in index.dependents_of(key) {
                assert!(index.dependencies_of(dependent).contains(key));
            }
        }
    }

    #[test]
    fn order_puts_dependencies_first() {
        let index = DependencyIndex::from_graph(&chain_graph()).unwrap();
        let pos = |key: &str| index.order().iter().position(|o| o.as_str() == key).unwrap();
        assert!(pos("x") < pos("y"));
        assert!(pos("y") < pos("z"));
        assert_eq!(index.order().len(), 4);
    }

    #[test]
    fn sinks_have_no_dependents() {
        let index = DependencyIndex::from_graph(&chain_graph()).unwrap();
        assert_eq!(index.sinks(), set(&["other", "z"]));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = TaskGraph::new();
        g.insert(k("a"), TaskExpr::apply("inc", vec![TaskExpr::key("b")]));
        g.insert(k("b"), TaskExpr::apply("inc", vec![TaskExpr::key("a")]));
        match DependencyIndex::from_graph(&g) {
            Err(DistError::CyclicGraph(msg)) => assert!(msg.contains("cycle detected")),
            other => panic!("expected CyclicGraph, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut g = TaskGraph::new();
        g.insert(k("a"), TaskExpr::apply("inc", vec![TaskExpr::key("a")]));
        assert!(matches!(
            DependencyIndex::from_graph(&g),
            Err(DistError::CyclicGraph(_))
        ));
    }

    #[test]
    fn undefined_reference_is_rejected() {
        let mut g = TaskGraph::new();
        g.insert(k("a"), TaskExpr::apply("inc", vec![TaskExpr::key("ghost")]));
        match DependencyIndex::from_graph(&g) {
            Err(DistError::MissingDependency { key, dependency }) => {
                assert_eq!(key, k("a"));
                assert_eq!(dependency, k("ghost"));
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn cull_keeps_only_ancestors_of_requested_keys() {
        let culled = cull(&chain_graph(), &set(&["y"])).unwrap();
        assert_eq!(culled.keys().cloned().collect::<Vec<_>>(), vec![k("x"), k("y")]);
        assert!(matches!(
            cull(&chain_graph(), &set(&["nope"])),
            Err(DistError::UnknownKey(_))
        ));
    }

    #[test]
    fn from_dependencies_adds_implicit_leaves() {
        let mut deps = BTreeMap::new();
        deps.insert(k("y"), set(&["x"]));
        let index = DependencyIndex::from_dependencies(&deps).unwrap();
        assert!(index.contains(&k("x")));
        assert_eq!(index.dependents_of(&k("x")), &set(&["y"]));
    }
}
