//! core::graph
//!
//! Module dependency graph and ordering.
//!
//! # Architecture
//!
//! The dependency graph is a DAG where:
//! - Nodes are modules (keyed by directory)
//! - Edges point from a module to each module it depends on
//!
//! # Invariants
//!
//! - Graph must be acyclic before an order is produced
//! - Every edge target must be a node (checked by the caller that builds
//!   the graph from discovered modules)
//! - Ordering is deterministic: ties are broken by node ordering

use std::collections::{BTreeMap, BTreeSet};

/// Dependency graph over any ordered node type.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N: Ord + Clone> {
    /// Dependencies of each node (node -> nodes it depends on).
    deps: BTreeMap<N, BTreeSet<N>>,
}

impl<N: Ord + Clone> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self {
            deps: BTreeMap::new(),
        }
    }
}

/// DFS marking state for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl<N: Ord + Clone> DependencyGraph<N> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no dependencies (no-op if already present).
    pub fn add_node(&mut self, node: N) {
        self.deps.entry(node).or_default();
    }

    /// Record that `node` depends on `dependency`.
    ///
    /// Both ends are added as nodes.
    pub fn add_dependency(&mut self, node: N, dependency: N) {
        self.deps.entry(dependency.clone()).or_default();
        self.deps.entry(node).or_default().insert(dependency);
    }

    /// Find a dependency cycle.
    ///
    /// Returns the nodes on the cycle in dependency order, with the first
    /// node repeated at the end (`[a, b, a]` for `a -> b -> a`).
    pub fn find_cycle(&self) -> Option<Vec<N>> {
        let mut marks: BTreeMap<&N, Mark> = BTreeMap::new();
        let mut path: Vec<&N> = Vec::new();

        for node in self.deps.keys() {
            if let Some(cycle) = self.visit(node, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a N,
        marks: &mut BTreeMap<&'a N, Mark>,
        path: &mut Vec<&'a N>,
    ) -> Option<Vec<N>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<N> = path[start..].iter().map(|n| (*n).clone()).collect();
                cycle.push(node.clone());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node, Mark::InProgress);
        path.push(node);

        if let Some(deps) = self.deps.get(node) {
            for dep in deps {
                if let Some(cycle) = self.visit(dep, marks, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    /// Compute a topological order: every node appears after all of its
    /// dependencies.
    ///
    /// Uses Kahn's algorithm, always taking the smallest ready node so the
    /// result is deterministic. Returns the cycle as `Err` if the graph is
    /// not acyclic.
    ///
    /// # Example
    ///
    /// ```
    /// use stackguard::core::graph::DependencyGraph;
    ///
    /// let mut graph = DependencyGraph::new();
    /// graph.add_dependency("stage", "mgmt");
    /// graph.add_dependency("prod", "mgmt");
    ///
    /// let order = graph.topological_order().unwrap();
    /// assert_eq!(order, vec!["mgmt", "prod", "stage"]);
    /// ```
    pub fn topological_order(&self) -> Result<Vec<N>, Vec<N>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(cycle);
        }

        let mut remaining: BTreeMap<&N, usize> =
            self.deps.iter().map(|(n, deps)| (n, deps.len())).collect();
        let mut ready: BTreeSet<&N> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.deps.len());

        while let Some(node) = ready.pop_first() {
            remaining.remove(node);
            order.push(node.clone());

            for (dependent, deps) in &self.deps {
                if deps.contains(node) {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
        }

        Ok(order)
    }
}
