use std::collections::{BTreeMap, BTreeSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::bundle::{Dependencies, Dependency};
use crate::dag::wiring::Wiring;
use crate::errors::{BundleError, Result};

/// One declared dependency plus its parsed wirings.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub key: String,
    pub dependency: Dependency,
    pub parameters: BTreeMap<String, Wiring>,
    pub credentials: BTreeMap<String, Wiring>,
}

impl DependencyNode {
    fn from_dependency(dep: &Dependency) -> Result<Self> {
        let parse_all = |wirings: &BTreeMap<String, String>| -> Result<BTreeMap<String, Wiring>> {
            wirings
                .iter()
                .map(|(name, raw)| Ok((name.clone(), Wiring::parse(raw)?)))
                .collect()
        };
        Ok(Self {
            key: dep.name.clone(),
            dependency: dep.clone(),
            parameters: parse_all(&dep.parameters)?,
            credentials: parse_all(&dep.credentials)?,
        })
    }

    /// Every `(dependency, output)` this node reads.
    pub fn output_references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters
            .values()
            .chain(self.credentials.values())
            .filter_map(Wiring::output_source)
    }
}

/// Graph of a bundle's direct dependencies.
///
/// An edge `a -> b` means `a` consumes an output of `b`, so `b` must run
/// first. Node indices follow `requires` order, lexical by name for a parsed
/// bundle, which is also the tie-break order of
/// [`DependencyGraph::topo_sort`].
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: Vec<DependencyNode>,
    index: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn build(deps: &Dependencies) -> Result<Self> {
        let mut g = DependencyGraph::default();

        for dep in deps.requires.iter() {
            let node = DependencyNode::from_dependency(dep)?;
            let idx = g.graph.add_node(node.key.clone());
            g.index.insert(node.key.clone(), idx);
            g.nodes.push(node);
        }

        for node in &g.nodes {
            let from = g.index[&node.key];
            for (target, output) in node.output_references() {
                let to = g.index.get(target).copied().ok_or_else(|| {
                    BundleError::invalid_manifest(format!(
                        "dependency {} wires output {output} of unknown dependency reference {target:?}",
                        node.key
                    ))
                })?;
                g.graph.update_edge(from, to, ());
            }
        }

        debug!(
            nodes = g.graph.node_count(),
            edges = g.graph.edge_count(),
            "built dependency graph"
        );
        Ok(g)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in `requires` order.
    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    pub fn node(&self, key: &str) -> Option<&DependencyNode> {
        self.index.get(key).map(|i| &self.nodes[i.index()])
    }

    /// Keys this node consumes outputs from, in `requires` order.
    pub fn dependencies_of(&self, key: &str) -> Vec<&str> {
        self.neighbours(key, Direction::Outgoing)
    }

    /// Keys consuming this node's outputs, in `requires` order.
    pub fn dependents_of(&self, key: &str) -> Vec<&str> {
        self.neighbours(key, Direction::Incoming)
    }

    fn neighbours(&self, key: &str, dir: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(key) else {
            return Vec::new();
        };
        let set: BTreeSet<usize> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| n.index())
            .collect();
        set.into_iter().map(|i| self.nodes[i].key.as_str()).collect()
    }

    /// Kahn's algorithm over the graph. A node is emitted only after every
    /// node it consumes from; simultaneously ready nodes come out in
    /// `requires` order.
    pub fn topo_sort(&self) -> Result<Vec<&DependencyNode>> {
        let n = self.nodes.len();
        let mut remaining: Vec<usize> = (0..n)
            .map(|i| {
                self.graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Outgoing)
                    .count()
            })
            .collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = ready.pop_first() {
            order.push(&self.nodes[i]);
            for consumer in self
                .graph
                .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
            {
                let c = consumer.index();
                remaining[c] -= 1;
                if remaining[c] == 0 {
                    ready.insert(c);
                }
            }
        }

        if order.len() < n {
            let path = self
                .find_cycle()
                .map(|p| p.join(" -> "))
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(BundleError::CyclicDependency { path });
        }
        Ok(order)
    }

    /// One concrete cycle, as the list of keys with the first repeated at
    /// the end (`a -> b -> a`). Self-dependencies yield `a -> a`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        fn visit(
            g: &DependencyGraph,
            i: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[i] = Mark::Grey;
            stack.push(i);
            let mut next: Vec<usize> = g
                .graph
                .neighbors_directed(NodeIndex::new(i), Direction::Outgoing)
                .map(|n| n.index())
                .collect();
            next.sort_unstable();
            next.dedup();
            for j in next {
                match marks[j] {
                    Mark::Grey => {
                        let start = stack.iter().position(|&s| s == j).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..]
                            .iter()
                            .map(|&s| g.nodes[s].key.clone())
                            .collect();
                        path.push(g.nodes[j].key.clone());
                        return Some(path);
                    }
                    Mark::White => {
                        if let Some(p) = visit(g, j, marks, stack) {
                            return Some(p);
                        }
                    }
                    Mark::Black => {}
                }
            }
            stack.pop();
            marks[i] = Mark::Black;
            None
        }

        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut stack = Vec::new();
        for i in 0..self.nodes.len() {
            if marks[i] == Mark::White {
                if let Some(p) = visit(self, i, &mut marks, &mut stack) {
                    return Some(p);
                }
            }
        }
        None
    }
}
