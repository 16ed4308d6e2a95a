//! Read-side lineage queries over a set of nodes and edges.
//!
//! Uses petgraph's `DiGraphMap` keyed by [`NodeId`]. The tracker uses the same
//! representation for its reachability (cycle) checks.

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::event::{NodeId, TransformEdge, TransformNode};

/// Lineage graph of one run.
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    nodes: BTreeMap<NodeId, TransformNode>,
    graph: DiGraphMap<NodeId, ()>,
}

impl LineageGraph {
    /// Build from nodes and edges. Edges whose endpoints are not among
    /// `nodes` are ignored.
    pub fn from_parts(nodes: &[TransformNode], edges: &[TransformEdge]) -> Self {
        let mut graph = DiGraphMap::new();
        let mut by_id = BTreeMap::new();
        for node in nodes {
            graph.add_node(node.id);
            by_id.insert(node.id, node.clone());
        }
        for edge in edges {
            if by_id.contains_key(&edge.from) && by_id.contains_key(&edge.to) {
                graph.add_edge(edge.from, edge.to, ());
            }
        }
        Self {
            nodes: by_id,
            graph,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&TransformNode> {
        self.nodes.get(&id)
    }

    pub fn parents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.sorted_neighbors(id, Direction::Incoming)
    }

    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.sorted_neighbors(id, Direction::Outgoing)
    }

    /// Every node `id` transitively depends on, in ascending id order.
    pub fn ancestors_of(&self, id: NodeId) -> Vec<NodeId> {
        self.reachable(id, Direction::Incoming)
    }

    /// Every node transitively derived from `id`, in ascending id order.
    pub fn descendants_of(&self, id: NodeId) -> Vec<NodeId> {
        self.reachable(id, Direction::Outgoing)
    }

    /// Nodes with no inbound edge.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.graph.neighbors_directed(*id, Direction::Incoming).next().is_none())
            .collect()
    }

    /// Nodes with no outbound edge.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.graph.neighbors_directed(*id, Direction::Outgoing).next().is_none())
            .collect()
    }

    /// Nodes whose operation equals `operation`.
    pub fn filter_operation(&self, operation: &str) -> Vec<&TransformNode> {
        self.nodes
            .values()
            .filter(|n| n.operation == operation)
            .collect()
    }

    /// Topological order, ties broken by ascending node id.
    pub fn topological_order(&self) -> Vec<&TransformNode> {
        let mut indegree: BTreeMap<NodeId, usize> = self
            .nodes
            .keys()
            .map(|id| {
                (
                    *id,
                    self.graph
                        .neighbors_directed(*id, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for child in self.graph.neighbors_directed(id, Direction::Outgoing) {
                if let Some(d) = indegree.get_mut(&child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(child));
                    }
                }
            }
        }

        // Only reachable with a corrupted edge set; keep every node visible.
        if order.len() < self.nodes.len() {
            let seen: BTreeSet<NodeId> = order.iter().copied().collect();
            order.extend(self.nodes.keys().copied().filter(|id| !seen.contains(id)));
        }

        order.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    fn sorted_neighbors(&self, id: NodeId, dir: Direction) -> Vec<NodeId> {
        if !self.graph.contains_node(id) {
            return Vec::new();
        }
        let mut out: Vec<NodeId> = self.graph.neighbors_directed(id, dir).collect();
        out.sort();
        out
    }

    fn reachable(&self, id: NodeId, dir: Direction) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.sorted_neighbors(id, dir);
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            stack.extend(self.graph.neighbors_directed(current, dir));
        }
        seen.into_iter().collect()
    }
}
