//! Flow/Node data model. Read-only to the engine once submitted.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub type NodeId = String;

/// A directed acyclic graph of nodes, as loaded from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub nodes: HashMap<NodeId, Node>,
    pub edges: Vec<Edge>,
}

/// One (source, sourceHandle?, target, targetHandle?) edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source_node_id: NodeId,
    pub source_handle: Option<String>,
    pub target_node_id: NodeId,
    pub target_handle: Option<String>,
}

/// A single DAG vertex. `kind` determines which [`crate::executors::NodeExecutor`]
/// handles it and how `data` is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindTag {
    Source,
    Sink,
    Ai,
    Function,
    Router,
    Parallel,
    Loop,
}

/// Kind-specific configuration, parsed out of [`Node::data`] by each executor.
/// `NodeKindTag` alone is what the orchestrator uses for dispatch; this enum is
/// a convenience for strongly-typed access where helpful (e.g. validating a
/// `parallel` node's `processor_node_id` reference at compile time).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Sink {
        #[serde(default)]
        sink_type: SinkType,
    },
    Ai,
    Function,
    Router,
    Parallel {
        splitter_node_id: Option<NodeId>,
        processor_node_id: NodeId,
        merger_node_id: Option<NodeId>,
        #[serde(default)]
        concurrency_limit: Option<usize>,
    },
    Loop {
        body_node_id: NodeId,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
}

fn default_max_iterations() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    #[default]
    Output,
    Webhook,
    Database,
    Notification,
}

impl NodeKind {
    pub fn tag(&self) -> NodeKindTag {
        match self {
            NodeKind::Source => NodeKindTag::Source,
            NodeKind::Sink { .. } => NodeKindTag::Sink,
            NodeKind::Ai => NodeKindTag::Ai,
            NodeKind::Function => NodeKindTag::Function,
            NodeKind::Router => NodeKindTag::Router,
            NodeKind::Parallel { .. } => NodeKindTag::Parallel,
            NodeKind::Loop { .. } => NodeKindTag::Loop,
        }
    }
}

impl std::fmt::Display for NodeKindTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKindTag::Source => "source",
            NodeKindTag::Sink => "sink",
            NodeKindTag::Ai => "ai",
            NodeKindTag::Function => "function",
            NodeKindTag::Router => "router",
            NodeKindTag::Parallel => "parallel",
            NodeKindTag::Loop => "loop",
        };
        write!(f, "{s}")
    }
}

impl Flow {
    /// Incoming edges for `node_id`, in declaration order.
    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target_node_id == node_id).collect()
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source_node_id == node_id).collect()
    }

    pub fn sink_node_ids(&self) -> Vec<&NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.kind.tag() == NodeKindTag::Sink)
            .map(|(id, _)| id)
            .collect()
    }

    /// Validate edge endpoints resolve to known nodes.
    pub fn validate_edges(&self) -> Result<(), String> {
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source_node_id) {
                return Err(format!("edge references unknown source node: {}", edge.source_node_id));
            }
            if !self.nodes.contains_key(&edge.target_node_id) {
                return Err(format!("edge references unknown target node: {}", edge.target_node_id));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm: a topological ordering of node ids, or an error if the
    /// graph contains a cycle (sort length != node count).
    pub fn topological_order(&self) -> Result<Vec<NodeId>, String> {
        self.validate_edges()?;

        let mut indegree: HashMap<&NodeId, usize> = self.nodes.keys().map(|id| (id, 0usize)).collect();
        for edge in &self.edges {
            *indegree.get_mut(&edge.target_node_id).unwrap() += 1;
        }

        let mut queue: Vec<NodeId> = indegree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| (*id).clone())
            .collect();
        queue.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut indegree_mut: HashMap<NodeId, usize> = indegree.into_iter().map(|(k, v)| (k.clone(), v)).collect();
        let mut seen: HashSet<NodeId> = HashSet::new();

        while let Some(node_id) = queue.pop() {
            if !seen.insert(node_id.clone()) {
                continue;
            }
            order.push(node_id.clone());
            let mut newly_zero = Vec::new();
            for edge in self.outgoing_edges(&node_id) {
                let entry = indegree_mut.get_mut(&edge.target_node_id).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    newly_zero.push(edge.target_node_id.clone());
                }
            }
            newly_zero.sort();
            queue.extend(newly_zero);
        }

        if order.len() != self.nodes.len() {
            return Err(format!(
                "flow contains one or more cycles: only {} of {} nodes could be ordered",
                order.len(),
                self.nodes.len()
            ));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, kind: NodeKind) -> Node {
        Node { node_id: id.to_string(), kind, data: serde_json::json!({}) }
    }

    fn edge(src: &str, dst: &str) -> Edge {
        Edge {
            source_node_id: src.to_string(),
            source_handle: None,
            target_node_id: dst.to_string(),
            target_handle: None,
        }
    }

    #[test]
    fn topo_sort_orders_linear_chain() {
        let mut nodes = HashMap::new();
        nodes.insert("a".into(), node("a", NodeKind::Source));
        nodes.insert("b".into(), node("b", NodeKind::Ai));
        nodes.insert("c".into(), node("c", NodeKind::Sink { sink_type: SinkType::Output }));
        let flow = Flow {
            id: "f".into(),
            version: 1,
            name: "f".into(),
            nodes,
            edges: vec![edge("a", "b"), edge("b", "c")],
        };
        let order = flow.topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut nodes = HashMap::new();
        nodes.insert("a".into(), node("a", NodeKind::Ai));
        nodes.insert("b".into(), node("b", NodeKind::Ai));
        let flow = Flow {
            id: "f".into(),
            version: 1,
            name: "f".into(),
            nodes,
            edges: vec![edge("a", "b"), edge("b", "a")],
        };
        let err = flow.topological_order().unwrap_err();
        assert!(err.contains("cycles"));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut nodes = HashMap::new();
        nodes.insert("a".into(), node("a", NodeKind::Source));
        let flow = Flow {
            id: "f".into(),
            version: 1,
            name: "f".into(),
            nodes,
            edges: vec![edge("a", "ghost")],
        };
        assert!(flow.topological_order().is_err());
    }
}
