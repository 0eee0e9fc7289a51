//! Core domain models for the graph engine.
//!
//! These types are the source of truth for what a graph looks like in
//! memory, and they round-trip through JSON for graph definition files.

use std::collections::{BTreeMap, HashMap, HashSet};

use nodes::HandlerInputs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schedule::ScheduleConstraint;

// ---------------------------------------------------------------------------
// NodeType
// ---------------------------------------------------------------------------

/// Kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Structural entry marker; never executed, never fingerprinted.
    Start,
    /// Structural exit marker; never executed, never fingerprinted.
    End,
    /// Runs a registered handler.
    Task,
}

impl NodeType {
    pub fn is_structural(self) -> bool {
        matches!(self, NodeType::Start | NodeType::End)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single step in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within this graph (referenced by edges).
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Registry name of the handler; required for task nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Static inputs passed to the handler on every run.
    #[serde(default, skip_serializing_if = "HandlerInputs::is_empty")]
    pub inputs: HandlerInputs,
    /// Free-form annotations; not part of the graph's identity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Node {
    pub fn start(id: impl Into<String>) -> Self {
        Self::structural(id, NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::structural(id, NodeType::End)
    }

    pub fn task(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: NodeType::Task,
            handler: Some(handler.into()),
            inputs: HandlerInputs::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn structural(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            handler: None,
            inputs: HandlerInputs::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: HandlerInputs) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn is_structural(&self) -> bool {
        self.node_type.is_structural()
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge from one node to another, optionally gated by a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConstraint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            schedule: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleConstraint) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Inputs known before a run starts, keyed by node id.
pub type NodeInputs = HashMap<String, HandlerInputs>;

/// A complete graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// Stable identity; snapshots are stored under this id.
    pub id: String,
    /// Bumped by the host to invalidate every stored fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Shorthand for an unscheduled edge.
    pub fn connect(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.with_edge(Edge::new(from, to))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Ids of the nodes that receive run-level inputs: task nodes with no
    /// predecessors, or whose predecessors are all structural.
    pub fn entry_nodes(&self) -> Vec<&str> {
        let structural: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.is_structural())
            .map(|n| n.id.as_str())
            .collect();
        let fed_by_task: HashSet<&str> = self
            .edges
            .iter()
            .filter(|e| !structural.contains(e.from.as_str()))
            .map(|e| e.to.as_str())
            .collect();

        self.nodes
            .iter()
            .filter(|n| !n.is_structural() && !fed_by_task.contains(n.id.as_str()))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Per-node inputs known before execution: each node's static inputs,
    /// overlaid with `run_inputs` for entry nodes.
    pub fn resolve_inputs(&self, run_inputs: &HandlerInputs) -> NodeInputs {
        let entries: HashSet<&str> = self.entry_nodes().into_iter().collect();
        self.nodes
            .iter()
            .filter(|n| !n.is_structural())
            .map(|n| {
                let mut inputs = n.inputs.clone();
                if entries.contains(n.id.as_str()) {
                    inputs.merge(run_inputs);
                }
                (n.id.clone(), inputs)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline() -> Graph {
        Graph::new("g")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "echo").with_inputs(HandlerInputs::new().with("k", 1).unwrap()))
            .with_node(Node::task("b", "echo"))
            .with_node(Node::end("end"))
            .connect("start", "a")
            .connect("a", "b")
            .connect("b", "end")
    }

    #[test]
    fn entry_nodes_skip_structural_predecessors() {
        assert_eq!(pipeline().entry_nodes(), vec!["a"]);
    }

    #[test]
    fn run_inputs_only_reach_entry_nodes() {
        let run = HandlerInputs::new().with("x", 1).unwrap();
        let resolved = pipeline().resolve_inputs(&run);

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["a"].get::<i64>("x").unwrap(), 1);
        assert_eq!(resolved["a"].get::<i64>("k").unwrap(), 1);
        assert!(!resolved["b"].contains("x"));
    }

    #[test]
    fn graph_round_trips_through_json() {
        let raw = json!({
            "id": "g",
            "nodes": [
                { "id": "start", "type": "start" },
                { "id": "a", "type": "task", "handler": "echo", "inputs": { "x": 1 } }
            ],
            "edges": [
                { "from": "start", "to": "a", "schedule": { "cron": "*/5 * * * *" } }
            ]
        });
        let graph: Graph = serde_json::from_value(raw).expect("valid graph json");
        assert_eq!(graph.nodes[1].node_type, NodeType::Task);
        assert_eq!(graph.nodes[1].inputs.get::<i64>("x").unwrap(), 1);
        assert_eq!(graph.edges[0].schedule.as_ref().unwrap().tolerance_secs, 60);
    }

    #[test]
    fn graph_with_blank_input_name_is_rejected() {
        let raw = json!({
            "id": "g",
            "nodes": [
                { "id": "a", "type": "task", "handler": "echo", "inputs": { "  ": 1 } }
            ],
            "edges": []
        });
        assert!(serde_json::from_value::<Graph>(raw).is_err());
    }
}
