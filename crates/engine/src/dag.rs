//! DAG validation and execution layering: run this before fingerprinting or
//! executing a graph.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the graph.
//! 2. Every edge must reference valid node IDs (both `from` and `to`).
//! 3. Task nodes must name a handler.
//! 4. The directed graph must be acyclic.
//!
//! Layers come from Kahn's algorithm applied one frontier at a time, so a
//! node's layer index is the length of the longest dependency chain ending
//! at it.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::{EngineError, models::Graph};

/// A set of nodes with no dependency among them whose dependencies all lie
/// in earlier layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionLayer {
    pub index: usize,
    /// Sorted node ids.
    pub nodes: Vec<String>,
}

/// Adjacency lookups for a graph, built once per run.
#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
    incoming_edges: HashMap<String, Vec<usize>>,
}

impl GraphIndex {
    /// Build the index. Parallel edges collapse into one adjacency entry but
    /// are all kept in `incoming_edges`.
    pub fn new(graph: &Graph) -> Self {
        let mut predecessors: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut successors: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut incoming_edges: HashMap<String, Vec<usize>> = HashMap::new();

        for node in &graph.nodes {
            predecessors.entry(node.id.clone()).or_default();
            successors.entry(node.id.clone()).or_default();
            incoming_edges.entry(node.id.clone()).or_default();
        }

        for (i, edge) in graph.edges.iter().enumerate() {
            successors
                .entry(edge.from.clone())
                .or_default()
                .insert(edge.to.clone());
            predecessors
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
            incoming_edges.entry(edge.to.clone()).or_default().push(i);
        }

        Self {
            predecessors: flatten(predecessors),
            successors: flatten(successors),
            incoming_edges,
        }
    }

    /// Direct predecessors, sorted.
    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct successors, sorted.
    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Indices into `graph.edges` of every edge ending at `id`.
    pub fn incoming_edges(&self, id: &str) -> &[usize] {
        self.incoming_edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn flatten(map: HashMap<String, BTreeSet<String>>) -> HashMap<String, Vec<String>> {
    map.into_iter()
        .map(|(k, v)| (k, v.into_iter().collect()))
        .collect()
}

/// Check ids, edge endpoints and handler names.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::MissingHandler`] if a task node names no handler.
pub fn check_structure(graph: &Graph) -> Result<(), EngineError> {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &graph.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
        let named = node.handler.as_deref().is_some_and(|h| !h.trim().is_empty());
        if !node.is_structural() && !named {
            return Err(EngineError::MissingHandler(node.id.clone()));
        }
    }

    for edge in &graph.edges {
        if !seen_ids.contains(edge.from.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.from.clone(),
                side: "from",
            });
        }
        if !seen_ids.contains(edge.to.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.to.clone(),
                side: "to",
            });
        }
    }

    Ok(())
}

/// Validate the graph and split it into execution layers.
///
/// Every node, structural ones included, appears in exactly one layer.
///
/// # Errors
/// Everything [`check_structure`] reports, plus
/// [`EngineError::CyclicGraph`] naming a node that lies on a cycle.
pub fn execution_layers(graph: &Graph) -> Result<Vec<ExecutionLayer>, EngineError> {
    check_structure(graph)?;
    let index = GraphIndex::new(graph);
    layers_from_index(graph, &index)
}

pub(crate) fn layers_from_index(
    graph: &Graph,
    index: &GraphIndex,
) -> Result<Vec<ExecutionLayer>, EngineError> {
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), index.predecessors(&n.id).len()))
        .collect();

    // Seed the frontier with nodes that have no incoming edges.
    let mut frontier: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    frontier.sort_unstable();

    let mut layers: Vec<ExecutionLayer> = Vec::new();
    let mut placed = 0usize;

    while !frontier.is_empty() {
        let mut next: Vec<&str> = Vec::new();
        for &node_id in &frontier {
            for neighbour in index.successors(node_id) {
                if let Some(deg) = in_degree.get_mut(neighbour.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(neighbour.as_str());
                    }
                }
            }
        }
        next.sort_unstable();

        placed += frontier.len();
        layers.push(ExecutionLayer {
            index: layers.len(),
            nodes: frontier.iter().map(|id| (*id).to_owned()).collect(),
        });
        frontier = next;
    }

    // If we didn't place every node the graph contains a cycle.
    if placed != graph.nodes.len() {
        let remaining: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&id, _)| id)
            .collect();
        return Err(EngineError::CyclicGraph {
            node_id: node_on_cycle(index, &remaining),
        });
    }

    Ok(layers)
}

/// Every unplaced node still has an unplaced predecessor, so walking
/// backwards through unplaced nodes must revisit one; that node is on a
/// cycle.
fn node_on_cycle(index: &GraphIndex, remaining: &BTreeSet<&str>) -> String {
    let Some(&first) = remaining.iter().next() else {
        return String::new();
    };

    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = first;
    while visited.insert(current) {
        match index
            .predecessors(current)
            .iter()
            .find(|p| remaining.contains(p.as_str()))
        {
            Some(pred) => current = pred.as_str(),
            None => break,
        }
    }
    current.to_owned()
}

/// Validate the graph and return its nodes in topological execution order.
pub fn validate_dag(graph: &Graph) -> Result<Vec<String>, EngineError> {
    Ok(execution_layers(graph)?
        .into_iter()
        .flat_map(|layer| layer.nodes)
        .collect())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, Node};

    fn make_graph(ids: &[&str], edges: &[(&str, &str)]) -> Graph {
        let mut graph = Graph::new("test");
        for id in ids {
            graph = graph.with_node(Node::task(*id, "mock"));
        }
        for (from, to) in edges {
            graph = graph.with_edge(Edge::new(*from, *to));
        }
        graph
    }

    fn layer_of(layers: &[ExecutionLayer]) -> HashMap<String, usize> {
        layers
            .iter()
            .flat_map(|l| l.nodes.iter().map(move |n| (n.clone(), l.index)))
            .collect()
    }

    /// Each node sits strictly after all its predecessors and exactly once.
    fn assert_valid_layering(graph: &Graph, layers: &[ExecutionLayer]) {
        let total: usize = layers.iter().map(|l| l.nodes.len()).sum();
        assert_eq!(total, graph.nodes.len(), "every node placed exactly once");

        let layer = layer_of(layers);
        assert_eq!(layer.len(), graph.nodes.len());
        for edge in &graph.edges {
            assert!(
                layer[&edge.to] > layer[&edge.from],
                "{} must come after {}",
                edge.to,
                edge.from
            );
        }
        for node in &graph.nodes {
            let preds: Vec<_> = graph.edges.iter().filter(|e| e.to == node.id).collect();
            let expected = preds.iter().map(|e| layer[&e.from] + 1).max().unwrap_or(0);
            assert_eq!(layer[&node.id], expected, "{} is in its earliest layer", node.id);
        }
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // A → B → C
        let graph = make_graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let sorted = validate_dag(&graph).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_layers_share_the_middle() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let graph = make_graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let layers = execution_layers(&graph).expect("should be valid");
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[1].nodes, vec!["b", "c"]);
        assert_valid_layering(&graph, &layers);
    }

    #[test]
    fn layer_is_longest_chain_not_shortest() {
        // a → b → c, and a shortcut a → c
        let graph = make_graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("a", "c")]);
        let layers = execution_layers(&graph).unwrap();
        assert_eq!(layer_of(&layers)["c"], 2);
    }

    #[test]
    fn generated_dags_layer_validly() {
        // Deterministic pseudo-random DAGs: edges only go from lower to
        // higher index, so every generated graph is acyclic.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for size in [1usize, 2, 5, 12, 30] {
            let ids: Vec<String> = (0..size).map(|i| format!("n{i:02}")).collect();
            let mut graph = Graph::new("generated");
            for id in &ids {
                graph = graph.with_node(Node::task(id.clone(), "mock"));
            }
            for i in 0..size {
                for j in (i + 1)..size {
                    if next() % 4 == 0 {
                        graph = graph.with_edge(Edge::new(ids[i].clone(), ids[j].clone()));
                    }
                }
            }
            let layers = execution_layers(&graph).expect("generated graph is acyclic");
            assert_valid_layering(&graph, &layers);
        }
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let graph = make_graph(&["a", "a"], &[]);
        assert!(matches!(
            execution_layers(&graph),
            Err(EngineError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let graph = make_graph(&["a"], &[("a", "ghost")]);
        assert!(matches!(
            execution_layers(&graph),
            Err(EngineError::UnknownNodeReference { node_id, side: "to" }) if node_id == "ghost"
        ));
    }

    #[test]
    fn task_without_handler_is_rejected() {
        let mut graph = make_graph(&["a"], &[]);
        graph.nodes[0].handler = None;
        assert!(matches!(
            execution_layers(&graph),
            Err(EngineError::MissingHandler(id)) if id == "a"
        ));
    }

    #[test]
    fn cycle_is_detected_and_names_a_cycle_member() {
        // entry → A → B → C → A, plus C → tail
        let graph = make_graph(
            &["entry", "a", "b", "c", "tail"],
            &[("entry", "a"), ("a", "b"), ("b", "c"), ("c", "a"), ("c", "tail")],
        );
        match execution_layers(&graph) {
            Err(EngineError::CyclicGraph { node_id }) => {
                assert!(["a", "b", "c"].contains(&node_id.as_str()), "got {node_id}");
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let graph = make_graph(&["a"], &[("a", "a")]);
        assert!(matches!(
            execution_layers(&graph),
            Err(EngineError::CyclicGraph { node_id }) if node_id == "a"
        ));
    }

    #[test]
    fn structural_nodes_are_layered_too() {
        let graph = Graph::new("g")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "mock"))
            .with_node(Node::end("end"))
            .connect("start", "a")
            .connect("a", "end");
        let layers = execution_layers(&graph).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].nodes, vec!["start"]);
        assert_eq!(layers[2].nodes, vec!["end"]);
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let graph = make_graph(&["solo"], &[]);
        let sorted = validate_dag(&graph).expect("single node should be valid");
        assert_eq!(sorted, vec!["solo"]);
    }
}
