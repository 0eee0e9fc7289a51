//! Incremental execution: which nodes must run again?
//!
//! Fingerprints are computed in layer order, each from the node's inputs and
//! the fingerprints just computed for its predecessors. A node whose
//! fingerprint is missing from, or differs from, the previous snapshot is
//! affected, and so is everything downstream of it. Downstream nodes are
//! marked without re-checking their own fingerprints: their effective
//! inputs include everything upstream.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use nodes::HandlerInputs;
use tracing::debug;

use crate::dag::{self, ExecutionLayer, GraphIndex};
use crate::fingerprint::FingerprintCalculator;
use crate::models::{Graph, NodeInputs};
use crate::snapshot::GraphSnapshot;
use crate::EngineError;

/// Result of affected-node detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedNodes {
    /// Nodes that must execute this run. Never contains Start/End nodes.
    pub affected: BTreeSet<String>,
    /// Current-run fingerprint of every non-structural node.
    pub fingerprints: BTreeMap<String, String>,
    /// Hash of the graph the fingerprints were computed against.
    pub graph_hash: String,
}

impl AffectedNodes {
    pub fn is_affected(&self, node_id: &str) -> bool {
        self.affected.contains(node_id)
    }
}

/// Compares current fingerprints against a previous snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct AffectedNodeDetector {
    calculator: FingerprintCalculator,
}

impl AffectedNodeDetector {
    /// Compute the affected set for `graph` given the inputs known before
    /// execution (see [`Graph::resolve_inputs`]).
    ///
    /// With no previous snapshot every non-structural node is affected.
    pub fn detect(
        &self,
        previous: Option<&GraphSnapshot>,
        graph: &Graph,
        inputs: &NodeInputs,
    ) -> Result<AffectedNodes, EngineError> {
        dag::check_structure(graph)?;
        let index = GraphIndex::new(graph);
        let layers = dag::layers_from_index(graph, &index)?;
        Ok(self.detect_with(previous, graph, &index, &layers, inputs))
    }

    /// [`detect`](Self::detect) for callers that already hold the index and
    /// layers.
    pub fn detect_with(
        &self,
        previous: Option<&GraphSnapshot>,
        graph: &Graph,
        index: &GraphIndex,
        layers: &[ExecutionLayer],
        inputs: &NodeInputs,
    ) -> AffectedNodes {
        let graph_hash = self.calculator.graph_hash(graph);
        let structural: HashSet<&str> = graph
            .nodes
            .iter()
            .filter(|n| n.is_structural())
            .map(|n| n.id.as_str())
            .collect();

        let empty = HandlerInputs::new();
        let mut fingerprints: BTreeMap<String, String> = BTreeMap::new();
        let mut changed: Vec<&str> = Vec::new();

        for node_id in layers.iter().flat_map(|l| l.nodes.iter()) {
            if structural.contains(node_id.as_str()) {
                continue;
            }

            let upstream: BTreeMap<String, String> = index
                .predecessors(node_id)
                .iter()
                .filter_map(|p| fingerprints.get(p).map(|fp| (p.clone(), fp.clone())))
                .collect();
            let node_inputs = inputs.get(node_id).unwrap_or(&empty);
            let fingerprint = self
                .calculator
                .compute(node_id, node_inputs, &upstream, &graph_hash);

            if let Some(prev) = previous {
                if prev.fingerprint(node_id) != Some(fingerprint.as_str()) {
                    changed.push(node_id.as_str());
                }
            }
            fingerprints.insert(node_id.clone(), fingerprint);
        }

        let affected = match previous {
            None => fingerprints.keys().cloned().collect(),
            Some(_) => mark_downstream(index, &structural, &changed),
        };

        debug!(
            total = fingerprints.len(),
            affected = affected.len(),
            first_run = previous.is_none(),
            "computed affected nodes"
        );

        AffectedNodes {
            affected,
            fingerprints,
            graph_hash,
        }
    }
}

/// Mark `roots` and everything reachable from them, each node once.
fn mark_downstream(
    index: &GraphIndex,
    structural: &HashSet<&str>,
    roots: &[&str],
) -> BTreeSet<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    for &root in roots {
        if visited.insert(root) {
            queue.push_back(root);
        }
    }

    while let Some(node_id) = queue.pop_front() {
        for next in index.successors(node_id) {
            if visited.insert(next.as_str()) {
                queue.push_back(next.as_str());
            }
        }
    }

    visited
        .into_iter()
        .filter(|id| !structural.contains(id))
        .map(str::to_owned)
        .collect()
}
