//! Content fingerprints for incremental execution.
//!
//! A node's fingerprint is a SHA-256 digest over its id, the graph hash, its
//! inputs and its upstream fingerprints. Every field is length-framed and
//! JSON values are written with object keys sorted at every depth, so the
//! digest depends only on content, never on map iteration order.

use std::collections::BTreeMap;

use nodes::HandlerInputs;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::Graph;

const NODE_DOMAIN: &[u8] = b"graphflow/node/v1";
const GRAPH_DOMAIN: &[u8] = b"graphflow/graph/v1";

/// Deterministic content hasher for nodes and graphs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintCalculator;

impl FingerprintCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Fingerprint of one node for one run.
    ///
    /// Pure: identical arguments always give the identical 64-char hex
    /// string.
    pub fn compute(
        &self,
        node_id: &str,
        inputs: &HandlerInputs,
        upstream: &BTreeMap<String, String>,
        graph_hash: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        frame(&mut hasher, NODE_DOMAIN);
        frame(&mut hasher, node_id.as_bytes());
        frame(&mut hasher, graph_hash.as_bytes());

        hasher.update((inputs.len() as u64).to_le_bytes());
        for (name, value) in inputs.iter() {
            frame(&mut hasher, name.as_bytes());
            write_canonical(&mut hasher, value);
        }

        hasher.update((upstream.len() as u64).to_le_bytes());
        for (id, fingerprint) in upstream {
            frame(&mut hasher, id.as_bytes());
            frame(&mut hasher, fingerprint.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }

    /// Identity of a graph's structure: version, nodes (type, handler) and
    /// edges (endpoints, schedule). Static inputs are left out; they already
    /// feed each node's own fingerprint. Declaration order and free-form
    /// metadata do not matter.
    pub fn graph_hash(&self, graph: &Graph) -> String {
        let mut hasher = Sha256::new();
        frame(&mut hasher, GRAPH_DOMAIN);
        frame(&mut hasher, graph.version.as_deref().unwrap_or("").as_bytes());

        let mut nodes: Vec<_> = graph.nodes.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        hasher.update((nodes.len() as u64).to_le_bytes());
        for node in nodes {
            frame(&mut hasher, node.id.as_bytes());
            let kind = serde_json::to_value(node.node_type).unwrap_or(Value::Null);
            write_canonical(&mut hasher, &kind);
            frame(&mut hasher, node.handler.as_deref().unwrap_or("").as_bytes());
        }

        let mut edges: Vec<_> = graph
            .edges
            .iter()
            .map(|e| {
                let schedule = e
                    .schedule
                    .as_ref()
                    .map(|s| format!("{}|{}|{}", s.cron, s.timezone.as_deref().unwrap_or("UTC"), s.tolerance_secs))
                    .unwrap_or_default();
                (e.from.as_str(), e.to.as_str(), schedule)
            })
            .collect();
        edges.sort();
        hasher.update((edges.len() as u64).to_le_bytes());
        for (from, to, schedule) in edges {
            frame(&mut hasher, from.as_bytes());
            frame(&mut hasher, to.as_bytes());
            frame(&mut hasher, schedule.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}

fn frame(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Tag byte per JSON kind, then a kind-specific framed body.
fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([2u8]);
            frame(hasher, n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            frame(hasher, s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                write_canonical(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5u8]);
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            hasher.update((entries.len() as u64).to_le_bytes());
            for (key, item) in entries {
                frame(hasher, key.as_bytes());
                write_canonical(hasher, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Node;
    use serde_json::json;

    fn inputs(value: Value) -> HandlerInputs {
        serde_json::from_value(value).unwrap()
    }

    fn upstream(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn identical_arguments_give_identical_fingerprints() {
        let calc = FingerprintCalculator::new();
        let a = calc.compute("n", &inputs(json!({"x": 1, "y": [1, 2]})), &upstream(&[("u", "f")]), "g");
        let b = calc.compute("n", &inputs(json!({"y": [1, 2], "x": 1})), &upstream(&[("u", "f")]), "g");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn every_argument_changes_the_fingerprint() {
        let calc = FingerprintCalculator::new();
        let base = calc.compute("n", &inputs(json!({"x": 1})), &upstream(&[("u", "f")]), "g");

        assert_ne!(base, calc.compute("m", &inputs(json!({"x": 1})), &upstream(&[("u", "f")]), "g"));
        assert_ne!(base, calc.compute("n", &inputs(json!({"x": 2})), &upstream(&[("u", "f")]), "g"));
        assert_ne!(base, calc.compute("n", &inputs(json!({"x": 1})), &upstream(&[("u", "f2")]), "g"));
        assert_ne!(base, calc.compute("n", &inputs(json!({"x": 1})), &upstream(&[("u", "f")]), "g2"));
    }

    #[test]
    fn framing_prevents_concatenation_collisions() {
        let calc = FingerprintCalculator::new();
        let a = calc.compute("n", &inputs(json!({"ab": "c"})), &BTreeMap::new(), "g");
        let b = calc.compute("n", &inputs(json!({"a": "bc"})), &BTreeMap::new(), "g");
        assert_ne!(a, b);
        let c = calc.compute("n", &inputs(json!({"x": "1"})), &BTreeMap::new(), "g");
        let d = calc.compute("n", &inputs(json!({"x": 1})), &BTreeMap::new(), "g");
        assert_ne!(c, d);
    }

    #[test]
    fn nested_object_key_order_is_irrelevant() {
        let calc = FingerprintCalculator::new();
        let a = calc.compute("n", &inputs(json!({"cfg": {"a": 1, "b": {"c": 2, "d": 3}}})), &BTreeMap::new(), "g");
        let b = calc.compute("n", &inputs(json!({"cfg": {"b": {"d": 3, "c": 2}, "a": 1}})), &BTreeMap::new(), "g");
        assert_eq!(a, b);
    }

    #[test]
    fn graph_hash_ignores_declaration_order_but_not_structure() {
        let calc = FingerprintCalculator::new();
        let one = Graph::new("g")
            .with_node(Node::task("a", "h"))
            .with_node(Node::task("b", "h"))
            .connect("a", "b");
        let two = Graph::new("g")
            .with_node(Node::task("b", "h"))
            .with_node(Node::task("a", "h"))
            .connect("a", "b");
        assert_eq!(calc.graph_hash(&one), calc.graph_hash(&two));

        let rewired = Graph::new("g")
            .with_node(Node::task("a", "h"))
            .with_node(Node::task("b", "h"))
            .connect("b", "a");
        assert_ne!(calc.graph_hash(&one), calc.graph_hash(&rewired));
        assert_ne!(calc.graph_hash(&one), calc.graph_hash(&one.clone().with_version("2")));

        let mut configured = one.clone();
        configured.nodes[0].inputs = HandlerInputs::new().with("x", 1).unwrap();
        assert_eq!(calc.graph_hash(&one), calc.graph_hash(&configured));
    }
}
