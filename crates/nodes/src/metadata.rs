//! `NodeExecutionMetadata`: one record per node execution attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Maximum number of parent execution ids kept for lineage tracing.
pub const MAX_LINEAGE: usize = 100;

#[derive(Debug)]
pub struct NodeExecutionMetadata {
    /// 0 for the first try, incremented on every retry or poll.
    pub attempt: u32,
    /// Why this attempt was started ("affected", "retry", "poll", ...).
    pub reason: String,
    /// Fresh for every attempt.
    pub execution_id: Uuid,
    /// Shared by every attempt of the same logical execution.
    pub correlation_id: Option<String>,
    pub started_at: DateTime<Utc>,
    lineage: VecDeque<Uuid>,
    values: Mutex<HashMap<String, Value>>,
}

impl NodeExecutionMetadata {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            attempt: 0,
            reason: reason.into(),
            execution_id: Uuid::new_v4(),
            correlation_id: None,
            started_at: Utc::now(),
            lineage: VecDeque::new(),
            values: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Metadata for the next attempt of the same logical execution.
    ///
    /// The correlation id carries over and this attempt's execution id is
    /// appended to the lineage, evicting the oldest entry beyond
    /// [`MAX_LINEAGE`]. Custom values start empty.
    pub fn next_attempt(&self, reason: impl Into<String>) -> Self {
        let mut lineage = self.lineage.clone();
        push_bounded(&mut lineage, self.execution_id);

        Self {
            attempt: self.attempt + 1,
            reason: reason.into(),
            execution_id: Uuid::new_v4(),
            correlation_id: self.correlation_id.clone(),
            started_at: Utc::now(),
            lineage,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Record a parent execution (for example the upstream run that
    /// triggered this one).
    pub fn add_parent(&mut self, execution_id: Uuid) {
        push_bounded(&mut self.lineage, execution_id);
    }

    /// Parent execution ids, oldest first.
    pub fn parent_execution_ids(&self) -> Vec<Uuid> {
        self.lineage.iter().copied().collect()
    }

    pub fn record_metric(&self, name: impl Into<String>, value: f64) {
        self.set_value(name, Value::from(value));
    }

    pub fn set_value(&self, name: impl Into<String>, value: Value) {
        self.lock_values().insert(name.into(), value);
    }

    pub fn value(&self, name: &str) -> Option<Value> {
        self.lock_values().get(name).cloned()
    }

    /// Copy of every custom value recorded for this attempt.
    pub fn values(&self) -> HashMap<String, Value> {
        self.lock_values().clone()
    }

    fn lock_values(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn push_bounded(lineage: &mut VecDeque<Uuid>, id: Uuid) {
    lineage.push_back(id);
    while lineage.len() > MAX_LINEAGE {
        lineage.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_attempt_keeps_correlation_and_links_parent() {
        let first = NodeExecutionMetadata::new("affected").with_correlation_id("sensor-1");
        let second = first.next_attempt("poll");

        assert_eq!(second.attempt, 1);
        assert_eq!(second.correlation_id.as_deref(), Some("sensor-1"));
        assert_ne!(second.execution_id, first.execution_id);
        assert_eq!(second.parent_execution_ids(), vec![first.execution_id]);
    }

    #[test]
    fn lineage_is_capped_and_evicts_oldest() {
        let mut meta = NodeExecutionMetadata::new("affected");
        let first_parent = Uuid::new_v4();
        meta.add_parent(first_parent);
        for _ in 0..MAX_LINEAGE {
            meta.add_parent(Uuid::new_v4());
        }

        let lineage = meta.parent_execution_ids();
        assert_eq!(lineage.len(), MAX_LINEAGE);
        assert!(!lineage.contains(&first_parent));
    }

    #[test]
    fn values_are_per_attempt() {
        let first = NodeExecutionMetadata::new("affected");
        first.record_metric("rows", 12.0);
        first.set_value("cursor", Value::from("abc"));
        assert_eq!(first.value("rows"), Some(Value::from(12.0)));

        let second = first.next_attempt("retry");
        assert!(second.values().is_empty());
    }
}
