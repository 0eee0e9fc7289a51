//! `ManagedContext`: per-run progress and metrics, shared by every node of
//! the run.
//!
//! Sibling nodes in one layer run concurrently and all of them may touch the
//! same context, so every mutation is either atomic or taken under a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ContextError;

/// Sentinel stored in `estimated_total` while no estimate has been set.
const NO_ESTIMATE: u64 = u64::MAX;

#[derive(Debug)]
pub struct ManagedContext {
    started: Instant,
    step: AtomicU64,
    estimated_total: AtomicU64,
    metrics: Mutex<HashMap<String, f64>>,
    is_last_node: AtomicBool,
}

impl Default for ManagedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            step: AtomicU64::new(0),
            estimated_total: AtomicU64::new(NO_ESTIMATE),
            metrics: Mutex::new(HashMap::new()),
            is_last_node: AtomicBool::new(false),
        }
    }

    /// Advance the step counter by one and return the new value.
    pub fn increment_step(&self) -> u64 {
        self.step.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current_step(&self) -> u64 {
        self.step.load(Ordering::Acquire)
    }

    /// Wall-clock time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_estimated_total_steps(&self, total: u64) {
        // The sentinel is reserved; an estimate that large is as good as none.
        self.estimated_total
            .store(total.min(NO_ESTIMATE - 1), Ordering::Release);
    }

    pub fn estimated_total_steps(&self) -> Option<u64> {
        match self.estimated_total.load(Ordering::Acquire) {
            NO_ESTIMATE => None,
            total => Some(total),
        }
    }

    /// Linear projection of the time still needed to reach the estimated
    /// total.
    ///
    /// `None` until an estimate is set, and while no step has completed yet.
    /// Exactly zero once the completed steps reach the estimate.
    pub fn remaining_time(&self) -> Option<Duration> {
        let total = self.estimated_total_steps()?;
        let completed = self.current_step();
        if completed >= total {
            return Some(Duration::ZERO);
        }
        if completed == 0 {
            return None;
        }
        Some(self.remaining_from(self.elapsed(), total, completed))
    }

    fn remaining_from(&self, elapsed: Duration, total: u64, completed: u64) -> Duration {
        let nanos = elapsed.as_nanos() * u128::from(total - completed) / u128::from(completed);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Set or overwrite a named metric.
    pub fn record_metric(&self, name: &str, value: f64) -> Result<(), ContextError> {
        if name.trim().is_empty() {
            return Err(ContextError::BlankName);
        }
        self.lock_metrics().insert(name.to_owned(), value);
        Ok(())
    }

    /// Add `delta` to a metric, creating it at `delta` when absent.
    /// Returns the updated value.
    pub fn increment_metric(&self, name: &str, delta: f64) -> Result<f64, ContextError> {
        if name.trim().is_empty() {
            return Err(ContextError::BlankName);
        }
        let mut metrics = self.lock_metrics();
        let entry = metrics.entry(name.to_owned()).or_insert(0.0);
        *entry += delta;
        Ok(*entry)
    }

    /// Point-in-time copy of every recorded metric.
    pub fn metrics(&self) -> HashMap<String, f64> {
        self.lock_metrics().clone()
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.lock_metrics().get(name).copied()
    }

    pub fn set_is_last_node(&self, value: bool) {
        self.is_last_node.store(value, Ordering::Release);
    }

    pub fn is_last_node(&self) -> bool {
        self.is_last_node.load(Ordering::Acquire)
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        // A handler that panicked mid-update cannot leave a half-written f64.
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
