//! Optimization lock bookkeeping
//!
//! The lock table itself lives in the store's coordinator; this module holds
//! the lock record, the conflict policies and the progress comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::value::VariableValue;
use super::variable::{ProcessHandle, VariableId};

/// What to do when the requested variable is already locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Fail immediately with `LockHeldBy`
    #[default]
    Abort,
    /// Queue and be granted in FIFO order
    Wait,
    /// Take over once the holder has run enough iterations, otherwise wait
    Preempt,
}

/// One progress report from an optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Iteration number
    pub iteration: u64,
    /// Candidate value evaluated in this iteration
    pub value: VariableValue,
    /// Named metrics, e.g. `loss`
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl ProgressReport {
    /// Create a report
    pub fn new(iteration: u64, value: impl Into<VariableValue>) -> Self {
        Self {
            iteration,
            value: value.into(),
            metrics: HashMap::new(),
        }
    }

    /// Attach a metric
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// An exclusive optimization lease on one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationLock {
    /// Locked variable
    pub var_id: VariableId,
    /// Optimizer holding the lock; writes are allowed only from this caller id
    pub optimizer_id: String,
    /// Process whose termination releases the lock
    pub holder: ProcessHandle,
    /// When the lock was granted
    pub acquired_at: DateTime<Utc>,
    /// Last reported iteration
    pub iteration: u64,
    /// Best value reported so far
    pub best_value: Option<VariableValue>,
    /// Metrics of the best report
    pub best_metrics: HashMap<String, f64>,
}

impl OptimizationLock {
    /// A fresh lock with no progress
    pub fn new(var_id: VariableId, optimizer_id: impl Into<String>, holder: ProcessHandle) -> Self {
        Self {
            var_id,
            optimizer_id: optimizer_id.into(),
            holder,
            acquired_at: Utc::now(),
            iteration: 0,
            best_value: None,
            best_metrics: HashMap::new(),
        }
    }

    /// Apply a report; returns whether it became the new best.
    ///
    /// The first report always becomes the best. After that a report replaces
    /// the best only when its `primary_metric` is strictly lower.
    pub fn record_progress(&mut self, report: ProgressReport, primary_metric: &str) -> bool {
        self.iteration = self.iteration.max(report.iteration);

        let improved = match (&self.best_value, report.metrics.get(primary_metric)) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(_), Some(candidate)) => match self.best_metrics.get(primary_metric) {
                Some(best) => candidate < best,
                None => true,
            },
        };

        if improved {
            self.best_value = Some(report.value);
            self.best_metrics = report.metrics;
        }
        improved
    }

    /// Whether a `preempt` request may take this lock
    pub fn preemptible(&self, min_iterations: u64) -> bool {
        self.iteration >= min_iterations
    }
}
