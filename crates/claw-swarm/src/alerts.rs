//! Escalating concern scores per named target.
//!
//! Severities only ever grow: each escalation adds a fixed step up to a cap,
//! and entries are never removed. The fleet alert level is the mean severity.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

/// Severity added per escalation.
pub const ESCALATION_STEP: f64 = 10.0;

/// Highest severity a target can reach.
pub const MAX_SEVERITY: f64 = 100.0;

/// Aggregates escalations into a fleet-wide alert level.
#[derive(Debug, Default)]
pub struct AlertAggregator {
    /// Target label -> severity.
    targets: RwLock<HashMap<String, f64>>,
}

impl AlertAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Escalate `target`, returning its new severity.
    pub fn escalate(&self, target: &str, evidence: &str) -> f64 {
        let severity = {
            let mut targets = self.targets.write();
            let severity = targets.entry(target.to_string()).or_insert(0.0);
            *severity = (*severity + ESCALATION_STEP).min(MAX_SEVERITY);
            *severity
        };

        info!(target_label = %target, severity, evidence = %evidence, "concern escalated");
        severity
    }

    /// Severity of one target, if it was ever escalated.
    #[must_use]
    pub fn severity(&self, target: &str) -> Option<f64> {
        self.targets.read().get(target).copied()
    }

    /// Mean severity across all targets, 0 when none exist.
    #[must_use]
    pub fn level(&self) -> f64 {
        let targets = self.targets.read();
        if targets.is_empty() {
            return 0.0;
        }
        targets.values().sum::<f64>() / targets.len() as f64
    }

    /// All targets and their severities, sorted by label.
    #[must_use]
    pub fn targets(&self) -> Vec<(String, f64)> {
        let mut all: Vec<_> = self
            .targets
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
