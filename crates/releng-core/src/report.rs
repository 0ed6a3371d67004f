//! Run summary: per-action outcomes and their rendering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::obs;
use crate::severity::Severity;

/// The recorded result of one action. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ActionOutcome {
    pub fn new(
        action: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            action: action.into(),
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            duration_ms,
        }
    }
}

/// Rendered report text plus the worst severity for exit-code derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSummary {
    pub text: String,
    pub worst: Option<Severity>,
}

/// Append-only outcome log in arrival order.
#[derive(Debug, Clone, Default)]
pub struct SummaryReport {
    outcomes: Vec<ActionOutcome>,
}

impl SummaryReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an outcome and forward it to the log sink.
    pub fn record(&mut self, outcome: ActionOutcome) {
        obs::emit_outcome(&outcome.action, outcome.severity, &outcome.message);
        self.outcomes.push(outcome);
    }

    pub fn outcomes(&self) -> &[ActionOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn worst(&self) -> Option<Severity> {
        self.outcomes.iter().map(|o| o.severity).max()
    }

    /// Number of outcomes at each severity that occurred.
    pub fn counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for outcome in &self.outcomes {
            *counts.entry(outcome.severity).or_insert(0) += 1;
        }
        counts
    }

    /// Group outcomes into severity sections, ascending.
    ///
    /// Within a section outcomes keep arrival order; every outcome appears
    /// exactly once; empty sections are omitted.
    pub fn render(&self) -> RenderedSummary {
        let mut text = String::from("##### Summary\n");
        if self.outcomes.is_empty() {
            text.push_str("no actions ran\n");
        }
        for severity in Severity::ALL {
            let section: Vec<&ActionOutcome> = self
                .outcomes
                .iter()
                .filter(|o| o.severity == severity)
                .collect();
            if section.is_empty() {
                continue;
            }
            text.push_str(&format!("\n{}\n", severity.as_str().to_uppercase()));
            for outcome in section {
                text.push_str(&format!("- {}: {}\n", outcome.action, outcome.message));
            }
        }
        RenderedSummary {
            text,
            worst: self.worst(),
        }
    }
}

impl From<Vec<ActionOutcome>> for SummaryReport {
    /// Rebuild a report from already-recorded outcomes without re-logging them.
    fn from(outcomes: Vec<ActionOutcome>) -> Self {
        Self { outcomes }
    }
}
