//! Severity scale shared by outcomes, error rules, and exit-code derivation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Process exit code for a run whose worst severity is at most `warning`.
pub const EXIT_SUCCESS: i32 = 0;

/// Process exit code for a run that recorded an `error` or `critical` outcome.
pub const EXIT_FAILURE: i32 = 1;

/// Process exit code for a run that was aborted by a fatal outcome.
pub const EXIT_ABORTED: i32 = 2;

/// Ordered outcome severity. `Fatal` is terminal and aborts the run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl Severity {
    /// All severities in ascending order.
    pub const ALL: [Severity; 6] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
        Severity::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        }
    }

    /// Whether this severity forces a nonzero exit code.
    pub fn is_failure(&self) -> bool {
        *self > Severity::Warning
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            "fatal" => Ok(Severity::Fatal),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Level attached to an error-matching rule.
///
/// `Ignore` stops rule evaluation for a line without escalating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleLevel {
    Ignore,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl RuleLevel {
    /// The severity a matched line is logged at, or `None` for `Ignore`.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            RuleLevel::Ignore => None,
            RuleLevel::Debug => Some(Severity::Debug),
            RuleLevel::Info => Some(Severity::Info),
            RuleLevel::Warning => Some(Severity::Warning),
            RuleLevel::Error => Some(Severity::Error),
            RuleLevel::Critical => Some(Severity::Critical),
            RuleLevel::Fatal => Some(Severity::Fatal),
        }
    }
}

impl From<Severity> for RuleLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Debug => RuleLevel::Debug,
            Severity::Info => RuleLevel::Info,
            Severity::Warning => RuleLevel::Warning,
            Severity::Error => RuleLevel::Error,
            Severity::Critical => RuleLevel::Critical,
            Severity::Fatal => RuleLevel::Fatal,
        }
    }
}
