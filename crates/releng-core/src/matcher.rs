//! Output-line classification: first match wins over an ordered rule list.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::severity::RuleLevel;

/// How a rule recognises a line.
#[derive(Debug, Clone)]
pub enum LinePattern {
    /// Plain substring containment.
    Substr(String),
    /// Unanchored regex search.
    Regex(Regex),
}

impl LinePattern {
    pub fn is_match(&self, line: &str) -> bool {
        match self {
            LinePattern::Substr(needle) => line.contains(needle.as_str()),
            LinePattern::Regex(re) => re.is_match(line),
        }
    }
}

/// A single classification rule.
#[derive(Debug, Clone)]
pub struct ErrorRule {
    pub pattern: LinePattern,
    pub level: RuleLevel,
}

impl ErrorRule {
    pub fn substr(needle: impl Into<String>, level: RuleLevel) -> Self {
        Self {
            pattern: LinePattern::Substr(needle.into()),
            level,
        }
    }

    pub fn regex(pattern: &str, level: RuleLevel) -> Result<Self> {
        let re = Regex::new(pattern).map_err(|e| HarnessError::InvalidRule {
            reason: format!("bad regex {pattern:?}: {e}"),
        })?;
        Ok(Self {
            pattern: LinePattern::Regex(re),
            level,
        })
    }
}

/// Configuration form of a rule: exactly one of `substr` / `regex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    pub level: RuleLevel,
}

impl TryFrom<&ErrorRuleSpec> for ErrorRule {
    type Error = HarnessError;

    fn try_from(spec: &ErrorRuleSpec) -> Result<Self> {
        match (&spec.substr, &spec.regex) {
            (Some(needle), None) => Ok(ErrorRule::substr(needle.clone(), spec.level)),
            (None, Some(pattern)) => ErrorRule::regex(pattern, spec.level),
            (Some(_), Some(_)) => Err(HarnessError::InvalidRule {
                reason: "rule sets both substr and regex".to_string(),
            }),
            (None, None) => Err(HarnessError::InvalidRule {
                reason: "rule needs a substr or regex".to_string(),
            }),
        }
    }
}

/// Where an action's rules come from: a named preset or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorRulesSource {
    Preset(String),
    Rules(Vec<ErrorRuleSpec>),
}

/// An ordered rule set evaluated first-match-wins.
#[derive(Debug, Clone, Default)]
pub struct ErrorMatcher {
    rules: Vec<ErrorRule>,
}

impl ErrorMatcher {
    /// A matcher with no rules; classifies nothing.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule and return `self` (builder pattern).
    pub fn with_rule(mut self, rule: ErrorRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ErrorRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify a line.
    ///
    /// Returns the level of the first rule whose pattern matches, or `None`
    /// if no rule matches. A leading `Ignore` match shadows every later rule.
    pub fn classify(&self, line: &str) -> Option<RuleLevel> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(line))
            .map(|rule| rule.level)
    }

    /// Rules for generic shell output.
    pub fn base() -> Self {
        Self::empty().with_rule(ErrorRule::substr("command not found", RuleLevel::Error))
    }

    /// Append one regex rule per `(pattern, level)` pair, failing on the first
    /// pattern that does not compile.
    pub fn with_regex_rules(mut self, specs: &[(&str, RuleLevel)]) -> Result<Self> {
        for &(pattern, level) in specs {
            self.rules.push(ErrorRule::regex(pattern, level)?);
        }
        Ok(self)
    }

    /// Rules for Python tool output, layered on [`ErrorMatcher::base`].
    pub fn python() -> Result<Self> {
        Self::base()
            .with_rule(ErrorRule::substr(
                "Traceback (most recent call last)",
                RuleLevel::Error,
            ))
            .with_rule(ErrorRule::substr("SyntaxError: ", RuleLevel::Error))
            .with_rule(ErrorRule::substr("TypeError: ", RuleLevel::Error))
            .with_rule(ErrorRule::substr("NameError: ", RuleLevel::Error))
            .with_rule(ErrorRule::substr("ZeroDivisionError: ", RuleLevel::Error))
            .with_regex_rules(&[
                (r"raise \w*Exception: ", RuleLevel::Critical),
                (r"DeprecationWarning: .*", RuleLevel::Warning),
            ])
    }

    /// Look up a named preset.
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "base" => Ok(Self::base()),
            "python" => Self::python(),
            "none" => Ok(Self::empty()),
            other => Err(HarnessError::InvalidRule {
                reason: format!("unknown rule preset: {other}"),
            }),
        }
    }

    /// Build a matcher from its configuration form.
    pub fn from_source(source: &ErrorRulesSource) -> Result<Self> {
        match source {
            ErrorRulesSource::Preset(name) => Self::preset(name),
            ErrorRulesSource::Rules(specs) => {
                let rules = specs
                    .iter()
                    .map(ErrorRule::try_from)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self { rules })
            }
        }
    }
}
