//! Flat detection rules.
//!
//! A rule is a (pattern, score, category) triple with metadata, the atomic
//! unit of signature detection next to the built-in modules. Rules come from
//! the embedded catalog, JSON files, runtime additions, or the community
//! feed. Patterns are compiled exactly once; editing a rule replaces it.

pub mod builtin;
pub mod community;
pub mod manager;

pub use manager::{RuleManager, RuleStats, RuleUpdate};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Rule severity level. Descriptive metadata only; scoring uses the rule's
/// flat score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// Where a rule came from. Only custom rules may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Builtin,
    Custom,
    Community,
    Imported,
}

impl std::fmt::Display for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSource::Builtin => write!(f, "builtin"),
            RuleSource::Custom => write!(f, "custom"),
            RuleSource::Community => write!(f, "community"),
            RuleSource::Imported => write!(f, "imported"),
        }
    }
}

/// A compiled detection rule.
///
/// The compiled pattern is immutable for the life of the rule; updates build
/// a replacement rule rather than mutating in place.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique rule id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Category, e.g. `scanner` or `protocol`.
    pub category: String,
    /// Compiled pattern.
    pub pattern: Regex,
    /// Raw pattern string as loaded.
    pub pattern_str: String,
    /// Score contributed on match; never negative.
    pub score: f64,
    /// Severity metadata.
    pub severity: Severity,
    /// Detailed description.
    pub description: String,
    /// Searchable tags.
    pub tags: Vec<String>,
    /// Whether the rule participates in evaluation.
    pub enabled: bool,
    /// Origin of the rule.
    pub source: RuleSource,
}

/// JSON rule-file entry: required `{id, name, category, pattern, score}`,
/// optional `{flags, description, severity, tags, enabled}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFileEntry {
    pub id: String,
    pub name: String,
    pub category: String,
    pub pattern: String,
    pub score: f64,
    #[serde(default = "default_flags")]
    pub flags: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_flags() -> String {
    "gi".to_string()
}

fn default_enabled() -> bool {
    true
}

impl RuleFileEntry {
    /// Compile the entry into a rule.
    ///
    /// Flag letters follow the usual extended-regex conventions: `i`, `m`,
    /// `s`, and `x` become inline regex flags; `g` is meaningless here since
    /// matching is stateless, and unknown letters are ignored.
    pub fn compile(&self, source: RuleSource) -> Result<Rule> {
        if !self.score.is_finite() || self.score < 0.0 {
            return Err(Error::config(format!(
                "rule {} has invalid score {}",
                self.id, self.score
            )));
        }

        let inline: String = self
            .flags
            .chars()
            .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
            .collect();
        let full_pattern = if inline.is_empty() {
            self.pattern.clone()
        } else {
            format!("(?{inline}){}", self.pattern)
        };

        let pattern = Regex::new(&full_pattern).map_err(|source| Error::PatternCompile {
            pattern: full_pattern.clone(),
            source,
        })?;

        Ok(Rule {
            id: self.id.clone(),
            name: self.name.clone(),
            category: self.category.clone(),
            pattern,
            pattern_str: self.pattern.clone(),
            score: self.score,
            severity: self.severity,
            description: self.description.clone(),
            tags: self.tags.clone(),
            enabled: self.enabled,
            source,
        })
    }

    /// Entry reconstructed from a rule, for export.
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            id: rule.id.clone(),
            name: rule.name.clone(),
            category: rule.category.clone(),
            pattern: rule.pattern_str.clone(),
            score: rule.score,
            flags: "gi".to_string(),
            description: rule.description.clone(),
            severity: rule.severity,
            tags: rule.tags.clone(),
            enabled: rule.enabled,
        }
    }
}

/// Builder for creating rules with a fluent API; used by the embedded
/// catalog and runtime rule creation.
pub struct RuleBuilder {
    id: String,
    name: String,
    category: String,
    pattern: String,
    score: f64,
    severity: Severity,
    description: String,
    tags: Vec<String>,
    enabled: bool,
    source: RuleSource,
}

impl RuleBuilder {
    /// Create a new rule builder with required fields.
    pub fn new(id: &str, name: &str, category: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            pattern: String::new(),
            score: 1.0,
            severity: Severity::Medium,
            description: String::new(),
            tags: Vec::new(),
            enabled: true,
            source: RuleSource::Custom,
        }
    }

    /// Set the regex pattern.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = pattern.to_string();
        self
    }

    /// Set the score.
    pub fn score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// Set the severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the description.
    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Add tags.
    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|s| s.to_string()));
        self
    }

    /// Set the source.
    pub fn source(mut self, source: RuleSource) -> Self {
        self.source = source;
        self
    }

    /// Compile and build the rule.
    pub fn build(self) -> Result<Rule> {
        if !self.score.is_finite() || self.score < 0.0 {
            return Err(Error::config(format!(
                "rule {} has invalid score {}",
                self.id, self.score
            )));
        }
        let pattern = Regex::new(&self.pattern).map_err(|source| Error::PatternCompile {
            pattern: self.pattern.clone(),
            source,
        })?;
        Ok(Rule {
            id: self.id,
            name: self.name,
            category: self.category,
            pattern,
            pattern_str: self.pattern,
            score: self.score,
            severity: self.severity,
            description: self.description,
            tags: self.tags,
            enabled: self.enabled,
            source: self.source,
        })
    }
}

/// Shared snapshot of the enabled rule set, read lock-free by the hot path.
pub type RuleSnapshot = Arc<Vec<Arc<Rule>>>;
