//! Pluggable detection modules.
//!
//! Every module is a function of the analysis record: it scans the request's
//! search surface (path, query values, body, header values, cookie values)
//! and returns a partial score plus the threats it matched, or nothing.
//! Modules are selected by name from the configuration; there is no
//! filesystem discovery.

pub mod command;
pub mod nosqli;
pub mod sqli;
pub mod traversal;
pub mod xss;

use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::request::{truncate_excerpt, AnalysisRecord, Threat};

/// Result of running one detection module against a record.
#[derive(Debug, Clone)]
pub struct ModuleResult {
    /// Module name.
    pub module: &'static str,
    /// Sum of the threat scores below.
    pub score: f64,
    /// Threats matched by this module.
    pub threats: Vec<Threat>,
}

/// A signature scanner over the request search surface.
pub trait DetectionModule: Send + Sync {
    /// Module name as referenced in the configuration.
    fn name(&self) -> &'static str;

    /// Scan the record; `None` when nothing matched.
    fn analyze(&self, record: &AnalysisRecord) -> Option<ModuleResult>;
}

/// Construct the configured signature modules.
///
/// The stateful `ratelimit` module is wired by the pipeline itself and is
/// not constructed here.
pub fn build_signature_modules(names: &[String]) -> Result<Vec<Box<dyn DetectionModule>>> {
    let mut modules: Vec<Box<dyn DetectionModule>> = Vec::new();
    for name in names {
        match name.as_str() {
            "xss" => modules.push(Box::new(xss::XssModule::new()?)),
            "sqli" => modules.push(Box::new(sqli::SqliModule::new()?)),
            "nosqli" => modules.push(Box::new(nosqli::NoSqliModule::new()?)),
            "path-traversal" => modules.push(Box::new(traversal::PathTraversalModule::new()?)),
            "cmd-injection" => modules.push(Box::new(command::CommandInjectionModule::new()?)),
            // Unknown names were dropped during config validation; ratelimit
            // is handled by the pipeline.
            _ => {}
        }
    }
    Ok(modules)
}

/// A compiled pattern with an id, a description, and a score.
///
/// Patterns with score zero are indicators: they never emit threats on their
/// own and only arm combination bonuses.
pub(crate) struct SignaturePattern {
    pub id: &'static str,
    pub description: &'static str,
    pub regex: Regex,
    pub score: f64,
}

impl SignaturePattern {
    pub fn new(id: &'static str, description: &'static str, pattern: &str, score: f64) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| Error::PatternCompile {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            id,
            description,
            regex,
            score,
        })
    }
}

/// A combination bonus: fires when every group has at least one matched id.
pub(crate) struct Combination {
    pub id: &'static str,
    pub description: &'static str,
    pub score: f64,
    /// Conjunction of disjunctions over pattern ids.
    pub requires: &'static [&'static [&'static str]],
}

/// Shared scanning machinery for the signature modules.
pub(crate) struct SignatureSet {
    kind: &'static str,
    module: &'static str,
    patterns: Vec<SignaturePattern>,
    combinations: Vec<Combination>,
}

impl SignatureSet {
    pub fn new(
        module: &'static str,
        kind: &'static str,
        patterns: Vec<SignaturePattern>,
        combinations: Vec<Combination>,
    ) -> Self {
        Self {
            kind,
            module,
            patterns,
            combinations,
        }
    }

    /// Scan every (pattern, target) pair; every matching pair contributes its
    /// pattern score. Combination bonuses are evaluated once per record over
    /// the set of matched pattern ids.
    pub fn analyze(&self, record: &AnalysisRecord) -> Option<ModuleResult> {
        let targets = record.scan_targets();
        let mut threats = Vec::new();
        // First matched excerpt per pattern id, for combination threats.
        let mut matched: FxHashMap<&'static str, String> = FxHashMap::default();

        for (location, text) in &targets {
            for pattern in &self.patterns {
                if let Some(m) = pattern.regex.find(text) {
                    matched
                        .entry(pattern.id)
                        .or_insert_with(|| truncate_excerpt(m.as_str()));
                    if pattern.score > 0.0 {
                        debug!(
                            module = self.module,
                            pattern = pattern.id,
                            location = %location,
                            "signature match"
                        );
                        threats.push(Threat::new(
                            self.kind,
                            pattern.id,
                            pattern.description,
                            pattern.score,
                            m.as_str(),
                        ));
                    }
                }
            }
        }

        for combo in &self.combinations {
            let armed = combo
                .requires
                .iter()
                .all(|group| group.iter().any(|id| matched.contains_key(id)));
            if armed {
                let excerpt = combo
                    .requires
                    .first()
                    .and_then(|group| group.iter().find_map(|id| matched.get(id)))
                    .cloned()
                    .unwrap_or_default();
                threats.push(Threat::new(
                    self.kind,
                    combo.id,
                    combo.description,
                    combo.score,
                    &excerpt,
                ));
            }
        }

        if threats.is_empty() {
            return None;
        }

        let score = threats.iter().map(|t| t.score).sum();
        Some(ModuleResult {
            module: self.module,
            score,
            threats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;

    fn record(query: &str) -> AnalysisRecord {
        let input = RequestInput::new("GET", "/api/search").with_query("q", query);
        AnalysisRecord::from_input(&input)
    }

    #[test]
    fn test_build_configured_modules() {
        let names = vec![
            "xss".to_string(),
            "sqli".to_string(),
            "nosqli".to_string(),
            "path-traversal".to_string(),
            "cmd-injection".to_string(),
            "ratelimit".to_string(),
        ];
        let modules = build_signature_modules(&names).unwrap();
        // ratelimit is not a signature module.
        assert_eq!(modules.len(), 5);
        assert_eq!(modules[0].name(), "xss");
    }

    #[test]
    fn test_indicator_patterns_do_not_score() {
        let set = SignatureSet::new(
            "test",
            "test",
            vec![
                SignaturePattern::new("scored", "scored", "foo", 2.0).unwrap(),
                SignaturePattern::new("indicator", "indicator", "bar", 0.0).unwrap(),
            ],
            vec![],
        );
        let result = set.analyze(&record("bar only")).map(|r| r.score);
        assert_eq!(result, None);

        let result = set.analyze(&record("foo and bar")).unwrap();
        assert_eq!(result.score, 2.0);
        assert_eq!(result.threats.len(), 1);
    }

    #[test]
    fn test_combination_requires_all_groups() {
        static REQUIRES: &[&[&str]] = &[&["a"], &["b", "c"]];
        let set = SignatureSet::new(
            "test",
            "test",
            vec![
                SignaturePattern::new("a", "a", "alpha", 0.0).unwrap(),
                SignaturePattern::new("b", "b", "beta", 0.0).unwrap(),
                SignaturePattern::new("c", "c", "gamma", 0.0).unwrap(),
            ],
            vec![Combination {
                id: "a-and-bc",
                description: "combo",
                score: 4.0,
                requires: REQUIRES,
            }],
        );

        assert!(set.analyze(&record("alpha")).is_none());
        let result = set.analyze(&record("alpha gamma")).unwrap();
        assert_eq!(result.score, 4.0);
        assert_eq!(result.threats[0].pattern, "a-and-bc");
    }

    #[test]
    fn test_same_pattern_scores_per_target() {
        let set = SignatureSet::new(
            "test",
            "test",
            vec![SignaturePattern::new("p", "p", "evil", 1.0).unwrap()],
            vec![],
        );
        let input = RequestInput::new("GET", "/evil").with_query("q", "evil");
        let record = AnalysisRecord::from_input(&input);
        let result = set.analyze(&record).unwrap();
        // Matches in both the path and the query value.
        assert_eq!(result.score, 2.0);
    }
}
