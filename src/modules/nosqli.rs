//! NoSQL injection detection.
//!
//! Targets MongoDB-style operator injection in query strings and structured
//! bodies, plus server-side JavaScript evaluation through `$where`.

use super::{Combination, DetectionModule, ModuleResult, SignaturePattern, SignatureSet};
use crate::error::Result;
use crate::request::AnalysisRecord;

/// NoSQL injection signature scanner.
pub struct NoSqliModule {
    set: SignatureSet,
}

impl NoSqliModule {
    /// Compile the NoSQLi pattern set.
    pub fn new() -> Result<Self> {
        let patterns = vec![
            SignaturePattern::new(
                "mongo-operator",
                "MongoDB query operator",
                r"(?i)\$(?:where|ne|gt|lt|gte|lte|in|nin|regex|exists|or|and|not|elemmatch)\b",
                3.0,
            )?,
            SignaturePattern::new(
                "bracket-operator",
                "Operator injection via bracket syntax",
                r"(?i)\[\s*\$\w+\s*\]",
                3.0,
            )?,
            SignaturePattern::new(
                "where-javascript",
                "JavaScript evaluation in $where",
                r"(?i)\$where\b[\s\S]{0,80}?(?:function\s*\(|this\.)",
                4.0,
            )?,
            // Indicators: arm combinations only.
            SignaturePattern::new(
                "js-function",
                "inline function",
                r"(?i)\bfunction\s*\(|=>",
                0.0,
            )?,
            SignaturePattern::new("js-this-access", "this.field access", r"(?i)\bthis\.\w+", 0.0)?,
        ];

        static OPERATOR_WITH_JS: &[&[&str]] =
            &[&["mongo-operator", "bracket-operator"], &["js-function", "js-this-access"]];

        let combinations = vec![Combination {
            id: "operator-js-execution",
            description: "Query operator with JavaScript payload",
            score: 3.0,
            requires: OPERATOR_WITH_JS,
        }];

        Ok(Self {
            set: SignatureSet::new("nosqli", "nosqli", patterns, combinations),
        })
    }
}

impl DetectionModule for NoSqliModule {
    fn name(&self) -> &'static str {
        "nosqli"
    }

    fn analyze(&self, record: &AnalysisRecord) -> Option<ModuleResult> {
        self.set.analyze(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;

    fn module() -> NoSqliModule {
        NoSqliModule::new().unwrap()
    }

    #[test]
    fn test_operator_in_structured_body() {
        let input = RequestInput::new("POST", "/api/login")
            .with_json_body(serde_json::json!({"username": "admin", "password": {"$ne": ""}}));
        let record = AnalysisRecord::from_input(&input);
        let result = module().analyze(&record).unwrap();
        assert!(result.threats.iter().any(|t| t.pattern == "mongo-operator"));
    }

    #[test]
    fn test_bracket_syntax_in_query() {
        let input = RequestInput::new("GET", "/api/users").with_query("filter", "name[$regex]=.*");
        let record = AnalysisRecord::from_input(&input);
        let result = module().analyze(&record).unwrap();
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "bracket-operator"));
    }

    #[test]
    fn test_where_javascript_combination() {
        let input = RequestInput::new("POST", "/api/search")
            .with_json_body(serde_json::json!({"$where": "function() { return this.admin == true }"}));
        let record = AnalysisRecord::from_input(&input);
        let result = module().analyze(&record).unwrap();
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "where-javascript"));
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "operator-js-execution"));
    }

    #[test]
    fn test_benign_body() {
        let input = RequestInput::new("POST", "/api/users")
            .with_json_body(serde_json::json!({"name": "Ada", "price": 10}));
        let record = AnalysisRecord::from_input(&input);
        assert!(module().analyze(&record).is_none());
    }
}
