//! Path traversal detection.

use super::{Combination, DetectionModule, ModuleResult, SignaturePattern, SignatureSet};
use crate::error::Result;
use crate::request::AnalysisRecord;

/// Path traversal signature scanner.
pub struct PathTraversalModule {
    set: SignatureSet,
}

impl PathTraversalModule {
    /// Compile the traversal pattern set.
    pub fn new() -> Result<Self> {
        let patterns = vec![
            SignaturePattern::new(
                "dot-dot-slash",
                "Directory traversal sequence",
                r"\.\.[/\\]",
                4.0,
            )?,
            SignaturePattern::new(
                "encoded-traversal",
                "Encoded directory traversal",
                r"(?i)(?:%2e%2e|%252e%252e)(?:%2f|%5c|/|\\)|\.\.(?:%2f|%5c)",
                4.0,
            )?,
            SignaturePattern::new(
                "sensitive-unix-file",
                "Sensitive Unix file access",
                r"(?i)/etc/(?:passwd|shadow|hosts)\b",
                5.0,
            )?,
            SignaturePattern::new(
                "windows-system-path",
                "Windows system path access",
                r"(?i)(?:[a-z]:\\|\\\\)(?:windows|winnt|system32)",
                3.0,
            )?,
            SignaturePattern::new("null-byte", "Null byte injection", r"%00|\x00", 3.0)?,
        ];

        static DEEP_TRAVERSAL: &[&[&str]] = &[
            &["dot-dot-slash", "encoded-traversal"],
            &["sensitive-unix-file", "windows-system-path"],
        ];

        let combinations = vec![Combination {
            id: "targeted-traversal",
            description: "Traversal aimed at a system file",
            score: 2.0,
            requires: DEEP_TRAVERSAL,
        }];

        Ok(Self {
            set: SignatureSet::new("path-traversal", "path-traversal", patterns, combinations),
        })
    }
}

impl DetectionModule for PathTraversalModule {
    fn name(&self) -> &'static str {
        "path-traversal"
    }

    fn analyze(&self, record: &AnalysisRecord) -> Option<ModuleResult> {
        self.set.analyze(record)
    }
}
