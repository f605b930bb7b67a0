//! Error types for palisade-waf.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for WAF operations.
///
/// Request-time failures never surface through this type: the analysis
/// pipeline is fail-open and converts internal errors into an `Error` event
/// plus an allow verdict. This enum covers startup, configuration, and rule
/// management operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration value rejected at startup.
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Error loading a configuration or rule file.
    #[error("failed to load {}: {source}", path.display())]
    FileLoad {
        /// Path to the file that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a JSON document (config file, rule file, community feed).
    #[error("invalid JSON in {context}: {source}")]
    Json {
        /// What was being parsed.
        context: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Error compiling a regex pattern.
    #[error("invalid pattern '{pattern}': {source}")]
    PatternCompile {
        /// The pattern that failed to compile.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// A rule with this id already exists.
    #[error("duplicate rule id: {id}")]
    DuplicateRuleId {
        /// The duplicate id.
        id: String,
    },

    /// Rule lookup failed.
    #[error("unknown rule id: {id}")]
    UnknownRuleId {
        /// The missing id.
        id: String,
    },

    /// Only custom rules may be deleted.
    #[error("rule {id} is not deletable (source: {source_kind})")]
    RuleNotDeletable {
        /// The rule id.
        id: String,
        /// Where the rule came from.
        source_kind: String,
    },

    /// Community rules fetch failed; retried at the next scheduled tick.
    #[error("community rules fetch failed: {message}")]
    CommunityFetch {
        /// Error message.
        message: String,
    },

    /// Internal error (should not happen in normal operation).
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("threshold must be positive");
        assert_eq!(
            err.to_string(),
            "configuration error: threshold must be positive"
        );

        let err = Error::DuplicateRuleId {
            id: "custom-001".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate rule id: custom-001");
    }

    #[test]
    fn test_pattern_compile_source() {
        let source = regex::Regex::new("(unclosed").unwrap_err();
        let err = Error::PatternCompile {
            pattern: "(unclosed".to_string(),
            source,
        };
        assert!(err.to_string().contains("invalid pattern"));
    }
}
