//! SQL injection detection.
//!
//! Covers union-based, boolean, time-based, and error-based injection,
//! stacked queries, comments, schema probing, file I/O, DDL/DML statements,
//! and privilege changes. Low-confidence clause and function patterns score
//! one point each; the combination bonuses reward the multi-indicator
//! payloads real attacks are built from.

use super::{Combination, DetectionModule, ModuleResult, SignaturePattern, SignatureSet};
use crate::error::Result;
use crate::request::AnalysisRecord;

/// SQL injection signature scanner.
pub struct SqliModule {
    set: SignatureSet,
}

impl SqliModule {
    /// Compile the SQLi pattern set.
    pub fn new() -> Result<Self> {
        let patterns = vec![
            SignaturePattern::new(
                "union-select",
                "UNION SELECT injection",
                r"(?i)\bunion\b(?:\s+all)?\s+select\b",
                4.0,
            )?,
            SignaturePattern::new(
                "boolean-tautology",
                "Boolean tautology",
                r"(?i)\b(?:or|and)\s+(?:1\s*=\s*[01]|true|false)\b",
                3.0,
            )?,
            SignaturePattern::new(
                "time-delay",
                "Time-based blind injection",
                r"(?i)\bsleep\s*\(|\bwaitfor\s+delay\b|\bbenchmark\s*\(",
                4.0,
            )?,
            SignaturePattern::new(
                "error-function",
                "Error-based injection function",
                r"(?i)\bextractvalue\s*\(|\bupdatexml\s*\(|\bexp\s*\(",
                4.0,
            )?,
            SignaturePattern::new(
                "stacked-query",
                "Stacked query",
                r"(?i);\s*(?:select|insert|update|delete|drop|create|alter)\b",
                4.0,
            )?,
            SignaturePattern::new(
                "comment-dash",
                "SQL comment (--)",
                r"(?m)--[^\r\n]*$",
                2.0,
            )?,
            SignaturePattern::new("comment-hash", "SQL comment (#)", r"(?m)#[^\r\n]*$", 2.0)?,
            SignaturePattern::new(
                "comment-block",
                "SQL block comment",
                r"/\*[\s\S]*?\*/",
                2.0,
            )?,
            SignaturePattern::new(
                "information-schema",
                "Information schema probing",
                r"(?i)\binformation_schema\b|\bmysql\.",
                3.0,
            )?,
            SignaturePattern::new(
                "file-io",
                "SQL file read/write",
                r"(?i)\bload_file\s*\(|\binto\s+(?:out|dump)file\b",
                4.0,
            )?,
            SignaturePattern::new(
                "drop-table",
                "DROP TABLE statement",
                r"(?i)\bdrop\s+(?:table|database)\b",
                5.0,
            )?,
            SignaturePattern::new(
                "truncate-table",
                "TRUNCATE TABLE statement",
                r"(?i)\btruncate\s+table\b",
                4.0,
            )?,
            SignaturePattern::new(
                "alter-structure",
                "ALTER statement",
                r"(?i)\balter\s+(?:table|database)\b",
                3.0,
            )?,
            SignaturePattern::new(
                "insert-into",
                "INSERT INTO statement",
                r"(?i)\binsert\s+into\b",
                3.0,
            )?,
            SignaturePattern::new(
                "update-set",
                "UPDATE ... SET statement",
                r"(?i)\bupdate\s+\w+\s+set\b",
                3.0,
            )?,
            SignaturePattern::new(
                "delete-from",
                "DELETE FROM statement",
                r"(?i)\bdelete\s+from\b",
                3.0,
            )?,
            SignaturePattern::new(
                "privilege-change",
                "GRANT/REVOKE statement",
                r"(?i)\b(?:grant|revoke)\s+(?:all|select|insert|update|delete|create|drop)\b[\s\S]*?\bon\b",
                3.0,
            )?,
            SignaturePattern::new(
                "admin-quote-comment",
                "Quoted admin comment bypass",
                r#"(?i)admin['"]\s*--"#,
                4.0,
            )?,
            SignaturePattern::new(
                "sql-clause",
                "SQL clause",
                r"(?i)\border\s+by\s+\d|\bgroup\s+by\b|\bhaving\b|\blimit\s+\d+\s+offset\b|\blike\s+'%",
                1.0,
            )?,
            SignaturePattern::new(
                "subquery",
                "SQL subquery",
                r"(?i)\(\s*select\b|\bexists\s*\(",
                1.0,
            )?,
            SignaturePattern::new(
                "sql-function",
                "SQL string/conditional function",
                r"(?i)\b(?:concat|substring|ascii|char|length)\s*\(|\bcase\s+when\b",
                1.0,
            )?,
            // Indicators: arm combinations only.
            SignaturePattern::new("semicolon", "statement separator", ";", 0.0)?,
            SignaturePattern::new("word-select", "select keyword", r"(?i)\bselect\b", 0.0)?,
            SignaturePattern::new("word-union", "union keyword", r"(?i)\bunion\b", 0.0)?,
            SignaturePattern::new("word-or", "or keyword", r"(?i)\bor\b", 0.0)?,
            SignaturePattern::new("word-drop", "drop keyword", r"(?i)\bdrop\b", 0.0)?,
        ];

        static UNION_SCHEMA: &[&[&str]] = &[&["union-select"], &["information-schema"]];
        static TIMED_PROBE: &[&[&str]] = &[&["time-delay"], &["word-union", "word-or"]];
        static STACKED: &[&[&str]] = &[&["semicolon"], &["word-select", "word-drop"]];
        static COMMENTED: &[&[&str]] = &[
            &["comment-dash", "comment-hash", "comment-block"],
            &["word-select", "word-union"],
        ];

        let combinations = vec![
            Combination {
                id: "union-information-schema",
                description: "UNION SELECT against information schema",
                score: 3.0,
                requires: UNION_SCHEMA,
            },
            Combination {
                id: "timed-probe",
                description: "Timed injection probe",
                score: 3.0,
                requires: TIMED_PROBE,
            },
            Combination {
                id: "stacked-statement",
                description: "Statement separator with query keyword",
                score: 2.0,
                requires: STACKED,
            },
            Combination {
                id: "commented-query",
                description: "SQL comment with query keyword",
                score: 2.0,
                requires: COMMENTED,
            },
        ];

        Ok(Self {
            set: SignatureSet::new("sqli", "sqli", patterns, combinations),
        })
    }
}

impl DetectionModule for SqliModule {
    fn name(&self) -> &'static str {
        "sqli"
    }

    fn analyze(&self, record: &AnalysisRecord) -> Option<ModuleResult> {
        self.set.analyze(record)
    }
}
