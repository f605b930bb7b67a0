//! Cross-site scripting detection.
//!
//! Covers script tags, scheme URLs, elements with remote sources, event
//! handler attributes, and encoded payloads. Payload sinks (`alert(`,
//! `document.cookie`, ...) and encoding markers are indicators: they score
//! nothing alone and only arm the combination bonuses, which is what keeps
//! single-indicator false positives down.

use super::{Combination, DetectionModule, ModuleResult, SignaturePattern, SignatureSet};
use crate::error::Result;
use crate::request::AnalysisRecord;

/// XSS signature scanner.
pub struct XssModule {
    set: SignatureSet,
}

impl XssModule {
    /// Compile the XSS pattern set.
    pub fn new() -> Result<Self> {
        let patterns = vec![
            SignaturePattern::new(
                "script-tag",
                "Script tag injection",
                r"(?i)<script\b[^>]*>",
                3.0,
            )?,
            SignaturePattern::new(
                "external-script-src",
                "External script source",
                r"(?i)<script\b[^>]*\bsrc\s*=",
                3.0,
            )?,
            SignaturePattern::new(
                "javascript-url",
                "javascript: scheme URL",
                r"(?i)javascript\s*:",
                3.0,
            )?,
            SignaturePattern::new(
                "vbscript-url",
                "vbscript: scheme URL",
                r"(?i)vbscript\s*:",
                3.0,
            )?,
            SignaturePattern::new(
                "data-url-script",
                "data: URL with embedded script",
                r"(?i)data:\s*text/html.*javascript",
                3.0,
            )?,
            SignaturePattern::new(
                "css-expression",
                "CSS expression() payload",
                r"(?i)expression\s*\(",
                2.0,
            )?,
            SignaturePattern::new(
                "remote-source-element",
                "Element with remote source",
                r"(?i)<(?:iframe|object|embed|base|link|form)\b",
                3.0,
            )?,
            SignaturePattern::new(
                "meta-refresh",
                "Meta refresh redirect",
                r#"(?i)<meta\b[^>]*http-equiv\s*=\s*["']?refresh"#,
                2.0,
            )?,
            SignaturePattern::new(
                "event-handler",
                "Inline event handler attribute",
                r"(?i)\bon\w+\s*=",
                2.0,
            )?,
            SignaturePattern::new("onload-handler", "onload handler", r"(?i)\bonload\s*=", 2.0)?,
            SignaturePattern::new(
                "onclick-handler",
                "onclick handler",
                r"(?i)\bonclick\s*=",
                2.0,
            )?,
            SignaturePattern::new(
                "onerror-handler",
                "onerror handler",
                r"(?i)\bonerror\s*=",
                2.0,
            )?,
            SignaturePattern::new(
                "svg-script-payload",
                "SVG with embedded script",
                r"(?is)<svg\b.*?<script",
                3.0,
            )?,
            // Indicators: arm combinations only.
            SignaturePattern::new("sink-alert", "alert() call", r"(?i)\balert\s*\(", 0.0)?,
            SignaturePattern::new("sink-confirm", "confirm() call", r"(?i)\bconfirm\s*\(", 0.0)?,
            SignaturePattern::new("sink-prompt", "prompt() call", r"(?i)\bprompt\s*\(", 0.0)?,
            SignaturePattern::new(
                "sink-document-cookie",
                "document.cookie access",
                r"(?i)document\.cookie",
                0.0,
            )?,
            SignaturePattern::new(
                "sink-document-write",
                "document.write call",
                r"(?i)document\.write",
                0.0,
            )?,
            SignaturePattern::new(
                "sink-html-assignment",
                "innerHTML/outerHTML assignment",
                r"(?i)\b(?:inner|outer)html\s*=",
                0.0,
            )?,
            SignaturePattern::new(
                "entity-encoded",
                "HTML entity reference",
                r"(?i)&#x?[0-9a-f]+;",
                0.0,
            )?,
            SignaturePattern::new(
                "url-encoded",
                "URL-encoded bytes",
                r"(?i)%[0-9a-f]{2}",
                0.0,
            )?,
            SignaturePattern::new("word-script", "script keyword", r"(?i)\bscript\b", 0.0)?,
        ];

        static SCRIPT_CONTENT: &[&[&str]] = &[
            &["script-tag"],
            &[
                "sink-alert",
                "sink-confirm",
                "sink-prompt",
                "sink-document-cookie",
                "sink-document-write",
                "sink-html-assignment",
            ],
        ];
        static HANDLER_JS_URL: &[&[&str]] = &[
            &["event-handler", "onload-handler", "onclick-handler", "onerror-handler"],
            &["javascript-url"],
        ];
        static ENCODED_SCRIPT: &[&[&str]] = &[
            &["entity-encoded", "url-encoded"],
            &["word-script", "sink-alert"],
        ];

        let combinations = vec![
            Combination {
                id: "script-suspicious-content",
                description: "Script tag with suspicious content",
                score: 4.0,
                requires: SCRIPT_CONTENT,
            },
            Combination {
                id: "handler-javascript-url",
                description: "Event handler with javascript: URL",
                score: 3.0,
                requires: HANDLER_JS_URL,
            },
            Combination {
                id: "encoded-script-payload",
                description: "Encoded script payload",
                score: 3.0,
                requires: ENCODED_SCRIPT,
            },
        ];

        Ok(Self {
            set: SignatureSet::new("xss", "xss", patterns, combinations),
        })
    }
}

impl DetectionModule for XssModule {
    fn name(&self) -> &'static str {
        "xss"
    }

    fn analyze(&self, record: &AnalysisRecord) -> Option<ModuleResult> {
        self.set.analyze(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;

    fn analyze(query: &str) -> Option<ModuleResult> {
        let input = RequestInput::new("GET", "/api/search").with_query("q", query);
        let record = AnalysisRecord::from_input(&input);
        XssModule::new().unwrap().analyze(&record)
    }

    #[test]
    fn test_script_tag_with_alert() {
        let result = analyze(r#"<script>alert("xss")</script>"#).unwrap();
        // script-tag (3) + script-suspicious-content combination (4).
        assert_eq!(result.score, 7.0);
        assert!(result
            .threats
            .iter()
            .any(|t| t.description == "Script tag injection"));
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "script-suspicious-content"));
    }

    #[test]
    fn test_bare_script_tag() {
        let result = analyze("<script>var x = 1;</script>").unwrap();
        assert_eq!(result.score, 3.0);
    }

    #[test]
    fn test_event_handler_with_javascript_url() {
        let result = analyze(r#"<img src="javascript:void(0)" onerror=doIt()>"#).unwrap();
        // javascript-url (3) + event-handler (2) + onerror-handler (2)
        // + handler-javascript-url combination (3).
        assert_eq!(result.score, 10.0);
    }

    #[test]
    fn test_entity_encoded_script() {
        let result = analyze("&#x3c;script&#x3e;alert(1)").unwrap();
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "encoded-script-payload"));
    }

    #[test]
    fn test_remote_source_element() {
        let result = analyze(r#"<iframe src="https://evil.example/">"#).unwrap();
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "remote-source-element"));
    }

    #[test]
    fn test_alert_alone_is_not_a_threat() {
        // Sinks are indicators only.
        assert!(analyze("alert(1)").is_none());
    }

    #[test]
    fn test_benign_query() {
        assert!(analyze("rust regex tutorial").is_none());
        // "description" contains the script substring mid-word; the word
        // boundary keeps it from arming the encoded-payload combination.
        assert!(analyze("description%20of%20items").is_none());
    }

    #[test]
    fn test_threat_kind_is_xss() {
        let result = analyze("<script>x</script>").unwrap();
        assert!(result.threats.iter().all(|t| t.kind == "xss"));
    }
}
