//! WAF configuration types.
//!
//! Configuration for the analysis pipeline: detection modules, scoring
//! threshold, adaptive learning, rate limiting, IP blocking, community rules,
//! and stats retention. Values are resolved in precedence order
//! builtin defaults < JSON file < environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Module names the pipeline knows how to construct.
pub const KNOWN_MODULES: &[&str] = &[
    "xss",
    "sqli",
    "nosqli",
    "path-traversal",
    "cmd-injection",
    "ratelimit",
];

/// Top-level WAF configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WafConfig {
    /// Master switch; when false every request is allowed untouched.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dry-run mode: would-be blocks are logged and reported but allowed.
    #[serde(default)]
    pub dry_run: bool,
    /// Cumulative score at or above which a request is blocked.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Detection modules to run, by name.
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
    /// Enable the adaptive learning period before enforcement.
    #[serde(default)]
    pub adaptive_learning: bool,
    /// Length of the learning period in days.
    #[serde(default = "default_learning_period")]
    pub learning_period_days: f64,
    /// Anomaly score above which a request counts as anomalous.
    /// Values above 100 disable the anomaly scorer entirely.
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    /// Paths that bypass the entire pipeline.
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,
    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// IP blocking configuration.
    #[serde(default)]
    pub ip_blocking: IpBlockingConfig,
    /// Path to a JSON rule file loaded at startup.
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
    /// Enable the community rules feed.
    #[serde(default)]
    pub community_rules: bool,
    /// HTTPS URL of the community rules feed.
    #[serde(default)]
    pub community_rules_url: Option<String>,
    /// Automatically refresh community rules on a timer.
    #[serde(default)]
    pub auto_update: bool,
    /// Community refresh interval in milliseconds.
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
    /// Stats collection configuration.
    #[serde(default)]
    pub stats: StatsConfig,
    /// Maximum buffered analysis records in the learner.
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    /// API key for the external admin surface; opaque to the core.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Enable per-IP rate limiting.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Maximum requests per IP per window.
    #[serde(default = "default_rate_max")]
    pub max: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: default_window_ms(),
            max: default_rate_max(),
        }
    }
}

/// IP blocking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpBlockingConfig {
    /// Enable automatic IP blocking on repeated rate-limit violations.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Block duration in milliseconds.
    #[serde(default = "default_block_duration")]
    pub block_duration_ms: u64,
    /// Violations within the window before an IP is blocked.
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,
}

impl Default for IpBlockingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_duration_ms: default_block_duration(),
            max_violations: default_max_violations(),
        }
    }
}

/// Stats collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatsConfig {
    /// Enable stats collection.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Days of hourly/daily buckets to retain.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
        }
    }
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            threshold: default_threshold(),
            modules: default_modules(),
            adaptive_learning: false,
            learning_period_days: default_learning_period(),
            anomaly_threshold: default_anomaly_threshold(),
            skip_paths: default_skip_paths(),
            rate_limit: RateLimitConfig::default(),
            ip_blocking: IpBlockingConfig::default(),
            rules_file: None,
            community_rules: false,
            community_rules_url: None,
            auto_update: false,
            update_interval_ms: default_update_interval(),
            stats: StatsConfig::default(),
            max_logs: default_max_logs(),
            api_key: None,
        }
    }
}

impl WafConfig {
    /// Load configuration with full precedence: defaults, then the JSON file
    /// (if given), then environment variables. Validates before returning.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file layered over defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| Error::FileLoad {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| Error::Json {
            context: format!("config file {}", path.display()),
            source,
        })
    }

    /// Overlay recognized `WAF_*` environment variables.
    pub fn overlay_env(&mut self) {
        if let Some(v) = env_parse::<bool>("WAF_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = env_parse::<bool>("WAF_DRY_RUN") {
            self.dry_run = v;
        }
        if let Some(v) = env_parse::<f64>("WAF_THRESHOLD") {
            self.threshold = v;
        }
        if let Some(v) = std::env::var("WAF_MODULES").ok().filter(|v| !v.is_empty()) {
            self.modules = v.split(',').map(|m| m.trim().to_string()).collect();
        }
        if let Some(v) = env_parse::<bool>("WAF_ADAPTIVE_LEARNING") {
            self.adaptive_learning = v;
        }
        if let Some(v) = env_parse::<f64>("WAF_LEARNING_PERIOD") {
            self.learning_period_days = v;
        }
        if let Some(v) = env_parse::<f64>("WAF_ANOMALY_THRESHOLD") {
            self.anomaly_threshold = v;
        }
        if let Some(v) = std::env::var("WAF_SKIP_PATHS")
            .ok()
            .filter(|v| !v.is_empty())
        {
            self.skip_paths = v.split(',').map(|p| p.trim().to_string()).collect();
        }
        if let Some(v) = std::env::var("WAF_API_KEY").ok().filter(|v| !v.is_empty()) {
            self.api_key = Some(v);
        }
    }

    /// Validate the configuration, dropping recoverable bad items with a
    /// warning and failing on fatal ones.
    pub fn validate(&mut self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(Error::config(format!(
                "threshold must be a positive number, got {}",
                self.threshold
            )));
        }
        if self.learning_period_days <= 0.0 {
            return Err(Error::config(format!(
                "learning-period-days must be positive, got {}",
                self.learning_period_days
            )));
        }
        if !self.anomaly_threshold.is_finite() || self.anomaly_threshold <= 0.0 {
            warn!(
                value = self.anomaly_threshold,
                "invalid anomaly threshold, using default"
            );
            self.anomaly_threshold = default_anomaly_threshold();
        }

        // Unknown module names are dropped, not fatal.
        self.modules.retain(|name| {
            let known = KNOWN_MODULES.contains(&name.as_str());
            if !known {
                warn!(module = %name, "unknown detection module, skipping");
            }
            known
        });

        if self.community_rules && self.community_rules_url.is_none() {
            warn!("community rules enabled without a feed URL, disabling");
            self.community_rules = false;
        }
        Ok(())
    }

    /// Learning period expressed in milliseconds.
    pub fn learning_period_ms(&self) -> u64 {
        (self.learning_period_days * 86_400_000.0) as u64
    }

    /// Whether a path bypasses the pipeline entirely.
    pub fn is_skip_path(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| path == p)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f64 {
    10.0
}

fn default_modules() -> Vec<String> {
    vec!["xss".to_string(), "sqli".to_string()]
}

fn default_learning_period() -> f64 {
    7.0
}

fn default_anomaly_threshold() -> f64 {
    5.0
}

fn default_skip_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/metrics".to_string(),
        "/favicon.ico".to_string(),
    ]
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_rate_max() -> u64 {
    100
}

fn default_block_duration() -> u64 {
    3_600_000
}

fn default_max_violations() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    7
}

fn default_update_interval() -> u64 {
    86_400_000
}

fn default_max_logs() -> usize {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WafConfig::default();
        assert!(config.enabled);
        assert!(!config.dry_run);
        assert_eq!(config.threshold, 10.0);
        assert_eq!(config.modules, vec!["xss", "sqli"]);
        assert_eq!(config.anomaly_threshold, 5.0);
        assert_eq!(config.learning_period_days, 7.0);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.update_interval_ms, 86_400_000);
        assert_eq!(config.max_logs, 10_000);
    }

    #[test]
    fn test_skip_paths() {
        let config = WafConfig::default();
        assert!(config.is_skip_path("/health"));
        assert!(config.is_skip_path("/metrics"));
        assert!(config.is_skip_path("/favicon.ico"));
        assert!(!config.is_skip_path("/api/users"));
        assert!(!config.is_skip_path("/health/ready"));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = WafConfig {
            threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_drops_unknown_module() {
        let mut config = WafConfig {
            modules: vec!["xss".to_string(), "quantum".to_string()],
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.modules, vec!["xss"]);
    }

    #[test]
    fn test_validate_resets_anomaly_threshold() {
        let mut config = WafConfig {
            anomaly_threshold: -1.0,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.anomaly_threshold, 5.0);
    }

    #[test]
    fn test_community_requires_url() {
        let mut config = WafConfig {
            community_rules: true,
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(!config.community_rules);
    }

    #[test]
    fn test_file_overlay() {
        let json = r#"{
            "dry-run": true,
            "threshold": 5.0,
            "modules": ["xss", "sqli", "nosqli"],
            "rate-limit": { "window-ms": 1000, "max": 2 }
        }"#;
        let config: WafConfig = serde_json::from_str(json).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.threshold, 5.0);
        assert_eq!(config.modules.len(), 3);
        assert_eq!(config.rate_limit.max, 2);
        // Untouched keys keep their defaults.
        assert!(config.enabled);
        assert_eq!(config.anomaly_threshold, 5.0);
    }

    #[test]
    fn test_learning_period_ms() {
        let config = WafConfig {
            learning_period_days: 0.5,
            ..Default::default()
        };
        assert_eq!(config.learning_period_ms(), 43_200_000);
    }
}
