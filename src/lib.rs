//! Palisade WAF core library.
//!
//! A request-inspection layer that sits in front of an HTTP application:
//! every incoming request gets a threat score from the signature rule engine
//! and a statistical anomaly scorer, combined with a rate-limit / IP-block
//! verdict, and is then allowed, blocked, or merely logged.
//!
//! # Features
//!
//! - **Signature detection**: pluggable modules (XSS, SQLi, NoSQLi, path
//!   traversal, command injection) plus a flat rule set with an embedded
//!   catalog, JSON files, and a community feed
//! - **Anomaly scoring**: bounded deviation factors against a learned
//!   traffic baseline
//! - **Adaptive learning**: an observation period that profiles traffic and
//!   derives per-deployment thresholds before enforcement starts
//! - **Rate limiting and IP blocking**: sharded per-IP windows with a TTL
//!   block table
//! - **Fail-open**: internal errors emit an `error` event and let the
//!   request through
//!
//! # Example
//!
//! ```ignore
//! use palisade_waf::{RequestInput, Waf, WafConfig};
//!
//! let waf = Waf::new(WafConfig::default())?;
//! let decision = waf.analyze(&RequestInput::new("GET", "/api/search"));
//! if decision.is_block() {
//!     // respond with decision.response (403 + JSON body)
//! }
//! ```

pub mod anomaly;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod learning;
pub mod metrics;
pub mod modules;
pub mod ratelimit;
pub mod request;
pub mod rules;
pub mod stats;

// Re-exports for convenience
pub use anomaly::{AnomalyFactor, AnomalyResult, AnomalyScorer};
pub use config::{IpBlockingConfig, RateLimitConfig, StatsConfig, WafConfig};
pub use engine::RuleEngine;
pub use error::{Error, Result};
pub use events::{EventBus, ThreatEventKind, WafEvent};
pub use learning::{AdaptiveLearner, LearningPhase};
pub use ratelimit::RateLimiter;
pub use request::{AnalysisRecord, Body, QueryValue, RequestInput, Threat};
pub use rules::{Rule, RuleManager, RuleSource, Severity};
pub use stats::{StatsCollector, StatsSnapshot, ThreatAction};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use metrics::MetricsRegistry;
use ratelimit::RateLimitOutcome;

/// Histogram buckets for request duration, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Sweeper interval for expired windows, blocks, and stale buckets.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// JSON body returned with a 403.
#[derive(Debug, Clone, Serialize)]
pub struct BlockBody {
    pub error: String,
    pub reason: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub score: f64,
    #[serde(rename = "anomalyScore")]
    pub anomaly_score: f64,
    pub threats: Vec<Threat>,
    pub timestamp: DateTime<Utc>,
}

/// Refusal response for a blocked request.
#[derive(Debug, Clone, Serialize)]
pub struct BlockResponse {
    /// HTTP status to send (always 403).
    pub status: u16,
    /// JSON body.
    pub body: BlockBody,
}

/// Outcome of analyzing one request.
#[derive(Debug, Clone)]
pub struct WafDecision {
    /// Stable request id; empty when the pipeline was bypassed.
    pub request_id: String,
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Signature score (modules plus flat rules plus rate-limit threats).
    pub score: f64,
    /// Anomaly score.
    pub anomaly_score: f64,
    /// Combined score the threshold was compared against.
    pub total_score: f64,
    /// Matched threats.
    pub threats: Vec<Threat>,
    /// Learning phase at decision time.
    pub phase: LearningPhase,
    /// Refusal response when blocked.
    pub response: Option<BlockResponse>,
}

impl WafDecision {
    /// Whether the request was blocked.
    pub fn is_block(&self) -> bool {
        !self.allowed
    }

    fn passthrough(phase: LearningPhase) -> Self {
        Self {
            request_id: String::new(),
            allowed: true,
            score: 0.0,
            anomaly_score: 0.0,
            total_score: 0.0,
            threats: Vec::new(),
            phase,
            response: None,
        }
    }
}

/// Handle over the periodic maintenance tasks. Aborts them on shutdown or
/// drop.
pub struct MaintenanceHandle {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop all maintenance tasks.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The WAF core: one request in, one verdict out.
pub struct Waf {
    config: WafConfig,
    engine: RuleEngine,
    rules: Arc<RuleManager>,
    anomaly: Arc<AnomalyScorer>,
    learner: Arc<AdaptiveLearner>,
    rate_limiter: Arc<RateLimiter>,
    stats: Arc<StatsCollector>,
    metrics: Arc<MetricsRegistry>,
    events: EventBus,
}

impl Waf {
    /// Build the core from a validated configuration.
    pub fn new(config: WafConfig) -> Result<Self> {
        let mut config = config;
        config.validate()?;

        let modules = modules::build_signature_modules(&config.modules)?;
        let engine = RuleEngine::new(modules);

        let rules = Arc::new(RuleManager::with_builtin()?);
        if let Some(path) = &config.rules_file {
            match rules.load_file(path) {
                Ok(count) => info!(path = %path.display(), rules = count, "loaded rules file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load rules file"),
            }
        }

        let anomaly = Arc::new(AnomalyScorer::new(config.anomaly_threshold)?);
        let learner = Arc::new(AdaptiveLearner::new(
            config.adaptive_learning,
            Utc::now().timestamp_millis(),
            config.learning_period_ms() as i64,
            config.max_logs,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            config.ip_blocking.clone(),
        ));
        let stats = Arc::new(StatsCollector::new(
            config.stats.enabled,
            config.stats.retention_days,
        ));

        let metrics = Arc::new(MetricsRegistry::new());
        register_metric_families(&metrics);

        info!(
            modules = ?engine.module_names(),
            threshold = config.threshold,
            dry_run = config.dry_run,
            adaptive_learning = config.adaptive_learning,
            rate_limit = config.rate_limit.enabled,
            ip_blocking = config.ip_blocking.enabled,
            "WAF core initialized"
        );

        Ok(Self {
            config,
            engine,
            rules,
            anomaly,
            learner,
            rate_limiter,
            stats,
            metrics,
            events: EventBus::new(),
        })
    }

    /// Analyze one request and decide.
    ///
    /// Never panics: any internal failure emits an `error` event and the
    /// request is allowed (fail-open). Skip-paths bypass the pipeline
    /// entirely.
    pub fn analyze(&self, input: &RequestInput) -> WafDecision {
        if !self.config.enabled || self.config.is_skip_path(&input.path) {
            return WafDecision::passthrough(self.learner.phase());
        }

        let started = std::time::Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| self.analyze_inner(input)));
        match result {
            Ok(decision) => {
                let status = if decision.allowed { "allowed" } else { "blocked" };
                self.metrics.observe_histogram(
                    "waf_request_duration_seconds",
                    &[&input.method, status],
                    started.elapsed().as_secs_f64(),
                );
                decision
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(message = %message, "analysis failed, allowing request");
                self.metrics.inc_counter("waf_errors_total", &["analysis"]);
                self.events.emit(WafEvent::Error {
                    stage: "analysis".to_string(),
                    message,
                });
                WafDecision::passthrough(self.learner.phase())
            }
        }
    }

    fn analyze_inner(&self, input: &RequestInput) -> WafDecision {
        let mut record = AnalysisRecord::from_input(input);
        let now_ms = record.timestamp.timestamp_millis();
        self.learner.tick(now_ms);

        // Already-blocked IPs short-circuit the scan entirely.
        let request_id;
        let anomaly;
        if let Some(threat) = self.rate_limiter.blocked_threat_at(&record.ip, now_ms) {
            record.touch_module("ratelimit");
            record.add_threat(threat);
            request_id = self.engine.issue_request_id(&record);
            anomaly = AnomalyResult {
                total_score: 0.0,
                factors: Vec::new(),
                is_anomaly: false,
                confidence: 0.0,
            };
        } else {
            let outcome = self.engine.evaluate(&mut record, &self.rules.enabled_rules());
            request_id = outcome.request_id;

            if self.config.rate_limit.enabled {
                record.touch_module("ratelimit");
                match self.rate_limiter.check_at(&record.ip, now_ms) {
                    RateLimitOutcome::Allowed => {}
                    RateLimitOutcome::Limited(threat) => {
                        self.metrics
                            .inc_counter("waf_rate_limit_hits_total", &[&record.ip]);
                        if self.rate_limiter.is_blocked_at(&record.ip, now_ms) {
                            self.metrics
                                .inc_counter("waf_ip_blocks_total", &["rate-limit-violations"]);
                        }
                        record.add_threat(threat);
                    }
                    RateLimitOutcome::Blocked(threat) => {
                        record.add_threat(threat);
                    }
                }
            }

            anomaly = self.anomaly.score(&record);
        }

        let total = record.score + anomaly.total_score;
        let phase = self.learner.phase();

        // Baselines only move while the learner is observing; the per-IP
        // frequency window inside the scorer keeps moving regardless.
        if phase != LearningPhase::Protecting {
            self.anomaly.learn(&record);
            self.learner.observe(&record, total);
        }

        let method = record.method.clone();
        let decision = self.decide(record, request_id, anomaly, total, phase);
        self.record_outcome(&method, &decision);
        decision
    }

    fn decide(
        &self,
        record: AnalysisRecord,
        request_id: String,
        anomaly: AnomalyResult,
        total: f64,
        phase: LearningPhase,
    ) -> WafDecision {
        let would_block = RuleEngine::should_block(total, self.config.threshold);

        let (allowed, response, event_kind) = if phase != LearningPhase::Protecting {
            (true, None, (total > 0.0).then_some(ThreatEventKind::Learning))
        } else if !would_block {
            (
                true,
                None,
                (!record.threats.is_empty()).then_some(ThreatEventKind::Detected),
            )
        } else if self.config.dry_run {
            (true, None, Some(ThreatEventKind::DryRun))
        } else {
            (false, Some(()), None)
        };

        let response = response.map(|()| BlockResponse {
            status: 403,
            body: BlockBody {
                error: "Forbidden".to_string(),
                reason: "Request blocked by security policy".to_string(),
                request_id: request_id.clone(),
                score: record.score,
                anomaly_score: anomaly.total_score,
                threats: record.threats.clone(),
                timestamp: record.timestamp,
            },
        });

        if let Some(kind) = event_kind {
            self.events.emit(WafEvent::ThreatDetected {
                kind,
                request_id: request_id.clone(),
                ip: record.ip.clone(),
                path: record.path.clone(),
                score: record.score,
                anomaly_score: anomaly.total_score,
                threats: record.threats.clone(),
                timestamp: record.timestamp,
            });
        }
        if !allowed {
            warn!(
                request_id = %request_id,
                ip = %record.ip,
                path = %record.path,
                score = record.score,
                anomaly_score = anomaly.total_score,
                threats = record.threats.len(),
                "request blocked"
            );
            self.events.emit(WafEvent::RequestBlocked {
                request_id: request_id.clone(),
                ip: record.ip.clone(),
                path: record.path.clone(),
                score: record.score,
                anomaly_score: anomaly.total_score,
                threats: record.threats.clone(),
                timestamp: record.timestamp,
            });
        }

        let action = match (allowed, event_kind) {
            (false, _) => Some(ThreatAction::Blocked),
            (true, Some(ThreatEventKind::Learning)) => Some(ThreatAction::Learning),
            (true, Some(ThreatEventKind::DryRun)) => Some(ThreatAction::DryRun),
            (true, Some(ThreatEventKind::Detected)) => Some(ThreatAction::Detected),
            (true, None) => None,
        };
        self.stats.record_request(&record);
        if let Some(action) = action {
            self.stats.record_threat(&record, action);
        }

        WafDecision {
            request_id,
            allowed,
            score: record.score,
            anomaly_score: anomaly.total_score,
            total_score: total,
            threats: record.threats,
            phase,
            response,
        }
    }

    fn record_outcome(&self, method: &str, decision: &WafDecision) {
        let status = if decision.allowed { "allowed" } else { "blocked" };
        self.metrics
            .inc_counter("waf_requests_total", &[method, status]);

        for threat in &decision.threats {
            self.metrics.inc_counter(
                "waf_threats_total",
                &[&threat.kind, severity_band(threat.score)],
            );
            self.metrics
                .inc_counter("waf_rule_matches_total", &[&threat.pattern, &threat.kind]);
        }

        if decision.is_block() {
            let leading = decision
                .threats
                .iter()
                .max_by(|a, b| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|t| t.kind.clone())
                .unwrap_or_else(|| "anomaly".to_string());
            self.metrics
                .inc_counter("waf_blocks_total", &[&leading, &leading]);
        }

        if decision.phase != LearningPhase::Protecting {
            self.metrics.inc_counter(
                "waf_learning_requests_total",
                &[&decision.phase.to_string()],
            );
        }
    }

    /// Subscribe to the event stream.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<WafEvent> {
        self.events.subscribe()
    }

    /// The rule manager, for admin operations.
    pub fn rules(&self) -> &RuleManager {
        &self.rules
    }

    /// The rate limiter, for manual block/unblock.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The adaptive learner.
    pub fn learner(&self) -> &AdaptiveLearner {
        &self.learner
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reset stats counters. Admin-triggered only.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Active configuration.
    pub fn config(&self) -> &WafConfig {
        &self.config
    }

    /// Render metrics in the text exposition format, refreshing gauges
    /// first.
    pub fn metrics_text(&self) -> String {
        self.metrics.set_gauge(
            "waf_blocked_ips",
            &[],
            self.rate_limiter.blocked_count() as f64,
        );
        let phase = self.learner.phase().to_string();
        self.metrics.set_gauge(
            "waf_learning_progress",
            &[&phase],
            self.learner.progress(Utc::now().timestamp_millis()),
        );
        let stats = self.rules.stats();
        for (category, count) in &stats.by_category {
            self.metrics
                .set_gauge("waf_rules_enabled", &[category], *count as f64);
        }
        self.metrics.render()
    }

    /// Spawn the periodic maintenance tasks: the sweeper (rate windows,
    /// block TTLs, baseline windows, stats retention, phase transitions) and
    /// the community rules refresh when configured. Requires a tokio
    /// runtime.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let mut tasks = Vec::new();

        let rate_limiter = Arc::clone(&self.rate_limiter);
        let anomaly = Arc::clone(&self.anomaly);
        let stats = Arc::clone(&self.stats);
        let learner = Arc::clone(&self.learner);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let now_ms = now.timestamp_millis();
                learner.tick(now_ms);
                let (windows, blocks) = rate_limiter.sweep(now_ms);
                let baselines = anomaly.baseline().sweep(now_ms);
                stats.prune(now);
                if windows + blocks + baselines > 0 {
                    info!(windows, blocks, baselines, "sweeper pass complete");
                }
            }
        }));

        if self.config.community_rules && self.config.auto_update {
            if let Some(url) = &self.config.community_rules_url {
                tasks.push(rules::community::spawn_refresh_task(
                    Arc::clone(&self.rules),
                    url.clone(),
                    self.config.update_interval_ms,
                ));
            }
        }

        MaintenanceHandle { tasks }
    }
}

fn register_metric_families(metrics: &MetricsRegistry) {
    metrics.register_counter(
        "waf_requests_total",
        "Requests processed",
        &["method", "status"],
    );
    metrics.register_counter(
        "waf_threats_total",
        "Threats detected",
        &["type", "severity"],
    );
    metrics.register_counter("waf_blocks_total", "Requests blocked", &["reason", "module"]);
    metrics.register_counter(
        "waf_learning_requests_total",
        "Requests observed during learning",
        &["phase"],
    );
    metrics.register_counter(
        "waf_rule_matches_total",
        "Rule and pattern matches",
        &["rule_id", "category"],
    );
    metrics.register_counter("waf_ip_blocks_total", "IPs blocked", &["reason"]);
    metrics.register_counter("waf_rate_limit_hits_total", "Rate limit hits", &["ip"]);
    metrics.register_counter("waf_errors_total", "Internal errors", &["stage"]);
    metrics.register_gauge("waf_blocked_ips", "Currently blocked IPs", &[]);
    metrics.register_gauge("waf_learning_progress", "Learning progress", &["phase"]);
    metrics.register_gauge("waf_rules_enabled", "Enabled rules", &["category"]);
    metrics.register_histogram(
        "waf_request_duration_seconds",
        "Request analysis duration",
        &["method", "status"],
        DURATION_BUCKETS,
    );
}

/// Map a threat score to a severity label for metrics.
fn severity_band(score: f64) -> &'static str {
    if score >= 8.0 {
        "critical"
    } else if score >= 5.0 {
        "high"
    } else if score >= 3.0 {
        "medium"
    } else {
        "low"
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Config with the anomaly scorer disabled so signature scores are
    /// exact.
    fn test_config(threshold: f64) -> WafConfig {
        WafConfig {
            threshold,
            anomaly_threshold: 1000.0,
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_xss_block() {
        let waf = Waf::new(test_config(5.0)).unwrap();
        let input = RequestInput::new("GET", "/api/search")
            .with_remote_addr("10.0.0.1")
            .with_query("q", r#"<script>alert("xss")</script>"#);

        let decision = waf.analyze(&input);
        assert!(decision.is_block());
        assert_eq!(decision.score, 7.0);
        let response = decision.response.unwrap();
        assert_eq!(response.status, 403);
        assert!(response
            .body
            .threats
            .iter()
            .any(|t| t.description == "Script tag injection"));
    }

    #[test]
    fn test_threshold_boundaries() {
        // Score 4 allows at the default threshold and blocks at 3.
        let waf = Waf::new(test_config(10.0)).unwrap();
        let input = RequestInput::new("GET", "/api/search")
            .with_remote_addr("10.0.0.1")
            .with_query("q", "1 UNION SELECT * FROM users");
        let decision = waf.analyze(&input);
        assert!(decision.allowed);
        assert_eq!(decision.score, 4.0);

        let waf = Waf::new(test_config(3.0)).unwrap();
        let decision = waf.analyze(&input);
        assert!(decision.is_block());
    }

    #[test]
    fn test_skip_path_bypasses_pipeline() {
        let waf = Waf::new(test_config(1.0)).unwrap();
        let input = RequestInput::new("GET", "/health")
            .with_query("q", "<script>alert(1)</script>");
        let decision = waf.analyze(&input);
        assert!(decision.allowed);
        assert!(decision.request_id.is_empty());
        assert_eq!(waf.stats().total_requests, 0);
    }

    #[test]
    fn test_disabled_waf_allows_everything() {
        let mut config = test_config(1.0);
        config.enabled = false;
        let waf = Waf::new(config).unwrap();
        let input = RequestInput::new("GET", "/x").with_query("q", "<script>alert(1)</script>");
        assert!(waf.analyze(&input).allowed);
    }

    #[test]
    fn test_dry_run_allows_and_emits_event() {
        let mut config = test_config(5.0);
        config.dry_run = true;
        let waf = Waf::new(config).unwrap();
        let mut events = waf.events();

        let input = RequestInput::new("GET", "/api/search")
            .with_remote_addr("10.0.0.1")
            .with_query("q", "<script>alert(1)</script>");
        let decision = waf.analyze(&input);
        assert!(decision.allowed);
        assert!(decision.response.is_none());

        match events.try_recv().unwrap() {
            WafEvent::ThreatDetected { kind, .. } => {
                assert_eq!(kind, ThreatEventKind::DryRun);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_block_emits_request_blocked() {
        let waf = Waf::new(test_config(5.0)).unwrap();
        let mut events = waf.events();

        let input = RequestInput::new("GET", "/api/search")
            .with_remote_addr("10.0.0.1")
            .with_query("q", "<script>alert(1)</script>");
        waf.analyze(&input);

        match events.try_recv().unwrap() {
            WafEvent::RequestBlocked { score, .. } => assert_eq!(score, 7.0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_metrics_exposition() {
        let waf = Waf::new(test_config(5.0)).unwrap();
        let input = RequestInput::new("GET", "/api/search")
            .with_remote_addr("10.0.0.1")
            .with_query("q", "<script>alert(1)</script>");
        waf.analyze(&input);

        let text = waf.metrics_text();
        assert!(text.contains("# TYPE waf_requests_total counter"));
        assert!(text.contains("waf_requests_total{method=\"GET\",status=\"blocked\"} 1"));
        assert!(text.contains("# TYPE waf_request_duration_seconds histogram"));
        assert!(text.contains("waf_request_duration_seconds_bucket"));
        assert!(text.contains("le=\"+Inf\""));
        assert!(text.contains("# TYPE waf_blocked_ips gauge"));
    }

    #[test]
    fn test_stats_updated() {
        let waf = Waf::new(test_config(5.0)).unwrap();
        let benign = RequestInput::new("GET", "/api/users").with_remote_addr("10.0.0.1");
        let attack = RequestInput::new("GET", "/api/search")
            .with_remote_addr("10.0.0.2")
            .with_query("q", "<script>alert(1)</script>");
        waf.analyze(&benign);
        waf.analyze(&attack);

        let stats = waf.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.blocked_requests, 1);
        assert!(stats.total_threats >= 2);
    }
}
