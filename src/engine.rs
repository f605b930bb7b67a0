//! Rule engine.
//!
//! Runs the configured detection modules and the flat rule set over an
//! analysis record, accumulating the signature score on the record itself.
//! The block/allow comparison happens exactly once, downstream, over the
//! aggregated total (signature plus anomaly).

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::modules::DetectionModule;
use crate::request::{AnalysisRecord, Threat};
use crate::rules::RuleSnapshot;

/// Outcome of signature evaluation for one request.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    /// Stable request id, monotonic in time.
    pub request_id: String,
    /// Signature score: module contributions plus flat rule matches.
    pub signature_score: f64,
}

/// Signature evaluation engine.
pub struct RuleEngine {
    modules: Vec<Box<dyn DetectionModule>>,
    sequence: AtomicU64,
}

impl RuleEngine {
    /// Create an engine over the given modules.
    pub fn new(modules: Vec<Box<dyn DetectionModule>>) -> Self {
        Self {
            modules,
            sequence: AtomicU64::new(0),
        }
    }

    /// Names of the loaded modules.
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Run all modules and the flat rule set against the record, adding
    /// every matched threat to it. Returns the request id and the signature
    /// score contributed by this evaluation.
    pub fn evaluate(&self, record: &mut AnalysisRecord, rules: &RuleSnapshot) -> EngineOutcome {
        let request_id = self.issue_request_id(record);
        let before = record.score;

        for module in &self.modules {
            record.touch_module(module.name());
            if let Some(result) = module.analyze(record) {
                debug!(
                    module = result.module,
                    score = result.score,
                    threats = result.threats.len(),
                    "module detections"
                );
                for threat in result.threats {
                    record.add_threat(threat);
                }
            }
        }

        self.evaluate_rules(record, rules);

        EngineOutcome {
            request_id,
            signature_score: record.score - before,
        }
    }

    /// Evaluate the flat rules over the scan surface. Rule order is
    /// unspecified; every matching (rule, target) pair contributes once.
    fn evaluate_rules(&self, record: &mut AnalysisRecord, rules: &RuleSnapshot) {
        if rules.is_empty() {
            return;
        }

        let mut matched = Vec::new();
        {
            let targets = record.scan_targets();
            for (_, text) in &targets {
                for rule in rules.iter() {
                    if let Some(m) = rule.pattern.find(text) {
                        matched.push(Threat::new(
                            rule.category.clone(),
                            rule.id.clone(),
                            rule.name.clone(),
                            rule.score,
                            m.as_str(),
                        ));
                    }
                }
            }
        }

        for threat in matched {
            debug!(rule_id = %threat.pattern, score = threat.score, "rule match");
            record.add_threat(threat);
        }
    }

    /// Block decision over an aggregated total. The comparison is `>=`.
    pub fn should_block(total_score: f64, threshold: f64) -> bool {
        total_score >= threshold
    }

    /// Issue a request id: millisecond timestamp plus a process-monotonic
    /// sequence number.
    pub fn issue_request_id(&self, record: &AnalysisRecord) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:06}", record.timestamp.timestamp_millis(), seq)
    }
}
