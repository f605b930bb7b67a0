//! Adaptive learning state machine.
//!
//! A phased observation period scheduled by wall-clock deltas from the start
//! time: Collecting (0–60% of the learning period) buffers traffic,
//! Analyzing (60–80%) computes distributions and a normal-behavior profile,
//! Adapting (80–100%) derives thresholds and recommendations, and Protecting
//! (after 100%) freezes the baseline and hands enforcement to the rule
//! engine. Transitions are one-way and Protecting is terminal; a learner
//! that is disabled at boot starts there directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::info;

use crate::request::AnalysisRecord;

/// Phase of the adaptive learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningPhase {
    Collecting,
    Analyzing,
    Adapting,
    Protecting,
}

impl LearningPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LearningPhase::Collecting,
            1 => LearningPhase::Analyzing,
            2 => LearningPhase::Adapting,
            _ => LearningPhase::Protecting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LearningPhase::Collecting => 0,
            LearningPhase::Analyzing => 1,
            LearningPhase::Adapting => 2,
            LearningPhase::Protecting => 3,
        }
    }
}

impl std::fmt::Display for LearningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LearningPhase::Collecting => write!(f, "collecting"),
            LearningPhase::Analyzing => write!(f, "analyzing"),
            LearningPhase::Adapting => write!(f, "adapting"),
            LearningPhase::Protecting => write!(f, "protecting"),
        }
    }
}

/// Score thresholds derived from observed traffic percentiles.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThresholdSet {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

/// A recommendation produced while adapting.
#[derive(Debug, Clone, Serialize)]
pub struct Adaptation {
    /// Recommendation kind, e.g. `ip-frequency-threshold`.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Recommended numeric value, when applicable.
    pub value: f64,
}

/// Profile of normal traffic computed during analysis.
#[derive(Debug, Clone, Serialize)]
pub struct NormalProfile {
    /// Most frequent paths with counts.
    pub top_paths: Vec<(String, u64)>,
    /// Most frequent user agents with counts.
    pub top_user_agents: Vec<(String, u64)>,
    /// Method distribution.
    pub methods: Vec<(String, u64)>,
    /// Mean observed body size in bytes.
    pub mean_body_size: f64,
    /// Mean requests per distinct IP over the buffered window.
    pub mean_requests_per_ip: f64,
}

/// Final report emitted on entering Protecting.
#[derive(Debug, Clone, Serialize)]
pub struct LearningReport {
    pub started_ms: i64,
    pub finished_ms: i64,
    pub requests_observed: usize,
    pub threats_observed: usize,
    pub thresholds: Option<ThresholdSet>,
    pub adaptations: Vec<Adaptation>,
}

#[derive(Debug, Clone)]
struct RequestSample {
    ip: String,
    path: String,
    user_agent: Option<String>,
    method: String,
    body_size: usize,
    score: f64,
}

#[derive(Debug, Clone)]
struct ThreatSample {
    kind: String,
    score: f64,
}

struct LearnState {
    requests: VecDeque<RequestSample>,
    threats: VecDeque<ThreatSample>,
    profile: Option<NormalProfile>,
    thresholds: Option<ThresholdSet>,
    adaptations: Vec<Adaptation>,
    report: Option<LearningReport>,
}

/// The adaptive learner.
pub struct AdaptiveLearner {
    start_ms: i64,
    period_ms: i64,
    buffer_cap: usize,
    phase: AtomicU8,
    state: RwLock<LearnState>,
}

impl AdaptiveLearner {
    /// Create a learner. With `enabled = false` the learner starts directly
    /// in Protecting and never buffers anything.
    pub fn new(enabled: bool, start_ms: i64, period_ms: i64, buffer_cap: usize) -> Self {
        let initial = if enabled {
            LearningPhase::Collecting
        } else {
            LearningPhase::Protecting
        };
        Self {
            start_ms,
            period_ms: period_ms.max(1) as i64,
            buffer_cap: buffer_cap.max(1),
            phase: AtomicU8::new(initial.as_u8()),
            state: RwLock::new(LearnState {
                requests: VecDeque::new(),
                threats: VecDeque::new(),
                profile: None,
                thresholds: None,
                adaptations: Vec::new(),
                report: None,
            }),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> LearningPhase {
        LearningPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Whether the rule-engine verdict is enforced.
    pub fn is_enforcing(&self) -> bool {
        self.phase() == LearningPhase::Protecting
    }

    /// Fraction of the learning period elapsed at `now_ms`, clamped to [0, 1].
    pub fn progress(&self, now_ms: i64) -> f64 {
        if self.phase() == LearningPhase::Protecting {
            return 1.0;
        }
        ((now_ms - self.start_ms) as f64 / self.period_ms as f64).clamp(0.0, 1.0)
    }

    /// Advance the phase for the given wall-clock time, running entry
    /// actions for every phase crossed. Transitions are one-way: an older
    /// timestamp never regresses the phase.
    pub fn tick(&self, now_ms: i64) {
        let current = self.phase();
        if current == LearningPhase::Protecting {
            return;
        }

        let elapsed = (now_ms - self.start_ms) as f64 / self.period_ms as f64;
        let target = if elapsed >= 1.0 {
            LearningPhase::Protecting
        } else if elapsed >= 0.8 {
            LearningPhase::Adapting
        } else if elapsed >= 0.6 {
            LearningPhase::Analyzing
        } else {
            LearningPhase::Collecting
        };

        if target.as_u8() <= current.as_u8() {
            return;
        }

        let mut state = self.state.write();
        // Re-check under the lock; another thread may have advanced already.
        let current = self.phase();
        for next in (current.as_u8() + 1)..=target.as_u8() {
            let next = LearningPhase::from_u8(next);
            match next {
                LearningPhase::Analyzing => self.enter_analyzing(&mut state),
                LearningPhase::Adapting => self.enter_adapting(&mut state),
                LearningPhase::Protecting => self.enter_protecting(&mut state, now_ms),
                LearningPhase::Collecting => {}
            }
            self.phase.store(next.as_u8(), Ordering::Release);
            info!(phase = %next, "learning phase transition");
        }
    }

    /// Feed one analyzed request into the learner. No-op once Protecting.
    pub fn observe(&self, record: &AnalysisRecord, total_score: f64) {
        self.tick(record.timestamp.timestamp_millis());
        if self.phase() == LearningPhase::Protecting {
            return;
        }

        let mut state = self.state.write();
        if state.requests.len() >= self.buffer_cap {
            state.requests.pop_front();
        }
        state.requests.push_back(RequestSample {
            ip: record.ip.clone(),
            path: record.path.clone(),
            user_agent: record.user_agent.clone(),
            method: record.method.clone(),
            body_size: record.body_size(),
            score: total_score,
        });

        for threat in &record.threats {
            if state.threats.len() >= self.buffer_cap {
                state.threats.pop_front();
            }
            state.threats.push_back(ThreatSample {
                kind: threat.kind.clone(),
                score: threat.score,
            });
        }
    }

    /// Thresholds derived while adapting, if reached.
    pub fn thresholds(&self) -> Option<ThresholdSet> {
        self.state.read().thresholds
    }

    /// Adaptation recommendations derived while adapting.
    pub fn adaptations(&self) -> Vec<Adaptation> {
        self.state.read().adaptations.clone()
    }

    /// Normal-behavior profile computed during analysis.
    pub fn profile(&self) -> Option<NormalProfile> {
        self.state.read().profile.clone()
    }

    /// Final report, available once Protecting.
    pub fn report(&self) -> Option<LearningReport> {
        self.state.read().report.clone()
    }

    /// Number of buffered request samples.
    pub fn buffered_requests(&self) -> usize {
        self.state.read().requests.len()
    }

    fn enter_analyzing(&self, state: &mut LearnState) {
        let mut paths: FxHashMap<String, u64> = FxHashMap::default();
        let mut agents: FxHashMap<String, u64> = FxHashMap::default();
        let mut methods: FxHashMap<String, u64> = FxHashMap::default();
        let mut per_ip: FxHashMap<String, u64> = FxHashMap::default();
        let mut body_sum = 0u64;

        for sample in &state.requests {
            *paths.entry(sample.path.clone()).or_insert(0) += 1;
            if let Some(ua) = &sample.user_agent {
                *agents.entry(ua.clone()).or_insert(0) += 1;
            }
            *methods.entry(sample.method.clone()).or_insert(0) += 1;
            *per_ip.entry(sample.ip.clone()).or_insert(0) += 1;
            body_sum += sample.body_size as u64;
        }

        let count = state.requests.len();
        let mean_body_size = if count == 0 {
            0.0
        } else {
            body_sum as f64 / count as f64
        };
        let mean_requests_per_ip = if per_ip.is_empty() {
            0.0
        } else {
            count as f64 / per_ip.len() as f64
        };

        state.profile = Some(NormalProfile {
            top_paths: top_n(paths, 10),
            top_user_agents: top_n(agents, 10),
            methods: top_n(methods, 10),
            mean_body_size,
            mean_requests_per_ip,
        });
        info!(requests = count, "normal-behavior profile computed");
    }

    fn enter_adapting(&self, state: &mut LearnState) {
        // Percentile thresholds over the positive scores observed, with
        // floors so sparse traffic cannot produce degenerate values.
        let mut scores: Vec<f64> = state
            .requests
            .iter()
            .map(|s| s.score)
            .filter(|s| *s > 0.0)
            .collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        state.thresholds = Some(ThresholdSet {
            low: percentile(&scores, 50.0).max(1.0),
            medium: percentile(&scores, 75.0).max(3.0),
            high: percentile(&scores, 90.0).max(5.0),
            critical: percentile(&scores, 95.0).max(10.0),
        });

        let mut adaptations = Vec::new();
        if let Some(profile) = &state.profile {
            if profile.mean_requests_per_ip > 0.0 {
                adaptations.push(Adaptation {
                    kind: "ip-frequency-threshold".to_string(),
                    description: "requests per IP per window before flagging".to_string(),
                    value: profile.mean_requests_per_ip * 3.0,
                });
            }
            if profile.mean_body_size > 0.0 {
                adaptations.push(Adaptation {
                    kind: "body-size-threshold".to_string(),
                    description: "body size in bytes before flagging".to_string(),
                    value: profile.mean_body_size * 2.0,
                });
            }
        }

        let mut threat_counts: FxHashMap<&str, u64> = FxHashMap::default();
        for threat in &state.threats {
            *threat_counts.entry(threat.kind.as_str()).or_insert(0) += 1;
        }
        for (kind, count) in threat_counts {
            if count > 5 {
                adaptations.push(Adaptation {
                    kind: "custom-rule-suggestion".to_string(),
                    description: format!("recurring {kind} threats observed {count} times"),
                    value: count as f64,
                });
            }
        }

        state.adaptations = adaptations;
        info!(
            adaptations = state.adaptations.len(),
            "adaptive thresholds derived"
        );
    }

    fn enter_protecting(&self, state: &mut LearnState, now_ms: i64) {
        state.report = Some(LearningReport {
            started_ms: self.start_ms,
            finished_ms: now_ms,
            requests_observed: state.requests.len(),
            threats_observed: state.threats.len(),
            thresholds: state.thresholds,
            adaptations: state.adaptations.clone(),
        });
        info!(
            requests = state.requests.len(),
            threats = state.threats.len(),
            "learning complete, enforcement active"
        );
    }
}

fn top_n(map: FxHashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = map.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;
    use chrono::{TimeZone, Utc};

    const PERIOD: i64 = 1_000_000;

    fn record_at(offset_ms: i64, ip: &str, score: f64) -> (AnalysisRecord, f64) {
        let ts = Utc.timestamp_millis_opt(offset_ms).unwrap();
        let input = RequestInput::new("GET", "/api/users")
            .with_remote_addr(ip)
            .with_header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
            .with_timestamp(ts);
        (AnalysisRecord::from_input(&input), score)
    }

    #[test]
    fn test_disabled_starts_protecting() {
        let learner = AdaptiveLearner::new(false, 0, PERIOD, 100);
        assert_eq!(learner.phase(), LearningPhase::Protecting);
        assert!(learner.is_enforcing());
    }

    #[test]
    fn test_phase_schedule() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 100);
        assert_eq!(learner.phase(), LearningPhase::Collecting);

        learner.tick(PERIOD * 59 / 100);
        assert_eq!(learner.phase(), LearningPhase::Collecting);

        learner.tick(PERIOD * 60 / 100);
        assert_eq!(learner.phase(), LearningPhase::Analyzing);

        learner.tick(PERIOD * 80 / 100);
        assert_eq!(learner.phase(), LearningPhase::Adapting);

        learner.tick(PERIOD);
        assert_eq!(learner.phase(), LearningPhase::Protecting);
    }

    #[test]
    fn test_transitions_one_way() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 100);
        learner.tick(PERIOD * 70 / 100);
        assert_eq!(learner.phase(), LearningPhase::Analyzing);

        // An older timestamp must not regress the phase.
        learner.tick(PERIOD * 10 / 100);
        assert_eq!(learner.phase(), LearningPhase::Analyzing);
    }

    #[test]
    fn test_jump_runs_all_entry_actions() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 100);
        for i in 0..20 {
            let (record, score) = record_at(i, &format!("10.0.0.{}", i % 4), (i % 7) as f64);
            learner.observe(&record, score);
        }

        // Jump straight past the end of the period.
        learner.tick(PERIOD + 1);
        assert_eq!(learner.phase(), LearningPhase::Protecting);
        assert!(learner.profile().is_some());
        assert!(learner.thresholds().is_some());
        let report = learner.report().unwrap();
        assert_eq!(report.requests_observed, 20);
    }

    #[test]
    fn test_threshold_floors() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 100);
        // Tiny scores only; the floors must hold.
        for i in 0..10 {
            let (record, score) = record_at(i, "10.0.0.1", 0.5);
            learner.observe(&record, score);
        }
        learner.tick(PERIOD);
        let t = learner.thresholds().unwrap();
        assert_eq!(t.low, 1.0);
        assert_eq!(t.medium, 3.0);
        assert_eq!(t.high, 5.0);
        assert_eq!(t.critical, 10.0);
    }

    #[test]
    fn test_percentile_thresholds_from_scores() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 1000);
        // Scores 1..=100 uniformly.
        for i in 1..=100 {
            let (record, score) = record_at(i as i64, "10.0.0.1", i as f64);
            learner.observe(&record, score);
        }
        learner.tick(PERIOD);
        let t = learner.thresholds().unwrap();
        assert!((t.low - 50.0).abs() <= 1.0);
        assert!((t.medium - 75.0).abs() <= 1.0);
        assert!((t.high - 90.0).abs() <= 1.0);
        assert!((t.critical - 95.0).abs() <= 1.0);
    }

    #[test]
    fn test_ring_buffer_cap() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 50);
        for i in 0..200 {
            let (record, score) = record_at(i, "10.0.0.1", 0.0);
            learner.observe(&record, score);
        }
        assert_eq!(learner.buffered_requests(), 50);
    }

    #[test]
    fn test_custom_rule_suggestion_for_recurring_threats() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 1000);
        for i in 0..10 {
            let (mut record, _) = record_at(i, "10.0.0.1", 7.0);
            record.add_threat(crate::request::Threat::new(
                "xss",
                "script-tag",
                "Script tag injection",
                3.0,
                "<script>",
            ));
            learner.observe(&record, 7.0);
        }
        learner.tick(PERIOD);
        let adaptations = learner.adaptations();
        assert!(adaptations
            .iter()
            .any(|a| a.kind == "custom-rule-suggestion" && a.description.contains("xss")));
    }

    #[test]
    fn test_observe_after_protecting_is_noop() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 100);
        learner.tick(PERIOD);
        let (record, score) = record_at(PERIOD + 5, "10.0.0.1", 1.0);
        learner.observe(&record, score);
        assert_eq!(learner.buffered_requests(), 0);
    }

    #[test]
    fn test_progress() {
        let learner = AdaptiveLearner::new(true, 0, PERIOD, 100);
        assert_eq!(learner.progress(0), 0.0);
        assert!((learner.progress(PERIOD / 2) - 0.5).abs() < 1e-9);
        learner.tick(PERIOD * 2);
        assert_eq!(learner.progress(0), 1.0);
    }
}
