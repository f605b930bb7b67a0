//! Adaptive learning flow: observe-only phases, then enforcement.

use chrono::{Duration, Utc};
use palisade_waf::{
    LearningPhase, RateLimitConfig, RequestInput, ThreatEventKind, Waf, WafConfig, WafEvent,
};

fn learning_config() -> WafConfig {
    WafConfig {
        threshold: 5.0,
        anomaly_threshold: 1000.0,
        adaptive_learning: true,
        learning_period_days: 7.0,
        rate_limit: RateLimitConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn xss_input() -> RequestInput {
    RequestInput::new("GET", "/api/search")
        .with_remote_addr("203.0.113.7")
        .with_header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
        .with_query("q", "<script>alert(1)</script>")
}

#[test]
fn attacks_are_observed_not_enforced_while_learning() {
    let waf = Waf::new(learning_config()).unwrap();
    let mut events = waf.events();

    assert_eq!(waf.learner().phase(), LearningPhase::Collecting);

    let decision = waf.analyze(&xss_input());
    assert!(decision.allowed, "learning phases never enforce");
    assert_eq!(decision.score, 7.0);
    assert_eq!(decision.phase, LearningPhase::Collecting);

    match events.try_recv().unwrap() {
        WafEvent::ThreatDetected { kind, .. } => {
            assert_eq!(kind, ThreatEventKind::Learning);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn same_payload_blocks_after_the_learning_period() {
    let waf = Waf::new(learning_config()).unwrap();

    // t = 0: observed, allowed.
    assert!(waf.analyze(&xss_input()).allowed);

    // Fast-forward past the end of the learning period by stamping the
    // request eight days ahead; phase transitions follow request time.
    let later = Utc::now() + Duration::days(8);
    let decision = waf.analyze(&xss_input().with_timestamp(later));
    assert_eq!(decision.phase, LearningPhase::Protecting);
    assert!(decision.is_block());

    // The learner emitted its final report on entering Protecting.
    let report = waf.learner().report().expect("report exists");
    assert!(report.requests_observed >= 1);
    assert!(report.thresholds.is_some());
}

#[test]
fn learner_disabled_enforces_from_boot() {
    let mut config = learning_config();
    config.adaptive_learning = false;
    let waf = Waf::new(config).unwrap();

    assert_eq!(waf.learner().phase(), LearningPhase::Protecting);
    assert!(waf.analyze(&xss_input()).is_block());
}

#[test]
fn learning_requests_counted_in_stats_and_metrics() {
    let waf = Waf::new(learning_config()).unwrap();
    waf.analyze(&xss_input());

    let stats = waf.stats();
    assert_eq!(stats.learning_requests, 1);
    assert_eq!(stats.blocked_requests, 0);

    let text = waf.metrics_text();
    assert!(text.contains("waf_learning_requests_total{phase=\"collecting\"} 1"));
    assert!(text.contains("waf_learning_progress"));
}

#[test]
fn phases_progress_with_request_time() {
    let waf = Waf::new(learning_config()).unwrap();
    let start = Utc::now();

    let at_fraction = |f: f64| {
        let offset = chrono::Duration::milliseconds((7.0 * 86_400_000.0 * f) as i64);
        xss_input().with_timestamp(start + offset)
    };

    waf.analyze(&at_fraction(0.1));
    assert_eq!(waf.learner().phase(), LearningPhase::Collecting);

    waf.analyze(&at_fraction(0.65));
    assert_eq!(waf.learner().phase(), LearningPhase::Analyzing);
    assert!(waf.learner().profile().is_some());

    waf.analyze(&at_fraction(0.85));
    assert_eq!(waf.learner().phase(), LearningPhase::Adapting);
    assert!(waf.learner().thresholds().is_some());

    waf.analyze(&at_fraction(1.01));
    assert_eq!(waf.learner().phase(), LearningPhase::Protecting);
}
