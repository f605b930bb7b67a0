//! Typed event stream for WAF observations.
//!
//! Decision outcomes are published to a broadcast channel so operator-facing
//! listeners (loggers, alert sinks, dashboards) can observe them without ever
//! blocking the request path. Sending is lock-free and best-effort; slow
//! subscribers lag and eventually drop events rather than backpressure the
//! pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::request::Threat;

/// Default capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Why a `ThreatDetected` event fired without a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatEventKind {
    /// Observed during a learning phase; enforcement is off.
    Learning,
    /// Would have blocked, but dry-run mode is on.
    DryRun,
    /// Scored below the block threshold.
    Detected,
}

impl std::fmt::Display for ThreatEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreatEventKind::Learning => write!(f, "learning"),
            ThreatEventKind::DryRun => write!(f, "dry-run"),
            ThreatEventKind::Detected => write!(f, "detected"),
        }
    }
}

/// Events emitted by the decision stage.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WafEvent {
    /// Threats matched but the request was allowed.
    ThreatDetected {
        /// Why the request was allowed anyway.
        kind: ThreatEventKind,
        /// Stable request id.
        request_id: String,
        /// Client IP.
        ip: String,
        /// Request path.
        path: String,
        /// Signature score.
        score: f64,
        /// Anomaly score.
        anomaly_score: f64,
        /// Matched threats.
        threats: Vec<Threat>,
        /// Request timestamp.
        timestamp: DateTime<Utc>,
    },
    /// The request was blocked.
    RequestBlocked {
        /// Stable request id.
        request_id: String,
        /// Client IP.
        ip: String,
        /// Request path.
        path: String,
        /// Signature score.
        score: f64,
        /// Anomaly score.
        anomaly_score: f64,
        /// Matched threats.
        threats: Vec<Threat>,
        /// Request timestamp.
        timestamp: DateTime<Utc>,
    },
    /// An internal error was swallowed by the fail-open boundary.
    Error {
        /// Pipeline stage that failed.
        stage: String,
        /// Error message.
        message: String,
    },
}

/// Broadcast hub for WAF events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WafEvent>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WafEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Never blocks; events are dropped when no subscriber
    /// is listening.
    pub fn emit(&self, event: WafEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blocked() -> WafEvent {
        WafEvent::RequestBlocked {
            request_id: "1-000001".to_string(),
            ip: "1.2.3.4".to_string(),
            path: "/api/search".to_string(),
            score: 7.0,
            anomaly_score: 0.0,
            threats: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        // Must not panic or block.
        bus.emit(sample_blocked());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_receives_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(sample_blocked());

        match rx.try_recv().unwrap() {
            WafEvent::RequestBlocked { ip, score, .. } => {
                assert_eq!(ip, "1.2.3.4");
                assert_eq!(score, 7.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_kind_serialization() {
        let event = WafEvent::ThreatDetected {
            kind: ThreatEventKind::DryRun,
            request_id: "1-000001".to_string(),
            ip: "1.2.3.4".to_string(),
            path: "/".to_string(),
            score: 12.0,
            anomaly_score: 1.5,
            threats: vec![],
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "threat-detected");
        assert_eq!(json["kind"], "dry-run");
    }
}
