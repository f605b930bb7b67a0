//! Anomaly scoring against a learned traffic baseline.
//!
//! The scorer compares each request to the distributions observed so far
//! (per-IP frequency, user agents, paths, query keys, body sizes, header
//! presence, time of day) and sums a set of bounded factors. Baseline maps
//! only grow while the learner is observing; once protection starts, the
//! per-IP rolling frequency window is the only state that keeps moving.

use chrono::{Datelike, Timelike, Weekday};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::request::AnalysisRecord;

/// Rolling frequency window length (5 minutes).
const FREQUENCY_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Query keys that suggest probing for something sensitive.
const SENSITIVE_QUERY_KEYS: &[&str] = &[
    "cmd", "exec", "eval", "system", "shell", "file", "path", "dir", "root", "admin", "password",
    "passwd", "pwd", "secret", "token", "key", "auth", "login",
];

/// One contribution to the anomaly score.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyFactor {
    /// Factor name, e.g. `frequency` or `user-agent`.
    pub name: &'static str,
    /// Score contributed.
    pub score: f64,
    /// Short human-readable detail.
    pub detail: String,
}

/// Result of anomaly scoring one request.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyResult {
    /// Sum of factor scores, rounded to two decimal places.
    pub total_score: f64,
    /// Contributing factors.
    pub factors: Vec<AnomalyFactor>,
    /// Whether the total exceeds the configured anomaly threshold.
    pub is_anomaly: bool,
    /// Mean factor score scaled to [0, 1].
    pub confidence: f64,
}

impl AnomalyResult {
    fn zero() -> Self {
        Self {
            total_score: 0.0,
            factors: Vec::new(),
            is_anomaly: false,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IpWindow {
    count: u64,
    window_start_ms: i64,
}

#[derive(Debug, Default)]
struct BodySizeStats {
    sum: u64,
    count: u64,
}

impl BodySizeStats {
    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// Learned distribution of normal traffic characteristics.
///
/// The per-IP window table is sharded (`DashMap`) because it is written on
/// every request from every connection; the distribution maps take a plain
/// lock since their critical sections are single lookups or inserts.
pub struct Baseline {
    ip_windows: DashMap<String, IpWindow>,
    user_agents: RwLock<FxHashMap<String, u64>>,
    paths: RwLock<FxHashMap<String, u64>>,
    query_params: RwLock<FxHashMap<String, u64>>,
    headers: RwLock<FxHashMap<String, u64>>,
    body_sizes: Mutex<BodySizeStats>,
    total_requests: std::sync::atomic::AtomicU64,
}

impl Baseline {
    fn new() -> Self {
        Self {
            ip_windows: DashMap::new(),
            user_agents: RwLock::new(FxHashMap::default()),
            paths: RwLock::new(FxHashMap::default()),
            query_params: RwLock::new(FxHashMap::default()),
            headers: RwLock::new(FxHashMap::default()),
            body_sizes: Mutex::new(BodySizeStats::default()),
            total_requests: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Total requests folded into the distribution maps.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Mean observed body size in bytes.
    pub fn mean_body_size(&self) -> f64 {
        self.body_sizes.lock().mean()
    }

    /// Number of distinct user agents observed.
    pub fn user_agent_count(&self) -> usize {
        self.user_agents.read().len()
    }

    /// Number of distinct paths observed.
    pub fn path_count(&self) -> usize {
        self.paths.read().len()
    }

    /// Advance the rolling window for an IP and return the in-window count.
    fn bump_ip(&self, ip: &str, now_ms: i64) -> u64 {
        let mut entry = self.ip_windows.entry(ip.to_string()).or_insert(IpWindow {
            count: 0,
            window_start_ms: now_ms,
        });
        if now_ms - entry.window_start_ms > FREQUENCY_WINDOW_MS {
            entry.count = 0;
            entry.window_start_ms = now_ms;
        }
        entry.count += 1;
        entry.count
    }

    /// Mean in-window request count across live IPs.
    fn mean_ip_frequency(&self, now_ms: i64) -> f64 {
        let mut sum = 0u64;
        let mut live = 0u64;
        for entry in self.ip_windows.iter() {
            if now_ms - entry.window_start_ms <= FREQUENCY_WINDOW_MS {
                sum += entry.count;
                live += 1;
            }
        }
        if live == 0 {
            0.0
        } else {
            sum as f64 / live as f64
        }
    }

    /// Drop expired IP windows. Called by the periodic sweeper.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let before = self.ip_windows.len();
        self.ip_windows
            .retain(|_, w| now_ms - w.window_start_ms <= FREQUENCY_WINDOW_MS);
        before - self.ip_windows.len()
    }
}

/// Anomaly scorer over a shared baseline.
pub struct AnomalyScorer {
    baseline: Baseline,
    threshold: f64,
    crawler: Regex,
    known_bots: Regex,
    suspicious_path: Regex,
    encoded_value: Regex,
}

impl AnomalyScorer {
    /// Create a scorer with the given anomaly threshold.
    pub fn new(threshold: f64) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|source| Error::PatternCompile {
                pattern: pattern.to_string(),
                source,
            })
        };
        Ok(Self {
            baseline: Baseline::new(),
            threshold,
            crawler: compile(
                r"(?i)bot|crawl|spider|scrape|curl|wget|python-requests|go-http-client|libwww",
            )?,
            known_bots: compile(
                r"(?i)googlebot|bingbot|slurp|duckduckbot|baiduspider|yandexbot|applebot",
            )?,
            suspicious_path: compile(
                r"(?i)\.\./|/admin\b|/wp-admin\b|\.env\b|\.git\b|[0-9a-f]{32,}|[A-Za-z0-9+/]{40,}={0,2}(?:/|$)|^(?:/[^/]+){7,}",
            )?,
            encoded_value: compile(
                r"(?i)%[0-9a-f]{2}|&#x?[0-9a-f]+;|^[A-Za-z0-9+/]{16,}={0,2}$",
            )?,
        })
    }

    /// Access the underlying baseline.
    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    /// Score a request against the baseline.
    ///
    /// The per-IP frequency window is advanced here on every call; it is the
    /// only cross-request state that also feeds the ongoing score. A
    /// configured threshold above 100 acts as a disable switch and yields a
    /// zero score.
    pub fn score(&self, record: &AnalysisRecord) -> AnomalyResult {
        if self.threshold > 100.0 {
            return AnomalyResult::zero();
        }

        let now_ms = record.timestamp.timestamp_millis();
        let ip_count = self.baseline.bump_ip(&record.ip, now_ms);

        let mut factors = Vec::new();
        self.frequency_factor(ip_count, now_ms, &mut factors);
        self.user_agent_factor(record, &mut factors);
        self.path_factor(record, &mut factors);
        self.query_factor(record, &mut factors);
        self.body_size_factor(record, &mut factors);
        self.header_factor(record, &mut factors);
        self.time_factor(record, &mut factors);

        let total: f64 = factors.iter().map(|f| f.score).sum();
        let total_score = round2(total);
        let confidence = if factors.is_empty() {
            0.0
        } else {
            let mean = total / factors.len() as f64;
            (mean * 0.1).clamp(0.0, 1.0)
        };

        AnomalyResult {
            total_score,
            factors,
            is_anomaly: total_score > self.threshold,
            confidence,
        }
    }

    /// Fold a request into the distribution maps. Skipped by the caller once
    /// the learning phase reaches Protecting.
    pub fn learn(&self, record: &AnalysisRecord) {
        if let Some(ua) = &record.user_agent {
            *self.baseline.user_agents.write().entry(ua.clone()).or_insert(0) += 1;
        }
        *self
            .baseline
            .paths
            .write()
            .entry(record.path.clone())
            .or_insert(0) += 1;
        {
            let mut params = self.baseline.query_params.write();
            for key in record.query.keys() {
                *params.entry(key.clone()).or_insert(0) += 1;
            }
        }
        {
            let mut headers = self.baseline.headers.write();
            for name in record.headers.keys() {
                *headers.entry(name.to_ascii_lowercase()).or_insert(0) += 1;
            }
        }
        {
            let mut body = self.baseline.body_sizes.lock();
            body.sum += record.body_size() as u64;
            body.count += 1;
        }
        self.baseline
            .total_requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn frequency_factor(&self, ip_count: u64, now_ms: i64, factors: &mut Vec<AnomalyFactor>) {
        let mean = self.baseline.mean_ip_frequency(now_ms);
        if mean > 0.0 && (ip_count as f64) > 2.0 * mean {
            let excess = ip_count as f64 - 2.0 * mean;
            factors.push(AnomalyFactor {
                name: "frequency",
                score: (excess * 0.5).min(10.0),
                detail: format!("{ip_count} requests in window, mean {mean:.1}"),
            });
        }
    }

    fn user_agent_factor(&self, record: &AnalysisRecord, factors: &mut Vec<AnomalyFactor>) {
        match &record.user_agent {
            None => factors.push(AnomalyFactor {
                name: "user-agent",
                score: 3.0,
                detail: "missing user agent".to_string(),
            }),
            Some(ua) if ua.len() < 10 => factors.push(AnomalyFactor {
                name: "user-agent",
                score: 3.0,
                detail: "implausibly short user agent".to_string(),
            }),
            Some(ua) => {
                if self.crawler.is_match(ua) && !self.known_bots.is_match(ua) {
                    factors.push(AnomalyFactor {
                        name: "user-agent",
                        score: 2.0,
                        detail: "unrecognized crawler".to_string(),
                    });
                }
                if ua.len() > 500 {
                    factors.push(AnomalyFactor {
                        name: "user-agent",
                        score: 4.0,
                        detail: "oversized user agent".to_string(),
                    });
                }
                let (count, total) = {
                    let map = self.baseline.user_agents.read();
                    (
                        map.get(ua).copied().unwrap_or(0),
                        self.baseline.total_requests(),
                    )
                };
                if total > 0 && (count as f64 / total as f64) < 0.01 {
                    factors.push(AnomalyFactor {
                        name: "user-agent",
                        score: 1.0,
                        detail: "rare user agent".to_string(),
                    });
                }
            }
        }
    }

    fn path_factor(&self, record: &AnalysisRecord, factors: &mut Vec<AnomalyFactor>) {
        if self.suspicious_path.is_match(&record.path) {
            factors.push(AnomalyFactor {
                name: "path",
                score: 2.0,
                detail: "suspicious path pattern".to_string(),
            });
        }
        if record.path.len() > 200 {
            factors.push(AnomalyFactor {
                name: "path",
                score: 1.0,
                detail: "oversized path".to_string(),
            });
        }
        let (count, total) = {
            let map = self.baseline.paths.read();
            (
                map.get(&record.path).copied().unwrap_or(0),
                self.baseline.total_requests(),
            )
        };
        if total > 0 && (count as f64 / total as f64) < 0.005 {
            factors.push(AnomalyFactor {
                name: "path",
                score: 1.0,
                detail: "rare path".to_string(),
            });
        }
    }

    fn query_factor(&self, record: &AnalysisRecord, factors: &mut Vec<AnomalyFactor>) {
        let mut sensitive = 0.0f64;
        let mut oversized = false;
        let mut encoded = false;

        for (key, value) in &record.query {
            if SENSITIVE_QUERY_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                sensitive += 2.0;
            }
            for v in value.values() {
                if v.len() > 1000 {
                    oversized = true;
                }
                if self.encoded_value.is_match(v) {
                    encoded = true;
                }
            }
        }

        if sensitive > 0.0 {
            factors.push(AnomalyFactor {
                name: "query",
                score: sensitive.min(5.0),
                detail: "sensitive parameter name".to_string(),
            });
        }
        if oversized {
            factors.push(AnomalyFactor {
                name: "query",
                score: 1.0,
                detail: "oversized parameter value".to_string(),
            });
        }
        if encoded {
            factors.push(AnomalyFactor {
                name: "query",
                score: 1.0,
                detail: "encoded parameter value".to_string(),
            });
        }
    }

    fn body_size_factor(&self, record: &AnalysisRecord, factors: &mut Vec<AnomalyFactor>) {
        let mean = self.baseline.mean_body_size();
        let size = record.body_size() as f64;
        if mean > 0.0 && size > 3.0 * mean {
            let excess = size - 3.0 * mean;
            factors.push(AnomalyFactor {
                name: "body-size",
                score: (excess / 1000.0).min(5.0),
                detail: format!("{size:.0} bytes against mean {mean:.0}"),
            });
        }
    }

    fn header_factor(&self, record: &AnalysisRecord, factors: &mut Vec<AnomalyFactor>) {
        let mut score = 0.0f64;
        let mut details = Vec::new();

        let missing = ["user-agent", "accept", "accept-language"]
            .iter()
            .filter(|name| record.header(name).is_none())
            .count();
        if missing > 1 {
            score += 2.0;
            details.push("missing common headers");
        }

        let mut oversized = false;
        let mut long_encoded = false;
        for values in record.headers.values() {
            for v in values {
                if v.len() > 500 {
                    oversized = true;
                }
                if v.len() > 100 && self.encoded_value.is_match(v) {
                    long_encoded = true;
                }
            }
        }
        if oversized {
            score += 1.0;
            details.push("oversized header value");
        }
        if long_encoded {
            score += 1.0;
            details.push("long encoded header value");
        }

        if score > 0.0 {
            factors.push(AnomalyFactor {
                name: "headers",
                score: score.min(3.0),
                detail: details.join(", "),
            });
        }
    }

    fn time_factor(&self, record: &AnalysisRecord, factors: &mut Vec<AnomalyFactor>) {
        let hour = record.timestamp.hour();
        if (2..=6).contains(&hour) {
            factors.push(AnomalyFactor {
                name: "time",
                score: 1.0,
                detail: "off-hours request".to_string(),
            });
        }
        let weekday = record.timestamp.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            factors.push(AnomalyFactor {
                name: "time",
                score: 0.5,
                detail: "weekend request".to_string(),
            });
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
