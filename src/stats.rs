//! Stats collection.
//!
//! Monotonic counters plus bounded hourly/daily buckets and per-module,
//! per-threat-type, and per-IP breakdowns. Counters are atomics; map updates
//! take a short write lock. Buckets are keyed by ISO hour and day floors and
//! pruned to the configured retention.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::request::AnalysisRecord;

/// Cap on distinct IPs tracked before pruning low-count entries.
const PER_IP_CAP: usize = 10_000;

/// How a recorded threat was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatAction {
    /// Observed during a learning phase.
    Learning,
    /// Would have blocked, dry-run allowed it.
    DryRun,
    /// Request was blocked.
    Blocked,
    /// Below threshold, request allowed.
    Detected,
}

/// Per-module counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModuleStats {
    pub requests: u64,
    pub threats: u64,
    pub blocked: u64,
}

/// Per-bucket counters (one ISO hour or day).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BucketStats {
    pub requests: u64,
    pub threats: u64,
    pub blocked: u64,
}

/// Point-in-time view with derived rates and top-N breakdowns.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub total_threats: u64,
    pub learning_requests: u64,
    pub uptime_secs: u64,
    pub block_rate: f64,
    pub threats_per_minute: f64,
    pub per_module: HashMap<String, ModuleStats>,
    pub top_threat_types: Vec<(String, u64)>,
    pub top_ips: Vec<(String, u64)>,
    pub hourly: BTreeMap<String, BucketStats>,
    pub daily: BTreeMap<String, BucketStats>,
}

/// Thread-safe stats collector.
pub struct StatsCollector {
    enabled: bool,
    retention_days: u32,
    started_at: DateTime<Utc>,
    total: AtomicU64,
    blocked: AtomicU64,
    threats: AtomicU64,
    learning: AtomicU64,
    per_module: RwLock<HashMap<String, ModuleStats>>,
    per_type: RwLock<HashMap<String, u64>>,
    per_ip: RwLock<HashMap<String, u64>>,
    hourly: RwLock<BTreeMap<String, BucketStats>>,
    daily: RwLock<BTreeMap<String, BucketStats>>,
}

impl StatsCollector {
    /// Create a collector.
    pub fn new(enabled: bool, retention_days: u32) -> Self {
        Self {
            enabled,
            retention_days: retention_days.max(1),
            started_at: Utc::now(),
            total: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            threats: AtomicU64::new(0),
            learning: AtomicU64::new(0),
            per_module: RwLock::new(HashMap::new()),
            per_type: RwLock::new(HashMap::new()),
            per_ip: RwLock::new(HashMap::new()),
            hourly: RwLock::new(BTreeMap::new()),
            daily: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record one analyzed request.
    pub fn record_request(&self, record: &AnalysisRecord) {
        if !self.enabled {
            return;
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        {
            let mut per_module = self.per_module.write();
            for module in &record.modules_touched {
                per_module.entry(module.clone()).or_default().requests += 1;
            }
        }

        let (hour_key, day_key) = bucket_keys(&record.timestamp);
        self.hourly.write().entry(hour_key).or_default().requests += 1;
        self.daily.write().entry(day_key).or_default().requests += 1;
    }

    /// Record the threats attached to an analyzed request and how they were
    /// handled.
    pub fn record_threat(&self, record: &AnalysisRecord, action: ThreatAction) {
        if !self.enabled || record.threats.is_empty() {
            return;
        }

        let count = record.threats.len() as u64;
        self.threats.fetch_add(count, Ordering::Relaxed);
        match action {
            ThreatAction::Blocked => {
                self.blocked.fetch_add(1, Ordering::Relaxed);
            }
            ThreatAction::Learning => {
                self.learning.fetch_add(1, Ordering::Relaxed);
            }
            ThreatAction::DryRun | ThreatAction::Detected => {}
        }

        {
            let mut per_type = self.per_type.write();
            for threat in &record.threats {
                *per_type.entry(threat.kind.clone()).or_insert(0) += 1;
            }
        }
        {
            let mut per_ip = self.per_ip.write();
            *per_ip.entry(record.ip.clone()).or_insert(0) += 1;
        }
        {
            let mut per_module = self.per_module.write();
            for module in &record.modules_touched {
                let entry = per_module.entry(module.clone()).or_default();
                entry.threats += count;
                if action == ThreatAction::Blocked {
                    entry.blocked += 1;
                }
            }
        }

        let (hour_key, day_key) = bucket_keys(&record.timestamp);
        {
            let mut hourly = self.hourly.write();
            let bucket = hourly.entry(hour_key).or_default();
            bucket.threats += count;
            if action == ThreatAction::Blocked {
                bucket.blocked += 1;
            }
        }
        {
            let mut daily = self.daily.write();
            let bucket = daily.entry(day_key).or_default();
            bucket.threats += count;
            if action == ThreatAction::Blocked {
                bucket.blocked += 1;
            }
        }
    }

    /// Snapshot with derived rates and top-N views.
    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let blocked = self.blocked.load(Ordering::Relaxed);
        let threats = self.threats.load(Ordering::Relaxed);
        let uptime_secs = (Utc::now() - self.started_at).num_seconds().max(0) as u64;
        let minutes = (uptime_secs as f64 / 60.0).max(1.0 / 60.0);

        StatsSnapshot {
            total_requests: total,
            blocked_requests: blocked,
            total_threats: threats,
            learning_requests: self.learning.load(Ordering::Relaxed),
            uptime_secs,
            block_rate: if total == 0 {
                0.0
            } else {
                blocked as f64 / total as f64
            },
            threats_per_minute: threats as f64 / minutes,
            per_module: self.per_module.read().clone(),
            top_threat_types: top_n(&self.per_type.read(), 10),
            top_ips: top_n(&self.per_ip.read(), 10),
            hourly: self.hourly.read().clone(),
            daily: self.daily.read().clone(),
        }
    }

    /// Drop buckets older than the retention window and cap the per-IP map.
    pub fn prune(&self, now: DateTime<Utc>) {
        let horizon = now - chrono::Duration::days(self.retention_days as i64);
        let (hour_floor, day_floor) = bucket_keys(&horizon);

        self.hourly.write().retain(|k, _| *k >= hour_floor);
        self.daily.write().retain(|k, _| *k >= day_floor);

        let mut per_ip = self.per_ip.write();
        if per_ip.len() > PER_IP_CAP {
            let mut entries: Vec<(String, u64)> =
                per_ip.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            entries.truncate(PER_IP_CAP / 2);
            *per_ip = entries.into_iter().collect();
        }
    }

    /// Reset every counter and map. Admin-triggered only.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
        self.threats.store(0, Ordering::Relaxed);
        self.learning.store(0, Ordering::Relaxed);
        self.per_module.write().clear();
        self.per_type.write().clear();
        self.per_ip.write().clear();
        self.hourly.write().clear();
        self.daily.write().clear();
    }
}

fn bucket_keys(ts: &DateTime<Utc>) -> (String, String) {
    (
        ts.format("%Y-%m-%dT%H").to_string(),
        ts.format("%Y-%m-%d").to_string(),
    )
}

fn top_n(map: &HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}
