//! Metrics registry.
//!
//! Labeled counter, gauge, histogram, and summary families with text
//! exposition in the standard format (`# HELP`, `# TYPE`, one sample per
//! line). Counter and gauge updates are O(1) map operations; histogram
//! observation finds its bucket by binary search. Families are registered at
//! boot; updating an unregistered family or passing the wrong number of
//! label values logs a warning and drops the observation rather than
//! disturbing the request path.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::warn;

/// Summary quantiles reported per family.
const SUMMARY_QUANTILES: &[f64] = &[0.5, 0.9, 0.95, 0.99];

/// Cap on buffered summary observations per label set.
const SUMMARY_WINDOW: usize = 10_000;

/// Metric family kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricKind {
    fn type_name(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone)]
struct HistogramSample {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

#[derive(Debug, Clone)]
struct SummarySample {
    values: Vec<f64>,
    sum: f64,
    count: u64,
}

#[derive(Debug, Clone)]
enum Sample {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramSample),
    Summary(SummarySample),
}

struct MetricFamily {
    kind: MetricKind,
    help: String,
    label_names: Vec<String>,
    /// Upper bounds, ascending; the implicit +Inf bucket is appended.
    buckets: Vec<f64>,
    samples: FxHashMap<Vec<String>, Sample>,
}

/// Registry of metric families.
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, MetricFamily>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            families: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a counter family.
    pub fn register_counter(&self, name: &str, help: &str, labels: &[&str]) {
        self.register(name, help, labels, MetricKind::Counter, Vec::new());
    }

    /// Register a gauge family.
    pub fn register_gauge(&self, name: &str, help: &str, labels: &[&str]) {
        self.register(name, help, labels, MetricKind::Gauge, Vec::new());
    }

    /// Register a histogram family with the given bucket upper bounds.
    pub fn register_histogram(&self, name: &str, help: &str, labels: &[&str], buckets: &[f64]) {
        let mut bounds = buckets.to_vec();
        bounds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.register(name, help, labels, MetricKind::Histogram, bounds);
    }

    /// Register a summary family.
    pub fn register_summary(&self, name: &str, help: &str, labels: &[&str]) {
        self.register(name, help, labels, MetricKind::Summary, Vec::new());
    }

    fn register(&self, name: &str, help: &str, labels: &[&str], kind: MetricKind, buckets: Vec<f64>) {
        let mut families = self.families.write();
        families.insert(
            name.to_string(),
            MetricFamily {
                kind,
                help: help.to_string(),
                label_names: labels.iter().map(|l| l.to_string()).collect(),
                buckets,
                samples: FxHashMap::default(),
            },
        );
    }

    /// Increment a counter by one.
    pub fn inc_counter(&self, name: &str, label_values: &[&str]) {
        self.add_counter(name, label_values, 1.0);
    }

    /// Add to a counter. Negative deltas are rejected; counters are
    /// monotonic.
    pub fn add_counter(&self, name: &str, label_values: &[&str], delta: f64) {
        if delta < 0.0 {
            warn!(metric = name, delta = delta, "negative counter delta dropped");
            return;
        }
        self.with_sample(name, label_values, MetricKind::Counter, |sample| {
            if let Sample::Counter(v) = sample {
                *v += delta;
            }
        });
    }

    /// Set a gauge.
    pub fn set_gauge(&self, name: &str, label_values: &[&str], value: f64) {
        self.with_sample(name, label_values, MetricKind::Gauge, |sample| {
            if let Sample::Gauge(v) = sample {
                *v = value;
            }
        });
    }

    /// Observe a histogram value. Bucket assignment is a binary search over
    /// the family's bounds; values past the last bound land only in +Inf.
    pub fn observe_histogram(&self, name: &str, label_values: &[&str], value: f64) {
        let mut families = self.families.write();
        let Some(family) = families.get_mut(name) else {
            warn!(metric = name, "update to unregistered metric dropped");
            return;
        };
        if family.kind != MetricKind::Histogram {
            warn!(metric = name, "metric kind mismatch, update dropped");
            return;
        }
        if family.label_names.len() != label_values.len() {
            warn!(metric = name, "label cardinality mismatch, update dropped");
            return;
        }

        let bucket_len = family.buckets.len();
        let idx = family.buckets.partition_point(|b| *b < value);
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        let sample = family.samples.entry(key).or_insert_with(|| {
            Sample::Histogram(HistogramSample {
                bucket_counts: vec![0; bucket_len],
                sum: 0.0,
                count: 0,
            })
        });
        if let Sample::Histogram(h) = sample {
            h.sum += value;
            h.count += 1;
            if idx < h.bucket_counts.len() {
                h.bucket_counts[idx] += 1;
            }
        }
    }

    /// Observe a summary value.
    pub fn observe_summary(&self, name: &str, label_values: &[&str], value: f64) {
        self.with_sample(name, label_values, MetricKind::Summary, |sample| {
            if let Sample::Summary(s) = sample {
                s.sum += value;
                s.count += 1;
                if s.values.len() >= SUMMARY_WINDOW {
                    s.values.remove(0);
                }
                s.values.push(value);
            }
        });
    }

    fn with_sample<F: FnOnce(&mut Sample)>(
        &self,
        name: &str,
        label_values: &[&str],
        expected: MetricKind,
        apply: F,
    ) {
        let mut families = self.families.write();
        let Some(family) = families.get_mut(name) else {
            warn!(metric = name, "update to unregistered metric dropped");
            return;
        };
        if family.kind != expected {
            warn!(metric = name, "metric kind mismatch, update dropped");
            return;
        }
        if family.label_names.len() != label_values.len() {
            warn!(
                metric = name,
                expected = family.label_names.len(),
                got = label_values.len(),
                "label cardinality mismatch, update dropped"
            );
            return;
        }

        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        let bucket_len = family.buckets.len();
        let sample = family.samples.entry(key).or_insert_with(|| match expected {
            MetricKind::Counter => Sample::Counter(0.0),
            MetricKind::Gauge => Sample::Gauge(0.0),
            MetricKind::Histogram => Sample::Histogram(HistogramSample {
                bucket_counts: vec![0; bucket_len],
                sum: 0.0,
                count: 0,
            }),
            MetricKind::Summary => Sample::Summary(SummarySample {
                values: Vec::new(),
                sum: 0.0,
                count: 0,
            }),
        });
        apply(sample);
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> String {
        let families = self.families.read();
        let mut out = String::new();

        for (name, family) in families.iter() {
            out.push_str(&format!("# HELP {name} {}\n", family.help));
            out.push_str(&format!("# TYPE {name} {}\n", family.kind.type_name()));

            let mut keys: Vec<&Vec<String>> = family.samples.keys().collect();
            keys.sort();

            for key in keys {
                let sample = &family.samples[key];
                match sample {
                    Sample::Counter(v) | Sample::Gauge(v) => {
                        out.push_str(&format!(
                            "{name}{} {}\n",
                            label_set(&family.label_names, key, &[]),
                            format_value(*v)
                        ));
                    }
                    Sample::Histogram(h) => {
                        let mut cumulative = 0u64;
                        for (i, bound) in family.buckets.iter().enumerate() {
                            cumulative += h.bucket_counts[i];
                            out.push_str(&format!(
                                "{name}_bucket{} {cumulative}\n",
                                label_set(
                                    &family.label_names,
                                    key,
                                    &[("le", &format_value(*bound))]
                                ),
                            ));
                        }
                        out.push_str(&format!(
                            "{name}_bucket{} {}\n",
                            label_set(&family.label_names, key, &[("le", "+Inf")]),
                            h.count
                        ));
                        out.push_str(&format!(
                            "{name}_sum{} {}\n",
                            label_set(&family.label_names, key, &[]),
                            format_value(h.sum)
                        ));
                        out.push_str(&format!(
                            "{name}_count{} {}\n",
                            label_set(&family.label_names, key, &[]),
                            h.count
                        ));
                    }
                    Sample::Summary(s) => {
                        let mut sorted = s.values.clone();
                        sorted.sort_by(|a, b| {
                            a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                        });
                        for q in SUMMARY_QUANTILES {
                            let value = quantile(&sorted, *q);
                            out.push_str(&format!(
                                "{name}{} {}\n",
                                label_set(
                                    &family.label_names,
                                    key,
                                    &[("quantile", &format_value(*q))]
                                ),
                                format_value(value)
                            ));
                        }
                        out.push_str(&format!(
                            "{name}_sum{} {}\n",
                            label_set(&family.label_names, key, &[]),
                            format_value(s.sum)
                        ));
                        out.push_str(&format!(
                            "{name}_count{} {}\n",
                            label_set(&family.label_names, key, &[]),
                            s.count
                        ));
                    }
                }
            }
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn format_value(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn label_set(names: &[String], values: &[String], extra: &[(&str, &str)]) -> String {
    if names.is_empty() && extra.is_empty() {
        return String::new();
    }
    let mut parts: Vec<String> = names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{n}=\"{}\"", escape_label(v)))
        .collect();
    for (n, v) in extra {
        parts.push(format!("{n}=\"{}\"", escape_label(v)));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
