//! Request extraction and the per-request analysis record.
//!
//! The framework adapter hands the core an already-parsed [`RequestInput`];
//! the extractor normalizes it into an [`AnalysisRecord`] that the detection
//! modules, rule engine, and anomaly scorer mutate as the request flows
//! through the pipeline. The input itself is never modified.

use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a matched-text excerpt stored in a threat.
pub const EXCERPT_MAX: usize = 100;

/// Request body as supplied by the framework adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    /// No body present.
    #[default]
    None,
    /// Raw text body.
    Text(String),
    /// Structured (already parsed) body, e.g. JSON.
    Structured(serde_json::Value),
}

impl Body {
    /// Body rendered as a scannable string, if any.
    pub fn as_scan_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Body::None => None,
            Body::Text(s) => Some(Cow::Borrowed(s)),
            Body::Structured(v) => Some(Cow::Owned(v.to_string())),
        }
    }

    /// Approximate body size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Body::None => 0,
            Body::Text(s) => s.len(),
            Body::Structured(v) => v.to_string().len(),
        }
    }
}

/// A query parameter value: single string or repeated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    /// `?key=value`
    Single(String),
    /// `?key=a&key=b`
    Multi(Vec<String>),
}

impl QueryValue {
    /// Iterate the string values.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        match self {
            QueryValue::Single(s) => std::slice::from_ref(s).iter(),
            QueryValue::Multi(v) => v.iter(),
        }
        .map(|s| s.as_str())
    }
}

/// Abstract request shape consumed from the HTTP framework adapter.
#[derive(Debug, Clone)]
pub struct RequestInput {
    /// HTTP method.
    pub method: String,
    /// URL path, without query string.
    pub path: String,
    /// Direct peer address, if known.
    pub remote_addr: Option<String>,
    /// Header multimap.
    pub headers: HashMap<String, Vec<String>>,
    /// Cookie map.
    pub cookies: HashMap<String, String>,
    /// Query parameter map.
    pub query: HashMap<String, QueryValue>,
    /// Parsed body, if any.
    pub body: Body,
    /// Request arrival time.
    pub timestamp: DateTime<Utc>,
}

impl RequestInput {
    /// Create a minimal input for the given method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            remote_addr: None,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            query: HashMap::new(),
            body: Body::None,
            timestamp: Utc::now(),
        }
    }

    /// Set the peer address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Add a header value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Add a cookie.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Add a single-valued query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query
            .insert(key.into(), QueryValue::Single(value.into()));
        self
    }

    /// Set a text body.
    pub fn with_text_body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Text(body.into());
        self
    }

    /// Set a structured body.
    pub fn with_json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Body::Structured(body);
        self
    }

    /// Set the request timestamp.
    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(|s| s.as_str())
    }
}

/// A matched threat, embedded in the analysis record and event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    /// Threat type (`xss`, `sqli`, `rate-limit`, rule category, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Id of the pattern or rule that matched.
    pub pattern: String,
    /// Human-readable description.
    pub description: String,
    /// Score contributed by this threat.
    pub score: f64,
    /// Excerpt of the matched text, truncated to 100 characters.
    pub matched: String,
}

impl Threat {
    /// Create a threat, truncating the matched excerpt.
    pub fn new(
        kind: impl Into<String>,
        pattern: impl Into<String>,
        description: impl Into<String>,
        score: f64,
        matched: &str,
    ) -> Self {
        Self {
            kind: kind.into(),
            pattern: pattern.into(),
            description: description.into(),
            score,
            matched: truncate_excerpt(matched),
        }
    }
}

/// Truncate a matched value for storage in a threat.
pub fn truncate_excerpt(value: &str) -> String {
    if value.len() <= EXCERPT_MAX {
        value.to_string()
    } else {
        let mut end = EXCERPT_MAX;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value[..end].to_string()
    }
}

/// Per-request analysis state flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    /// Request arrival time.
    pub timestamp: DateTime<Utc>,
    /// Resolved client IP (or `"unknown"`).
    pub ip: String,
    /// User-Agent header, if present.
    pub user_agent: Option<String>,
    /// HTTP method.
    pub method: String,
    /// URL path.
    pub path: String,
    /// Query parameters.
    pub query: HashMap<String, QueryValue>,
    /// Request body.
    pub body: Body,
    /// Header multimap.
    pub headers: HashMap<String, Vec<String>>,
    /// Cookies.
    pub cookies: HashMap<String, String>,
    /// Running cumulative score; only ever increases during analysis.
    pub score: f64,
    /// Threats matched so far.
    pub threats: Vec<Threat>,
    /// Names of modules that ran on this record.
    pub modules_touched: Vec<String>,
}

impl AnalysisRecord {
    /// Build an analysis record from a framework request.
    ///
    /// Client IP resolution order: direct peer address, then the first token
    /// of `X-Forwarded-For` (trimmed), then the literal `"unknown"`.
    pub fn from_input(input: &RequestInput) -> Self {
        let ip = input
            .remote_addr
            .clone()
            .or_else(|| {
                input
                    .header("x-forwarded-for")
                    .and_then(|v| v.split(',').next())
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let user_agent = input.header("user-agent").map(|s| s.to_string());

        Self {
            timestamp: input.timestamp,
            ip,
            user_agent,
            method: input.method.clone(),
            path: input.path.clone(),
            query: input.query.clone(),
            body: input.body.clone(),
            headers: input.headers.clone(),
            cookies: input.cookies.clone(),
            score: 0.0,
            threats: Vec::new(),
            modules_touched: Vec::new(),
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(|s| s.as_str())
    }

    /// Record a threat and add its score to the running total.
    pub fn add_threat(&mut self, threat: Threat) {
        self.score += threat.score;
        self.threats.push(threat);
    }

    /// Mark a module as having analyzed this record.
    pub fn touch_module(&mut self, name: &str) {
        if !self.modules_touched.iter().any(|m| m == name) {
            self.modules_touched.push(name.to_string());
        }
    }

    /// Body size in bytes.
    pub fn body_size(&self) -> usize {
        self.body.size()
    }

    /// The full search surface for signature scanning: path, each query
    /// value, the body, each header value, each cookie value.
    pub fn scan_targets(&self) -> Vec<(String, Cow<'_, str>)> {
        let mut targets = Vec::new();
        targets.push(("path".to_string(), Cow::Borrowed(self.path.as_str())));

        for (key, value) in &self.query {
            for v in value.values() {
                targets.push((format!("query:{key}"), Cow::Borrowed(v)));
            }
        }

        if let Some(body) = self.body.as_scan_text() {
            targets.push(("body".to_string(), body));
        }

        for (name, values) in &self.headers {
            for v in values {
                targets.push((format!("header:{name}"), Cow::Borrowed(v.as_str())));
            }
        }

        for (name, value) in &self.cookies {
            targets.push((format!("cookie:{name}"), Cow::Borrowed(value.as_str())));
        }

        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_from_peer_address() {
        let input = RequestInput::new("GET", "/").with_remote_addr("10.0.0.1");
        let record = AnalysisRecord::from_input(&input);
        assert_eq!(record.ip, "10.0.0.1");
    }

    #[test]
    fn test_ip_from_forwarded_for() {
        let input =
            RequestInput::new("GET", "/").with_header("X-Forwarded-For", " 1.2.3.4 , 10.0.0.1");
        let record = AnalysisRecord::from_input(&input);
        assert_eq!(record.ip, "1.2.3.4");
    }

    #[test]
    fn test_ip_unknown() {
        let input = RequestInput::new("GET", "/");
        let record = AnalysisRecord::from_input(&input);
        assert_eq!(record.ip, "unknown");
    }

    #[test]
    fn test_peer_address_wins_over_forwarded() {
        let input = RequestInput::new("GET", "/")
            .with_remote_addr("10.0.0.1")
            .with_header("X-Forwarded-For", "1.2.3.4");
        let record = AnalysisRecord::from_input(&input);
        assert_eq!(record.ip, "10.0.0.1");
    }

    #[test]
    fn test_header_case_insensitive() {
        let input = RequestInput::new("GET", "/").with_header("User-Agent", "Mozilla/5.0");
        let record = AnalysisRecord::from_input(&input);
        assert_eq!(record.header("user-agent"), Some("Mozilla/5.0"));
        assert_eq!(record.user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[test]
    fn test_scan_targets_cover_surface() {
        let input = RequestInput::new("GET", "/api/search")
            .with_query("q", "hello")
            .with_header("Accept", "text/html")
            .with_cookie("session", "abc123")
            .with_text_body("payload");
        let record = AnalysisRecord::from_input(&input);
        let targets = record.scan_targets();

        let locations: Vec<&str> = targets.iter().map(|(l, _)| l.as_str()).collect();
        assert!(locations.contains(&"path"));
        assert!(locations.contains(&"query:q"));
        assert!(locations.contains(&"body"));
        assert!(locations.contains(&"header:Accept"));
        assert!(locations.contains(&"cookie:session"));
    }

    #[test]
    fn test_structured_body_serialized_for_scan() {
        let input = RequestInput::new("POST", "/api/test")
            .with_json_body(serde_json::json!({"query": "DROP TABLE users"}));
        let record = AnalysisRecord::from_input(&input);
        let targets = record.scan_targets();
        let body = targets
            .iter()
            .find(|(l, _)| l == "body")
            .map(|(_, t)| t.as_ref())
            .unwrap();
        assert!(body.contains("DROP TABLE users"));
    }

    #[test]
    fn test_score_monotonic() {
        let input = RequestInput::new("GET", "/");
        let mut record = AnalysisRecord::from_input(&input);
        record.add_threat(Threat::new("xss", "script-tag", "Script tag injection", 3.0, "<script>"));
        record.add_threat(Threat::new("sqli", "comment-dash", "SQL comment", 2.0, "--"));
        assert_eq!(record.score, 5.0);
        assert_eq!(record.threats.len(), 2);
    }

    #[test]
    fn test_excerpt_truncation() {
        let long = "x".repeat(300);
        let threat = Threat::new("xss", "p", "d", 1.0, &long);
        assert_eq!(threat.matched.len(), EXCERPT_MAX);
    }

    #[test]
    fn test_input_not_mutated() {
        let input = RequestInput::new("GET", "/").with_query("a", "1");
        let before = input.query.len();
        let mut record = AnalysisRecord::from_input(&input);
        record.touch_module("xss");
        record.add_threat(Threat::new("xss", "p", "d", 1.0, "m"));
        assert_eq!(input.query.len(), before);
        assert!(input.headers.is_empty());
    }
}
