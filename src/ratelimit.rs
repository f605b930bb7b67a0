//! Per-IP rate limiting and IP blocking.
//!
//! A fixed window counter per IP plus a block table with TTL. Both tables
//! are sharded maps keyed by IP, swept periodically; an IP is never present
//! in both at once: blocking an IP removes its rate window, and an expired
//! block is cleared on the next access.

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{IpBlockingConfig, RateLimitConfig};
use crate::request::Threat;

/// Score attached to a rate-limit threat.
pub const RATE_LIMIT_SCORE: f64 = 5.0;
/// Score attached to a blocked-IP threat.
pub const IP_BLOCKED_SCORE: f64 = 10.0;

/// Per-IP window state.
#[derive(Debug, Clone, Copy)]
struct IpRateState {
    count: u64,
    first_request_ms: i64,
    violations: u32,
}

/// A blocked IP entry.
#[derive(Debug, Clone, Serialize)]
pub struct IpBlock {
    /// Blocked IP.
    pub ip: String,
    /// Unix millis until which the block holds.
    pub blocked_until_ms: i64,
    /// Why the IP was blocked.
    pub reason: String,
    /// Unix millis when the block was installed.
    pub blocked_at_ms: i64,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone)]
pub enum RateLimitOutcome {
    /// Within limits.
    Allowed,
    /// Over the window maximum; carries a `rate-limit-exceeded` threat.
    Limited(Threat),
    /// IP is in the block table; carries an `ip-blocked` threat.
    Blocked(Threat),
}

/// Stateful per-IP rate limiter and block list.
pub struct RateLimiter {
    config: RateLimitConfig,
    blocking: IpBlockingConfig,
    states: DashMap<String, IpRateState>,
    blocks: DashMap<String, IpBlock>,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    pub fn new(config: RateLimitConfig, blocking: IpBlockingConfig) -> Self {
        Self {
            config,
            blocking,
            states: DashMap::new(),
            blocks: DashMap::new(),
        }
    }

    /// Check whether an IP is currently blocked, clearing an expired entry.
    pub fn is_blocked_at(&self, ip: &str, now_ms: i64) -> bool {
        // The read guard must be dropped before removing from the same shard.
        let expired = match self.blocks.get(ip) {
            Some(block) => {
                if block.blocked_until_ms > now_ms {
                    return true;
                }
                true
            }
            None => false,
        };
        if expired {
            self.blocks.remove(ip);
        }
        false
    }

    /// The `ip-blocked` threat for a blocked IP, or `None`.
    pub fn blocked_threat_at(&self, ip: &str, now_ms: i64) -> Option<Threat> {
        if self.is_blocked_at(ip, now_ms) {
            Some(Threat::new(
                "ip-blocked",
                "ip-blocked",
                "Request from blocked IP",
                IP_BLOCKED_SCORE,
                ip,
            ))
        } else {
            None
        }
    }

    /// Count a request against the IP's window and report the outcome.
    ///
    /// Every call increments the window counter. Exceeding the window
    /// maximum increments the violation count; once violations reach the
    /// configured limit and blocking is enabled, the IP moves to the block
    /// table and its window state is dropped.
    pub fn check_at(&self, ip: &str, now_ms: i64) -> RateLimitOutcome {
        if let Some(threat) = self.blocked_threat_at(ip, now_ms) {
            return RateLimitOutcome::Blocked(threat);
        }
        if !self.config.enabled {
            return RateLimitOutcome::Allowed;
        }

        let window_ms = self.config.window_ms as i64;
        let (count, violations) = {
            let mut state = self.states.entry(ip.to_string()).or_insert(IpRateState {
                count: 0,
                first_request_ms: now_ms,
                violations: 0,
            });
            if now_ms - state.first_request_ms > window_ms {
                state.count = 0;
                state.first_request_ms = now_ms;
            }
            state.count += 1;
            if state.count > self.config.max {
                state.violations += 1;
            }
            (state.count, state.violations)
        };

        if count <= self.config.max {
            return RateLimitOutcome::Allowed;
        }

        if self.blocking.enabled && violations >= self.blocking.max_violations {
            self.block_at(
                ip,
                format!("{violations} rate limit violations"),
                now_ms,
            );
        }

        warn!(
            ip = ip,
            count = count,
            max = self.config.max,
            violations = violations,
            "rate limit exceeded"
        );
        RateLimitOutcome::Limited(Threat::new(
            "rate-limit",
            "rate-limit-exceeded",
            "Rate limit exceeded",
            RATE_LIMIT_SCORE,
            ip,
        ))
    }

    /// Install a block for an IP and drop its window state.
    pub fn block_at(&self, ip: &str, reason: String, now_ms: i64) {
        let until = now_ms + self.blocking.block_duration_ms as i64;
        info!(ip = ip, reason = %reason, until_ms = until, "blocking IP");
        self.blocks.insert(
            ip.to_string(),
            IpBlock {
                ip: ip.to_string(),
                blocked_until_ms: until,
                reason,
                blocked_at_ms: now_ms,
            },
        );
        self.states.remove(ip);
    }

    /// Remove a block manually.
    pub fn unblock(&self, ip: &str) -> bool {
        self.blocks.remove(ip).is_some()
    }

    /// Currently blocked IPs.
    pub fn blocked_ips(&self) -> Vec<IpBlock> {
        self.blocks.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of entries in the block table.
    pub fn blocked_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of tracked rate windows.
    pub fn tracked_ips(&self) -> usize {
        self.states.len()
    }

    /// Evict expired windows and expired blocks. Returns
    /// `(windows_evicted, blocks_evicted)`.
    pub fn sweep(&self, now_ms: i64) -> (usize, usize) {
        let window_ms = self.config.window_ms as i64;
        let states_before = self.states.len();
        self.states
            .retain(|_, s| now_ms - s.first_request_ms <= window_ms);

        let blocks_before = self.blocks.len();
        self.blocks.retain(|_, b| b.blocked_until_ms > now_ms);

        (
            states_before - self.states.len(),
            blocks_before - self.blocks.len(),
        )
    }
}
