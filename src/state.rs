//! Dynamic per-instance runtime state: health triplet, error counters
//! partitioned by origin and class, sliding usage windows, latency EMA.
//! The coordination store owns the durable copy; anything in memory is a
//! read snapshot that must be written back to persist.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Seconds of history retained in every window map. Entries older than this
/// are evicted on every touch.
pub const WINDOW_SECONDS: i64 = 60;

/// EMA smoothing factor for `avg_latency_ms`.
const LATENCY_EMA_ALPHA: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Healthy,
    RateLimited,
    Error,
}

/// Where an error was observed, for counter partitioning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorOrigin {
    Upstream,
    Instance,
    Client,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceState {
    pub name: String,
    pub status: InstanceStatus,
    pub health_status: String,
    pub connection_status: String,

    // Error tracking
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<i64>,

    // Instance-level errors
    pub total_errors_500: u64,
    pub total_errors_503: u64,
    pub total_other_errors: u64,
    pub error_500_window: BTreeMap<i64, u64>,
    pub error_503_window: BTreeMap<i64, u64>,
    pub error_other_window: BTreeMap<i64, u64>,
    pub current_error_rate: f64,
    pub current_500_rate: f64,
    pub current_503_rate: f64,

    // Client-level errors
    pub total_client_errors_500: u64,
    pub total_client_errors_503: u64,
    pub total_client_errors_other: u64,
    pub client_error_500_window: BTreeMap<i64, u64>,
    pub client_error_503_window: BTreeMap<i64, u64>,
    pub client_error_other_window: BTreeMap<i64, u64>,
    pub current_client_error_rate: f64,
    pub current_client_500_rate: f64,
    pub current_client_503_rate: f64,

    // Upstream errors
    pub total_upstream_429_errors: u64,
    pub total_upstream_400_errors: u64,
    pub total_upstream_500_errors: u64,
    pub total_upstream_other_errors: u64,
    pub upstream_429_window: BTreeMap<i64, u64>,
    pub upstream_400_window: BTreeMap<i64, u64>,
    pub upstream_500_window: BTreeMap<i64, u64>,
    pub upstream_other_window: BTreeMap<i64, u64>,
    pub current_upstream_error_rate: f64,
    pub current_upstream_429_rate: f64,
    pub current_upstream_400_rate: f64,

    // Rate limiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<i64>,

    // Usage metrics
    pub current_tpm: u64,
    pub current_rpm: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_tokens_served: u64,
    pub usage_window: BTreeMap<i64, u64>,
    pub request_window: BTreeMap<i64, u64>,

    // Performance metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    pub utilization_percentage: f64,

    pub last_used: i64,
}

impl InstanceState {
    /// Identity-only constructor; used on first reference to an instance.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: InstanceStatus::Healthy,
            health_status: "unknown".to_string(),
            connection_status: "unknown".to_string(),
            error_count: 0,
            last_error: None,
            last_error_time: None,
            total_errors_500: 0,
            total_errors_503: 0,
            total_other_errors: 0,
            error_500_window: BTreeMap::new(),
            error_503_window: BTreeMap::new(),
            error_other_window: BTreeMap::new(),
            current_error_rate: 0.0,
            current_500_rate: 0.0,
            current_503_rate: 0.0,
            total_client_errors_500: 0,
            total_client_errors_503: 0,
            total_client_errors_other: 0,
            client_error_500_window: BTreeMap::new(),
            client_error_503_window: BTreeMap::new(),
            client_error_other_window: BTreeMap::new(),
            current_client_error_rate: 0.0,
            current_client_500_rate: 0.0,
            current_client_503_rate: 0.0,
            total_upstream_429_errors: 0,
            total_upstream_400_errors: 0,
            total_upstream_500_errors: 0,
            total_upstream_other_errors: 0,
            upstream_429_window: BTreeMap::new(),
            upstream_400_window: BTreeMap::new(),
            upstream_500_window: BTreeMap::new(),
            upstream_other_window: BTreeMap::new(),
            current_upstream_error_rate: 0.0,
            current_upstream_429_rate: 0.0,
            current_upstream_400_rate: 0.0,
            rate_limited_until: None,
            current_tpm: 0,
            current_rpm: 0,
            total_requests: 0,
            successful_requests: 0,
            total_tokens_served: 0,
            usage_window: BTreeMap::new(),
            request_window: BTreeMap::new(),
            avg_latency_ms: None,
            utilization_percentage: 0.0,
            last_used: crate::error::unix_now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }

    /// Marks the instance excluded from selection until `until`.
    pub fn mark_rate_limited(&mut self, until: i64) {
        self.rate_limited_until = Some(until);
        self.status = InstanceStatus::RateLimited;
    }

    /// Clears a lapsed rate-limit exclusion so `status = rate_limited` holds
    /// exactly while `now < rate_limited_until`.
    pub fn refresh_rate_limit(&mut self, now: i64) {
        if let Some(until) = self.rate_limited_until {
            if now >= until {
                self.rate_limited_until = None;
                if self.status == InstanceStatus::RateLimited {
                    self.status = InstanceStatus::Healthy;
                }
            }
        }
    }

    pub fn record_success(&mut self, tokens: u64, latency_ms: f64, max_tpm: u64, now: i64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_tokens_served = self.total_tokens_served.saturating_add(tokens);
        self.last_used = now;

        *self.usage_window.entry(now).or_insert(0) += tokens;
        *self.request_window.entry(now).or_insert(0) += 1;
        self.prune_windows(now);
        self.recompute_usage(max_tpm);

        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => (1.0 - LATENCY_EMA_ALPHA) * avg + LATENCY_EMA_ALPHA * latency_ms,
            None => latency_ms,
        });
    }

    pub fn record_error(&mut self, status_code: u16, origin: ErrorOrigin, message: &str, now: i64) {
        self.error_count += 1;
        self.total_requests += 1;
        self.last_error = Some(message.to_string());
        self.last_error_time = Some(now);

        match status_code {
            500 => {
                self.total_errors_500 += 1;
                *self.error_500_window.entry(now).or_insert(0) += 1;
            }
            503 => {
                self.total_errors_503 += 1;
                *self.error_503_window.entry(now).or_insert(0) += 1;
            }
            _ => {
                self.total_other_errors += 1;
                *self.error_other_window.entry(now).or_insert(0) += 1;
            }
        }

        match origin {
            ErrorOrigin::Upstream => match status_code {
                429 => {
                    self.total_upstream_429_errors += 1;
                    *self.upstream_429_window.entry(now).or_insert(0) += 1;
                }
                400 => {
                    self.total_upstream_400_errors += 1;
                    *self.upstream_400_window.entry(now).or_insert(0) += 1;
                }
                500..=599 => {
                    self.total_upstream_500_errors += 1;
                    *self.upstream_500_window.entry(now).or_insert(0) += 1;
                }
                _ => {
                    self.total_upstream_other_errors += 1;
                    *self.upstream_other_window.entry(now).or_insert(0) += 1;
                }
            },
            ErrorOrigin::Client => match status_code {
                500 => {
                    self.total_client_errors_500 += 1;
                    *self.client_error_500_window.entry(now).or_insert(0) += 1;
                }
                503 => {
                    self.total_client_errors_503 += 1;
                    *self.client_error_503_window.entry(now).or_insert(0) += 1;
                }
                _ => {
                    self.total_client_errors_other += 1;
                    *self.client_error_other_window.entry(now).or_insert(0) += 1;
                }
            },
            ErrorOrigin::Instance => {}
        }

        self.prune_windows(now);
        self.recompute_error_rates();

        if self.current_error_rate > 50.0 && self.total_requests > 10 {
            self.status = InstanceStatus::Error;
            self.health_status = "unhealthy".to_string();
        }
    }

    /// Evicts window entries older than the retention horizon. Invariant:
    /// after any admission or read, every key is within `now - 60s`.
    pub fn prune_windows(&mut self, now: i64) {
        let cutoff = now - WINDOW_SECONDS;
        for window in [
            &mut self.error_500_window,
            &mut self.error_503_window,
            &mut self.error_other_window,
            &mut self.client_error_500_window,
            &mut self.client_error_503_window,
            &mut self.client_error_other_window,
            &mut self.upstream_429_window,
            &mut self.upstream_400_window,
            &mut self.upstream_500_window,
            &mut self.upstream_other_window,
            &mut self.usage_window,
            &mut self.request_window,
        ] {
            window.retain(|ts, _| *ts >= cutoff);
        }
    }

    fn recompute_usage(&mut self, max_tpm: u64) {
        self.current_tpm = self.usage_window.values().sum();
        self.current_rpm = self.request_window.values().sum();
        self.utilization_percentage = if max_tpm == 0 {
            0.0
        } else {
            (self.current_tpm as f64 / max_tpm as f64 * 100.0).clamp(0.0, 100.0)
        };
    }

    fn recompute_error_rates(&mut self) {
        let total = self.total_requests as f64;
        if total == 0.0 {
            return;
        }
        let pct = |count: u64| count as f64 / total * 100.0;

        self.current_error_rate = pct(self.error_count);
        self.current_500_rate = pct(self.total_errors_500);
        self.current_503_rate = pct(self.total_errors_503);
        self.current_client_error_rate = pct(self.total_client_errors_500
            + self.total_client_errors_503
            + self.total_client_errors_other);
        self.current_client_500_rate = pct(self.total_client_errors_500);
        self.current_client_503_rate = pct(self.total_client_errors_503);
        self.current_upstream_error_rate = pct(self.total_upstream_429_errors
            + self.total_upstream_400_errors
            + self.total_upstream_500_errors
            + self.total_upstream_other_errors);
        self.current_upstream_429_rate = pct(self.total_upstream_429_errors);
        self.current_upstream_400_rate = pct(self.total_upstream_400_errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_ema_matches_closed_form_recursion() {
        let mut state = InstanceState::new("a");
        let samples = [120.0, 80.0, 200.0, 55.0, 90.0];

        let mut expected = samples[0];
        state.record_success(10, samples[0], 60_000, 1_000);
        for sample in &samples[1..] {
            state.record_success(10, *sample, 60_000, 1_000);
            expected = 0.9 * expected + 0.1 * sample;
        }

        let avg = state.avg_latency_ms.expect("seeded after first sample");
        assert!((avg - expected).abs() < 1e-9);
    }

    #[test]
    fn demotes_after_error_rate_crosses_threshold() {
        let mut state = InstanceState::new("a");
        for i in 0..11 {
            state.record_error(500, ErrorOrigin::Upstream, "upstream exploded", 1_000 + i);
        }
        assert_eq!(state.status, InstanceStatus::Error);
        assert_eq!(state.health_status, "unhealthy");
        assert!(!state.is_healthy());
        assert_eq!(state.total_upstream_500_errors, 11);
        assert_eq!(state.total_errors_500, 11);
        assert_eq!(state.last_error.as_deref(), Some("upstream exploded"));
        assert_eq!(state.last_error_time, Some(1_010));
    }

    #[test]
    fn does_not_demote_below_eleven_requests() {
        let mut state = InstanceState::new("a");
        for i in 0..10 {
            state.record_error(503, ErrorOrigin::Instance, "unavailable", 1_000 + i);
        }
        // 100% error rate but only 10 requests.
        assert_eq!(state.status, InstanceStatus::Healthy);
    }

    #[test]
    fn windows_evict_entries_older_than_a_minute() {
        let mut state = InstanceState::new("a");
        state.record_success(100, 10.0, 60_000, 1_000);
        state.record_success(50, 10.0, 60_000, 1_030);
        assert_eq!(state.current_tpm, 150);

        state.record_success(25, 10.0, 60_000, 1_070);
        // The 1_000 bucket is now outside the window.
        assert_eq!(state.current_tpm, 75);
        assert!(state.usage_window.keys().all(|ts| *ts >= 1_070 - 60));
        assert_eq!(state.current_rpm, 2);
    }

    #[test]
    fn utilization_stays_within_bounds() {
        let mut state = InstanceState::new("a");
        state.record_success(90_000, 10.0, 60_000, 1_000);
        assert_eq!(state.utilization_percentage, 100.0);
    }

    #[test]
    fn rate_limited_status_clears_once_window_lapses() {
        let mut state = InstanceState::new("a");
        state.mark_rate_limited(2_000);
        assert!(!state.is_healthy());

        state.refresh_rate_limit(1_999);
        assert_eq!(state.status, InstanceStatus::RateLimited);

        state.refresh_rate_limit(2_000);
        assert_eq!(state.status, InstanceStatus::Healthy);
        assert!(state.rate_limited_until.is_none());
    }

    #[test]
    fn counters_survive_a_json_round_trip() {
        let mut state = InstanceState::new("a");
        state.record_success(10, 42.0, 60_000, 1_000);
        state.record_error(429, ErrorOrigin::Upstream, "rate limit exceeded", 1_001);

        let raw = serde_json::to_string(&state).unwrap();
        let decoded: InstanceState = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.total_requests, 2);
        assert_eq!(decoded.successful_requests, 1);
        assert_eq!(decoded.total_upstream_429_errors, 1);
        assert_eq!(decoded.usage_window.get(&1_000), Some(&10));
    }
}
