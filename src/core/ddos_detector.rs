//! DDoS detection for the load balancer.
//!
//! Combines static allow/deny lists, geo blocking, request-rate tiers over
//! the client's activity window, bot signatures and repeated-request pattern
//! analysis into a single [`Decision`]. Rules are evaluated in order and the
//! first match wins; the cheap static checks run before behavioural ones.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use log::{info, warn};
use rand::Rng;

use crate::core::activity::{ActivityTracker, ActivityWindow};
use crate::core::features::TrafficFeatures;
use crate::models::{BlockReason, DdosDetectionConfig, Decision};

/// DDoS detector implementation
pub struct DdosDetector {
    config: DdosDetectionConfig,
    activity: Arc<ActivityTracker>,
    allow_list: HashSet<String>,
    /// Static entries plus identities blocked at runtime
    deny_list: DashSet<String>,
    blocked_countries: HashSet<String>,
    /// Recent timestamps per (identity, method, path)
    patterns: DashMap<String, VecDeque<u64>>,
}

impl DdosDetector {
    /// Create a new DDoS detector instance
    pub fn new(mut config: DdosDetectionConfig, activity: Arc<ActivityTracker>) -> Self {
        // gen_bool panics outside [0, 1]
        config.challenge_ratio = if config.challenge_ratio.is_nan() {
            0.0
        } else {
            config.challenge_ratio.clamp(0.0, 1.0)
        };
        let allow_list = config.allow_list.iter().cloned().collect();
        let deny_list = config.deny_list.iter().cloned().collect();
        let blocked_countries = config
            .blocked_countries
            .iter()
            .map(|c| c.to_ascii_uppercase())
            .collect();

        Self {
            config,
            activity,
            allow_list,
            deny_list,
            blocked_countries,
            patterns: DashMap::new(),
        }
    }

    /// Decide what to do with a request from `identity`.
    ///
    /// `window` is the client's activity window right after recording this
    /// request and `features` the snapshot computed for it.
    pub fn evaluate(
        &self,
        identity: &str,
        window: &ActivityWindow,
        features: &TrafficFeatures,
    ) -> Decision {
        if self.allow_list.contains(identity) {
            return Decision::Allow;
        }

        if self.deny_list.contains(identity) {
            warn!("Blocked IP attempted access: {}", identity);
            return Decision::Block(BlockReason::Manual);
        }

        if self.blocked_countries.contains(&features.country) {
            warn!("Blocked request from {} - IP: {}", features.country, identity);
            return Decision::Block(BlockReason::Geo);
        }

        for threshold in &self.config.rate_thresholds {
            let count = window.count_within(threshold.window_ms);
            if count > threshold.max_requests {
                warn!(
                    "High request rate: {} made {} requests in {}ms (limit {})",
                    identity, count, threshold.window_ms, threshold.max_requests
                );
                if threshold.sticky {
                    self.activity.mark_suspicious(identity);
                    info!("Marked {} as persistently suspicious", identity);
                }
                return Decision::Block(BlockReason::RateThreshold);
            }
        }

        let bot = features.is_headless;
        if bot {
            self.activity.mark_suspicious(identity);
            warn!(
                "Suspicious bot detected - IP: {}, UA: {}",
                identity, features.user_agent
            );
            if rand::thread_rng().gen_bool(self.config.challenge_ratio) {
                return Decision::Challenge(BlockReason::Bot);
            }
        }

        let repeats = self.track_pattern(identity, features, window.observed_at);
        if repeats > self.config.pattern_threshold {
            self.activity.mark_suspicious(identity);
            warn!(
                "Suspicious pattern detected - IP: {}, {} {} repeated {} times",
                identity, features.method, features.path, repeats
            );
            return Decision::Block(BlockReason::Pattern);
        }

        if bot {
            Decision::Flagged(BlockReason::Bot)
        } else {
            Decision::Allow
        }
    }

    /// Record this request's pattern and return how often it was seen in the window
    fn track_pattern(&self, identity: &str, features: &TrafficFeatures, now: u64) -> usize {
        let key = format!("{}:{}:{}", identity, features.method, features.path);
        let mut seen = self.patterns.entry(key).or_default();
        seen.push_back(now);
        while seen
            .front()
            .is_some_and(|ts| now.saturating_sub(*ts) > self.config.pattern_window_ms)
        {
            seen.pop_front();
        }
        seen.len()
    }

    /// Add an identity to the deny-list
    pub fn block(&self, identity: &str) {
        self.deny_list.insert(identity.to_string());
        info!("Manually blocked IP: {}", identity);
    }

    /// Remove an identity from the deny-list and clear its suspicious flag
    pub fn unblock(&self, identity: &str) -> bool {
        let removed = self.deny_list.remove(identity).is_some();
        self.activity.clear_suspicious(identity);
        info!("Unblocked IP: {}", identity);
        removed
    }

    pub fn denied_count(&self) -> usize {
        self.deny_list.len()
    }

    pub fn is_denied(&self, identity: &str) -> bool {
        self.deny_list.contains(identity)
    }

    /// Drop pattern history older than the pattern window. Returns the tracked pattern count.
    pub fn evict_stale_patterns(&self, now: u64) -> usize {
        let window = self.config.pattern_window_ms;
        self.patterns.retain(|_, seen| {
            while seen.front().is_some_and(|ts| now.saturating_sub(*ts) > window) {
                seen.pop_front();
            }
            !seen.is_empty()
        });
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn features(identity: &str, user_agent: &str, country: &str) -> TrafficFeatures {
        TrafficFeatures {
            client_ip: identity.into(),
            country: country.into(),
            source_port: None,
            dest_port: None,
            protocol: "HTTP".into(),
            method: "GET".into(),
            path: "/".into(),
            flow_duration_ms: 0,
            requests_1s: 0,
            requests_10s: 0,
            requests_60s: 0,
            packets_per_second: 0.0,
            unique_paths_60s: 0,
            avg_inter_arrival_ms: 0.0,
            std_inter_arrival_ms: 0.0,
            avg_packet_size: 0.0,
            packet_size_variance: 0.0,
            user_agent: user_agent.into(),
            is_headless: user_agent.contains("curl"),
            packet_size: 0,
            total_bytes_60s: 0,
            method_counts: BTreeMap::new(),
            observed_at: 0,
            degraded: false,
        }
    }

    fn config() -> DdosDetectionConfig {
        DdosDetectionConfig {
            allow_list: vec!["10.0.0.100".into()],
            deny_list: vec!["10.0.0.66".into()],
            blocked_countries: vec!["KP".into()],
            challenge_ratio: 0.0,
            ..DdosDetectionConfig::default()
        }
    }

    fn detector(config: DdosDetectionConfig) -> (DdosDetector, Arc<ActivityTracker>) {
        let tracker = Arc::new(ActivityTracker::new(config.activity_horizon_ms));
        (DdosDetector::new(config, tracker.clone()), tracker)
    }

    /// Send `n` requests spaced `gap_ms` apart and return the last decision
    fn burst(
        detector: &DdosDetector,
        tracker: &ActivityTracker,
        identity: &str,
        n: u64,
        gap_ms: u64,
    ) -> Decision {
        let mut decision = Decision::Allow;
        for i in 0..n {
            let window = tracker.record_at(identity, 1_000_000 + i * gap_ms);
            decision = detector.evaluate(identity, &window, &features(identity, "Mozilla", "US"));
        }
        decision
    }

    #[test]
    fn test_allow_list_is_never_blocked() {
        let mut config = config();
        config.deny_list.push("10.0.0.100".into());
        config.blocked_countries.push("US".into());
        let (detector, tracker) = detector(config);

        assert_eq!(burst(&detector, &tracker, "10.0.0.100", 500, 1), Decision::Allow);
    }

    #[test]
    fn test_deny_list_and_geo() {
        let (detector, tracker) = detector(config());
        let window = tracker.record_at("10.0.0.66", 1);
        assert_eq!(
            detector.evaluate("10.0.0.66", &window, &features("10.0.0.66", "Mozilla", "US")),
            Decision::Block(BlockReason::Manual)
        );

        let window = tracker.record_at("10.0.0.7", 1);
        assert_eq!(
            detector.evaluate("10.0.0.7", &window, &features("10.0.0.7", "Mozilla", "KP")),
            Decision::Block(BlockReason::Geo)
        );
    }

    #[test]
    fn test_one_second_threshold() {
        let mut config = config();
        config.pattern_threshold = usize::MAX;
        let (detector, tracker) = detector(config);

        assert_eq!(burst(&detector, &tracker, "10.0.0.1", 15, 10), Decision::Allow);
        let window = tracker.record_at("10.0.0.1", 1_000_000 + 15 * 10);
        assert_eq!(
            detector.evaluate("10.0.0.1", &window, &features("10.0.0.1", "Mozilla", "US")),
            Decision::Block(BlockReason::RateThreshold)
        );
        assert!(!tracker.is_suspicious("10.0.0.1"));
    }

    #[test]
    fn test_ten_second_threshold_is_sticky() {
        let mut config = config();
        config.pattern_threshold = usize::MAX;
        let (detector, tracker) = detector(config);

        // 61 requests, 150ms apart: under the 1s and 5s tiers, over the 10s tier.
        assert_eq!(
            burst(&detector, &tracker, "10.0.0.2", 61, 150),
            Decision::Block(BlockReason::RateThreshold)
        );
        assert!(tracker.is_suspicious("10.0.0.2"));
    }

    #[test]
    fn test_bot_challenge_and_flag() {
        let mut config = config();
        config.challenge_ratio = 1.0;
        let (challenging, tracker) = detector(config);
        let window = tracker.record_at("10.0.0.3", 1);
        assert_eq!(
            challenging.evaluate("10.0.0.3", &window, &features("10.0.0.3", "curl/8.0", "US")),
            Decision::Challenge(BlockReason::Bot)
        );
        assert!(tracker.is_suspicious("10.0.0.3"));

        let (flagging, tracker) = detector(self::config());
        let window = tracker.record_at("10.0.0.3", 1);
        assert_eq!(
            flagging.evaluate("10.0.0.3", &window, &features("10.0.0.3", "curl/8.0", "US")),
            Decision::Flagged(BlockReason::Bot)
        );
    }

    #[test]
    fn test_repeated_pattern() {
        let mut config = config();
        config.pattern_threshold = 10;
        config.rate_thresholds.clear();
        let (detector, tracker) = detector(config);

        assert_eq!(burst(&detector, &tracker, "10.0.0.4", 10, 100), Decision::Allow);
        assert_eq!(
            burst(&detector, &tracker, "10.0.0.4", 1, 100),
            Decision::Block(BlockReason::Pattern)
        );
    }

    #[test]
    fn test_runtime_block_and_unblock() {
        let (detector, tracker) = detector(config());
        detector.block("10.0.0.9");
        let window = tracker.record_at("10.0.0.9", 1);
        assert_eq!(
            detector.evaluate("10.0.0.9", &window, &features("10.0.0.9", "Mozilla", "US")),
            Decision::Block(BlockReason::Manual)
        );

        tracker.mark_suspicious("10.0.0.9");
        assert!(detector.unblock("10.0.0.9"));
        assert!(!tracker.is_suspicious("10.0.0.9"));
        assert!(!detector.is_denied("10.0.0.9"));
    }

    #[test]
    fn test_stale_patterns_are_evicted() {
        let (detector, tracker) = detector(config());
        let window = tracker.record_at("10.0.0.5", 0);
        detector.evaluate("10.0.0.5", &window, &features("10.0.0.5", "Mozilla", "US"));
        assert_eq!(detector.evict_stale_patterns(30_000), 1);
        assert_eq!(detector.evict_stale_patterns(61_000), 0);
    }
}
