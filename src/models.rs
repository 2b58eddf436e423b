use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Derive the client identity from `X-Forwarded-For` instead of the socket address
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            trust_forwarded_for: false,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Which counter store backs the rate limiter and feature extractor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Single-process, in-memory counters
    Memory,
    /// Counters shared across instances through Redis
    Redis,
}

/// What to do when the counter store cannot answer in time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through
    Open,
    /// Treat the request as rate limited
    Closed,
}

/// Counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Timeout for a single store operation, in milliseconds
    pub timeout_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            timeout_ms: 250,
            failure_policy: FailurePolicy::Open,
        }
    }
}

/// How points are handed out inside a window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// The whole quota may be spent at once
    Burst,
    /// Allowed requests are delayed to spread the quota across the window
    Even,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Points available per window
    pub points: u32,
    /// Window length in milliseconds
    pub duration_ms: u64,
    /// Cooldown applied once the quota is exhausted, in milliseconds
    pub block_duration_ms: u64,
    pub policy: RateLimitPolicy,
    /// Prefix for limiter keys in the counter store
    pub key_prefix: String,
}

impl RateLimitConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 20,
            duration_ms: 1_000,
            block_duration_ms: 5_000,
            policy: RateLimitPolicy::Burst,
            key_prefix: "ddos".to_string(),
        }
    }
}

/// A request-rate threshold over one horizon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateThreshold {
    /// Horizon in milliseconds
    pub window_ms: u64,
    /// Requests allowed inside the horizon
    pub max_requests: usize,
    /// Breaching this tier marks the client as persistently suspicious
    #[serde(default)]
    pub sticky: bool,
}

/// DDoS detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosDetectionConfig {
    /// Rate tiers, checked in order
    pub rate_thresholds: Vec<RateThreshold>,
    /// Retention horizon of the per-client activity window, in milliseconds
    pub activity_horizon_ms: u64,
    /// Clients idle for longer than this are evicted, in milliseconds
    pub idle_eviction_ms: u64,
    /// Interval of the eviction sweep, in milliseconds
    pub sweep_interval_ms: u64,
    /// Identities that bypass every detection rule
    pub allow_list: Vec<String>,
    /// Identities that are always blocked
    pub deny_list: Vec<String>,
    /// ISO country codes that are always blocked
    pub blocked_countries: Vec<String>,
    /// Case-insensitive user-agent tokens that identify automated clients
    pub bot_signatures: Vec<String>,
    /// Fraction of bot matches that get a challenge instead of passing flagged
    pub challenge_ratio: f64,
    /// Identical (client, method, path) requests tolerated inside the pattern window
    pub pattern_threshold: usize,
    /// Pattern tracking window, in milliseconds
    pub pattern_window_ms: u64,
}

impl Default for DdosDetectionConfig {
    fn default() -> Self {
        Self {
            rate_thresholds: vec![
                RateThreshold { window_ms: 1_000, max_requests: 15, sticky: false },
                RateThreshold { window_ms: 5_000, max_requests: 40, sticky: false },
                RateThreshold { window_ms: 10_000, max_requests: 60, sticky: true },
            ],
            activity_horizon_ms: 10_000,
            idle_eviction_ms: 5 * 60 * 1_000,
            sweep_interval_ms: 60_000,
            allow_list: vec!["127.0.0.1".to_string(), "::1".to_string()],
            deny_list: Vec::new(),
            blocked_countries: Vec::new(),
            bot_signatures: ["headlesschrome", "phantomjs", "curl", "bot"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            challenge_ratio: 0.3,
            pattern_threshold: 10,
            pattern_window_ms: 60_000,
        }
    }
}

/// One entry of the static geo table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeoRange {
    pub cidr: String,
    pub country: String,
}

/// Geo lookup configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub ranges: Vec<GeoRange>,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe interval in milliseconds
    pub interval_ms: u64,
    /// Probe timeout in milliseconds; slower answers count as failures
    pub timeout_ms: u64,
    /// Path probed on every backend
    pub path: String,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 5_000,
            path: "/health".to_string(),
        }
    }
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Total upstream timeout (connect + response headers), in milliseconds
    pub timeout_ms: u64,
    /// Upstream connect timeout, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            connect_timeout_ms: 2_000,
        }
    }
}

/// Backend selection policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    RoundRobin,
    WeightedRandom,
    LatencyRanked,
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingPolicy::RoundRobin => "round_robin",
            RoutingPolicy::WeightedRandom => "weighted_random",
            RoutingPolicy::LatencyRanked => "latency_ranked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub policy: RoutingPolicy,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: RoutingPolicy::RoundRobin,
        }
    }
}

/// A configured backend server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://localhost:3001`
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Snapshot file rewritten on every debounced flush
    pub snapshot_path: String,
    /// Writes within this window are coalesced, in milliseconds
    pub flush_debounce_ms: u64,
    /// Listen address for the Prometheus exporter, disabled when unset
    pub prometheus_listen: Option<String>,
}

impl MetricsConfig {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "stats.json".to_string(),
            flush_debounce_ms: 1_000,
            prometheus_listen: None,
        }
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub ddos_detection: DdosDetectionConfig,
    pub geo: GeoConfig,
    pub health_check: HealthCheckConfig,
    pub proxy: ProxyConfig,
    pub routing: RoutingConfig,
    pub backends: Vec<BackendConfig>,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            ddos_detection: DdosDetectionConfig::default(),
            geo: GeoConfig::default(),
            health_check: HealthCheckConfig::default(),
            proxy: ProxyConfig::default(),
            routing: RoutingConfig::default(),
            backends: (1..=4)
                .map(|i| BackendConfig {
                    address: format!("http://localhost:300{}", i),
                    weight: 1,
                })
                .collect(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Why a request was rejected or flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    Manual,
    Geo,
    RateThreshold,
    Bot,
    Pattern,
    RateLimit,
    StoreUnavailable,
}

impl BlockReason {
    /// Machine-readable reason sent to clients
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Manual => "manual",
            BlockReason::Geo => "geo",
            BlockReason::RateThreshold => "rate-threshold",
            BlockReason::Bot => "bot",
            BlockReason::Pattern => "pattern",
            BlockReason::RateLimit => "rate-limit",
            BlockReason::StoreUnavailable => "store-unavailable",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request admission verdict. Never stored, only logged and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Allowed, but counted as an anomaly
    Flagged(BlockReason),
    Block(BlockReason),
    Challenge(BlockReason),
    RateLimited { retry_after_ms: u64, reason: BlockReason },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow | Decision::Flagged(_))
    }
}
