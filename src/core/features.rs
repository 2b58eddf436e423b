//! Statistical traffic features per client.
//!
//! Raw per-request counters are recorded into the [`CounterStore`] and a
//! read-only [`TrafficFeatures`] snapshot is computed from what the store
//! currently retains. Aggregates are computed over the bounded windows only,
//! never over the lifetime of a client, so they describe recent behaviour.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, log_enabled, warn, Level};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::geo::GeoResolver;
use crate::core::store::{CounterStore, StoreError};
use crate::utils::now_millis;

/// Maximum retained inter-arrival times and packet sizes per client
pub const SAMPLE_CAP: usize = 100;

const SECOND: Duration = Duration::from_secs(1);
const TEN_SECONDS: Duration = Duration::from_secs(10);
const MINUTE: Duration = Duration::from_secs(60);
/// Timestamps outlive the 60s counters slightly so the first request of a
/// new window still sees its predecessor.
const TIMESTAMP_TTL: Duration = Duration::from_secs(65);

/// Request attributes the extractor needs, independent of the HTTP framework
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    /// Estimated size of the request line and headers
    pub header_bytes: u64,
    /// Declared `Content-Length`, zero when absent
    pub content_length: u64,
    pub user_agent: String,
    /// Whether the client connection is encrypted
    pub encrypted: bool,
    pub source_port: Option<u16>,
    /// Local port the connection arrived on
    pub dest_port: Option<u16>,
}

impl RequestInfo {
    pub fn packet_size(&self) -> u64 {
        self.header_bytes + self.content_length
    }
}

/// Snapshot of a client's recent traffic, recomputed on every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficFeatures {
    pub client_ip: String,
    pub country: String,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
    pub protocol: String,
    pub method: String,
    pub path: String,
    pub flow_duration_ms: u64,
    pub requests_1s: u64,
    pub requests_10s: u64,
    pub requests_60s: u64,
    pub packets_per_second: f64,
    pub unique_paths_60s: u64,
    pub avg_inter_arrival_ms: f64,
    pub std_inter_arrival_ms: f64,
    pub avg_packet_size: f64,
    pub packet_size_variance: f64,
    pub user_agent: String,
    pub is_headless: bool,
    pub packet_size: u64,
    pub total_bytes_60s: u64,
    pub method_counts: BTreeMap<String, u64>,
    pub observed_at: u64,
    /// Counters could not be read; only request-local attributes are set
    pub degraded: bool,
}

/// Population mean and variance; the variance of fewer than two samples is zero
pub fn mean_and_variance(samples: &[i64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let variance = samples
        .iter()
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance)
}

/// Feature extractor
pub struct FeatureExtractor {
    store: Arc<dyn CounterStore>,
    geo: GeoResolver,
    bot_signatures: Vec<String>,
    store_timeout: Duration,
    /// Serialises counter updates per client
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FeatureExtractor {
    pub fn new(
        store: Arc<dyn CounterStore>,
        geo: GeoResolver,
        bot_signatures: Vec<String>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            geo,
            bot_signatures: bot_signatures
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            store_timeout,
            locks: DashMap::new(),
        }
    }

    /// Case-insensitive match against the configured bot signatures
    pub fn is_headless(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        self.bot_signatures.iter().any(|token| ua.contains(token.as_str()))
    }

    /// Record the request into the client's counters and compute its features.
    ///
    /// Never fails: if the store is unavailable a degraded snapshot carrying
    /// only the request-local attributes is returned.
    pub async fn extract(&self, identity: &str, request: &RequestInfo) -> TrafficFeatures {
        let now = now_millis();
        let lock = self.lock_for(identity);

        let result = tokio::time::timeout(self.store_timeout, async {
            let _guard = lock.lock().await;
            self.record_and_compute(identity, request, now).await
        })
        .await
        .unwrap_or(Err(StoreError::Timeout));

        let features = match result {
            Ok(features) => features,
            Err(e) => {
                ::metrics::increment_counter!("feature_store_failures");
                warn!("Feature store degraded for {}: {}", identity, e);
                self.local_features(identity, request, now)
            }
        };

        if log_enabled!(Level::Debug) {
            match serde_json::to_string(&features) {
                Ok(json) => debug!("Traffic features: {}", json),
                Err(e) => warn!("Failed to serialise features for {}: {}", identity, e),
            }
        }
        features
    }

    fn lock_for(&self, identity: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop per-client locks nobody is holding. Returns how many remain.
    pub fn evict_idle(&self) -> usize {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.locks.len()
    }

    fn local_features(&self, identity: &str, request: &RequestInfo, now: u64) -> TrafficFeatures {
        TrafficFeatures {
            client_ip: identity.to_string(),
            country: self.geo.lookup(identity),
            source_port: request.source_port,
            dest_port: request.dest_port,
            protocol: if request.encrypted { "HTTPS" } else { "HTTP" }.to_string(),
            method: request.method.clone(),
            path: request.path.clone(),
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
            user_agent: request.user_agent.clone(),
            is_headless: self.is_headless(&request.user_agent),
            packet_size: request.packet_size(),
            total_bytes_60s: 0,
            method_counts: BTreeMap::new(),
            observed_at: now,
            degraded: true,
        }
    }

    async fn record_and_compute(
        &self,
        identity: &str,
        request: &RequestInfo,
        now: u64,
    ) -> Result<TrafficFeatures, StoreError> {
        let base = format!("ip:{}", identity);
        let key = |suffix: &str| format!("{}:{}", base, suffix);
        let store = &self.store;

        let requests_1s = store.incr(&key("count:1s"), 1, SECOND).await?;
        let requests_10s = store.incr(&key("count:10s"), 1, TEN_SECONDS).await?;
        let requests_60s = store.incr(&key("count:60s"), 1, MINUTE).await?;
        let unique_paths = store.set_add(&key("paths:60s"), &request.path, MINUTE).await?;

        let last_seen = store.get(&key("last_ts")).await?;
        store
            .set_if_absent(&key("first_ts"), now as i64, TIMESTAMP_TTL)
            .await?;
        let inter_arrivals = match last_seen {
            Some(last) => {
                let iat = (now as i64 - last).max(0);
                store
                    .list_push_capped(&key("iat"), iat, SAMPLE_CAP, TIMESTAMP_TTL)
                    .await?
            }
            None => Vec::new(),
        };
        store.set(&key("last_ts"), now as i64, TIMESTAMP_TTL).await?;

        let packet_size = request.packet_size();
        let total_bytes = store
            .incr(&key("total_bytes:60s"), packet_size as i64, MINUTE)
            .await?;
        let packet_sizes = store
            .list_push_capped(&key("packet_sizes:60s"), packet_size as i64, SAMPLE_CAP, MINUTE)
            .await?;
        let method = if request.method.is_empty() { "UNKNOWN" } else { request.method.as_str() };
        let method_counts = store
            .hash_incr(&key("method_counts:60s"), method, 1, MINUTE)
            .await?;
        let first_seen = store.get(&key("first_ts")).await?;

        let (avg_iat, var_iat) = mean_and_variance(&inter_arrivals);
        let (avg_packet, var_packet) = mean_and_variance(&packet_sizes);

        let mut features = self.local_features(identity, request, now);
        features.flow_duration_ms = first_seen
            .map(|first| (now as i64 - first).max(0) as u64)
            .unwrap_or(0);
        features.requests_1s = requests_1s.max(0) as u64;
        features.requests_10s = requests_10s.max(0) as u64;
        features.requests_60s = requests_60s.max(0) as u64;
        features.packets_per_second = features.requests_60s as f64 / 60.0;
        features.unique_paths_60s = unique_paths;
        features.avg_inter_arrival_ms = avg_iat;
        features.std_inter_arrival_ms = var_iat.sqrt();
        features.avg_packet_size = avg_packet;
        features.packet_size_variance = var_packet;
        features.total_bytes_60s = total_bytes.max(0) as u64;
        features.method_counts = to_counts(method_counts);
        features.degraded = false;
        Ok(features)
    }
}

fn to_counts(raw: HashMap<String, i64>) -> BTreeMap<String, u64> {
    raw.into_iter()
        .map(|(method, count)| (method, count.max(0) as u64))
        .collect()
}
