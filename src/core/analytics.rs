//! Traffic analytics for the load balancer.
//!
//! The aggregator keeps every counter of the [`MetricsSnapshot`] in memory
//! with lock-free per-field updates. Each mutation also marks the state
//! dirty and wakes the persistence flusher, which writes the snapshot file
//! off the request path. The same events are mirrored into the `metrics`
//! facade for Prometheus scraping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::models::BlockReason;
use crate::utils::now_millis;

/// Response-time totals of one backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseTimes {
    pub count: u64,
    pub total: u64,
    pub average: f64,
}

/// Aggregate counters, as served on `/metrics` and written to the snapshot file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub anomaly_flags: u64,
    pub load_distribution: BTreeMap<String, u64>,
    pub server_failures: BTreeMap<String, u64>,
    pub response_times: BTreeMap<String, ResponseTimes>,
    pub healthy_servers: Vec<String>,
    pub last_updated: u64,
}

#[derive(Debug, Default)]
struct BackendStats {
    requests: AtomicU64,
    failures: AtomicU64,
    response_count: AtomicU64,
    response_total: AtomicU64,
}

/// In-memory metrics sink shared by every component
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    anomaly_flags: AtomicU64,
    backends: DashMap<String, BackendStats>,
    healthy_servers: RwLock<Vec<String>>,
    last_updated: AtomicU64,
    dirty: AtomicBool,
    changed: Notify,
}

impl MetricsAggregator {
    /// Zeroed counters for every configured backend
    pub fn new(backends: &[String]) -> Self {
        let aggregator = Self::default();
        for backend in backends {
            aggregator.backends.entry(backend.clone()).or_default();
        }
        aggregator
    }

    /// Resume from a persisted snapshot.
    ///
    /// Backends configured now but missing from the snapshot start at zero;
    /// historical entries for backends no longer configured are kept.
    pub fn restore(snapshot: MetricsSnapshot, backends: &[String]) -> Self {
        let aggregator = Self::new(backends);
        aggregator
            .total_requests
            .store(snapshot.total_requests, Ordering::Relaxed);
        aggregator
            .blocked_requests
            .store(snapshot.blocked_requests, Ordering::Relaxed);
        aggregator
            .anomaly_flags
            .store(snapshot.anomaly_flags, Ordering::Relaxed);
        aggregator
            .last_updated
            .store(snapshot.last_updated, Ordering::Relaxed);

        for (backend, count) in snapshot.load_distribution {
            aggregator
                .backends
                .entry(backend)
                .or_default()
                .requests
                .store(count, Ordering::Relaxed);
        }
        for (backend, count) in snapshot.server_failures {
            aggregator
                .backends
                .entry(backend)
                .or_default()
                .failures
                .store(count, Ordering::Relaxed);
        }
        for (backend, times) in snapshot.response_times {
            let stats = aggregator.backends.entry(backend).or_default();
            stats.response_count.store(times.count, Ordering::Relaxed);
            stats.response_total.store(times.total, Ordering::Relaxed);
        }
        aggregator
    }

    /// Start zeroed counters for a backend added at runtime
    pub fn register_backend(&self, backend: &str) {
        if self.backends.contains_key(backend) {
            return;
        }
        self.backends.entry(backend.to_string()).or_default();
        self.touch();
    }

    /// A request entered the admission pipeline
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        ::metrics::increment_counter!("lb_requests_total");
        self.touch();
    }

    /// A request is about to be forwarded to `backend`
    pub fn record_attempt(&self, backend: &str) {
        self.stats(backend, |stats| {
            stats.requests.fetch_add(1, Ordering::Relaxed);
        });
        self.touch();
    }

    /// A forward to `backend` finished after `elapsed_ms`
    pub fn record_outcome(&self, backend: &str, elapsed_ms: u64, failed: bool) {
        self.stats(backend, |stats| {
            stats.response_count.fetch_add(1, Ordering::Relaxed);
            stats.response_total.fetch_add(elapsed_ms, Ordering::Relaxed);
            if failed {
                stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        });
        ::metrics::histogram!(
            "lb_upstream_latency_ms",
            elapsed_ms as f64,
            "backend" => backend.to_string()
        );
        if failed {
            ::metrics::increment_counter!("lb_upstream_failures_total", "backend" => backend.to_string());
        }
        self.touch();
    }

    /// A request was rejected before reaching a backend
    pub fn record_blocked(&self, reason: BlockReason) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        ::metrics::increment_counter!("lb_blocked_total", "reason" => reason.as_str());
        self.touch();
    }

    /// The detector flagged a request, whether or not it was let through
    pub fn record_anomaly(&self) {
        self.anomaly_flags.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Replace the list of currently healthy backends
    pub fn record_health(&self, healthy: Vec<String>) {
        let mut current = self
            .healthy_servers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != healthy {
            *current = healthy;
            drop(current);
            self.touch();
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Epoch milliseconds of the last mutation
    pub fn last_updated(&self) -> u64 {
        self.last_updated.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            anomaly_flags: self.anomaly_flags.load(Ordering::Relaxed),
            healthy_servers: self
                .healthy_servers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            last_updated: self.last_updated.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        };

        for entry in self.backends.iter() {
            let backend = entry.key().clone();
            let stats = entry.value();
            let count = stats.response_count.load(Ordering::Relaxed);
            let total = stats.response_total.load(Ordering::Relaxed);
            snapshot
                .load_distribution
                .insert(backend.clone(), stats.requests.load(Ordering::Relaxed));
            snapshot
                .server_failures
                .insert(backend.clone(), stats.failures.load(Ordering::Relaxed));
            snapshot.response_times.insert(
                backend,
                ResponseTimes {
                    count,
                    total,
                    average: if count == 0 { 0.0 } else { total as f64 / count as f64 },
                },
            );
        }
        snapshot
    }

    /// Clear the dirty flag, returning whether anything changed since the last call
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Flag pending changes again, without waking the flusher
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Wait until the next mutation
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    fn stats(&self, backend: &str, update: impl FnOnce(&BackendStats)) {
        if let Some(stats) = self.backends.get(backend) {
            update(stats.value());
            return;
        }
        update(self.backends.entry(backend.to_string()).or_default().value());
    }

    fn touch(&self) {
        self.last_updated.store(now_millis(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        self.changed.notify_one();
    }
}
