//! The load balancer engine.
//!
//! One [`Engine`] owns every piece of mutable state: client activity,
//! counters, deny-lists, backend health and metrics. Nothing is global, so
//! several engines can run side by side in the same process.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::activity::ActivityTracker;
use crate::core::analytics::{MetricsAggregator, MetricsSnapshot};
use crate::core::ddos_detector::DdosDetector;
use crate::core::features::{FeatureExtractor, RequestInfo};
use crate::core::geo::GeoResolver;
use crate::core::health::{BackendPool, BackendServer, BackendStatus, HealthMonitor, PoolError};
use crate::core::persistence::{restore_metrics, SnapshotFlusher};
use crate::core::proxy::{ForwardOutcome, ProxyError, ProxyForwarder, ProxyRequest};
use crate::core::rate_limiter::{RateLimitError, RateLimiter};
use crate::core::routing::{Router, RoutingError};
use crate::core::store::{CounterStore, MemoryStore, RedisStore, StoreError};
use crate::models::{BlockReason, Config, Decision, StoreBackend};
use crate::utils::now_millis;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),
    #[error("Proxy setup error: {0}")]
    Proxy(#[from] ProxyError),
}

/// Why a forward did not produce an upstream response
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Result of one eviction sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted_clients: usize,
    pub tracked_clients: usize,
    pub tracked_patterns: usize,
    pub client_locks: usize,
    pub purged_keys: usize,
}

/// Everything the stats endpoint reports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    #[serde(rename = "suspiciousIPs")]
    pub suspicious_ips: usize,
    #[serde(rename = "blockedIPs")]
    pub blocked_ips: usize,
    pub tracked_clients: usize,
    pub servers: Vec<BackendStatus>,
}

pub struct Engine {
    config: Config,
    store: Arc<dyn CounterStore>,
    activity: Arc<ActivityTracker>,
    limiter: RateLimiter,
    features: FeatureExtractor,
    detector: DdosDetector,
    pool: Arc<BackendPool>,
    router: Router,
    proxy: ProxyForwarder,
    monitor: Arc<HealthMonitor>,
    metrics: Arc<MetricsAggregator>,
    flusher: Arc<SnapshotFlusher>,
}

impl Engine {
    /// Assemble an engine over an existing store and metrics state
    pub fn new(
        config: Config,
        store: Arc<dyn CounterStore>,
        metrics: MetricsAggregator,
    ) -> Result<Self, EngineError> {
        let metrics = Arc::new(metrics);
        let store_timeout = config.store.timeout();
        let activity = Arc::new(ActivityTracker::new(
            config.ddos_detection.activity_horizon_ms,
        ));
        let limiter = RateLimiter::new(
            store.clone(),
            config.rate_limit.clone(),
            store_timeout,
            config.store.failure_policy,
        );
        let features = FeatureExtractor::new(
            store.clone(),
            GeoResolver::from_config(&config.geo),
            config.ddos_detection.bot_signatures.clone(),
            store_timeout,
        );
        let detector = DdosDetector::new(config.ddos_detection.clone(), activity.clone());

        let pool = Arc::new(BackendPool::from_config(&config.backends));
        let router = Router::new(pool.clone(), config.routing.policy);
        let proxy = ProxyForwarder::new(&config.proxy, pool.clone(), metrics.clone())?;
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            config.health_check.clone(),
            metrics.clone(),
        ));
        monitor.publish();
        let flusher = Arc::new(SnapshotFlusher::new(
            metrics.clone(),
            &config.metrics.snapshot_path,
            config.metrics.flush_debounce(),
        ));

        Ok(Self {
            config,
            store,
            activity,
            limiter,
            features,
            detector,
            pool,
            router,
            proxy,
            monitor,
            metrics,
            flusher,
        })
    }

    /// Connect the configured store, restore persisted metrics and assemble the engine
    pub async fn build(config: Config) -> Result<Self, EngineError> {
        let store: Arc<dyn CounterStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis.url).await?),
        };
        let addresses = BackendPool::from_config(&config.backends).addresses();
        let metrics = restore_metrics(config.metrics.snapshot_path.as_ref(), &addresses).await;
        Self::new(config, store, metrics)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Run the admission pipeline for one request.
    ///
    /// Activity is recorded and features computed first, then the detector
    /// decides and finally the rate limiter consumes a point. The first
    /// rejection wins. Every outcome is counted before it is returned.
    pub async fn admit(&self, identity: &str, request: &RequestInfo) -> Decision {
        self.metrics.record_request();

        let window = self.activity.record(identity);
        let features = self.features.extract(identity, request).await;
        let decision = self.detector.evaluate(identity, &window, &features);

        if decision != Decision::Allow {
            self.metrics.record_anomaly();
        }
        if let Decision::Block(reason) | Decision::Challenge(reason) = decision {
            warn!(
                "Rejected {} {} {}: {}",
                identity, request.method, request.path, reason
            );
            self.metrics.record_blocked(reason);
            return decision;
        }

        match self.limiter.consume(identity).await {
            Ok(()) => decision,
            Err(RateLimitError::ExceededLimit { retry_after_ms }) => {
                warn!(
                    "Rate limit exceeded for {}, retry in {}ms",
                    identity, retry_after_ms
                );
                self.metrics.record_blocked(BlockReason::RateLimit);
                Decision::RateLimited {
                    retry_after_ms,
                    reason: BlockReason::RateLimit,
                }
            }
            Err(RateLimitError::StoreUnavailable(e)) => {
                warn!("Rejected {} while the rate limit store is down: {}", identity, e);
                self.metrics.record_blocked(BlockReason::StoreUnavailable);
                Decision::RateLimited {
                    retry_after_ms: self.config.rate_limit.block_duration_ms,
                    reason: BlockReason::StoreUnavailable,
                }
            }
        }
    }

    /// Pick a backend and forward an admitted request to it
    pub async fn forward(&self, request: ProxyRequest) -> Result<ForwardOutcome, ForwardError> {
        let backend = self.router.select_backend().map_err(|e| {
            error!("{} for {} {}", e, request.method, request.path_and_query);
            e
        })?;
        Ok(self.proxy.forward(&backend, request).await?)
    }

    /// Add `identity` to the deny-list
    pub fn block(&self, identity: &str) {
        self.detector.block(identity);
    }

    /// Lift a manual block and the suspicious flag. A running rate-limit
    /// cooldown is left to expire. Returns whether the identity was on the deny-list.
    pub fn unblock(&self, identity: &str) -> bool {
        self.detector.unblock(identity)
    }

    /// Add a backend at runtime; it joins the rotation once its first probe passes
    pub async fn add_backend(&self, address: &str, weight: u32) -> Result<Arc<BackendServer>, PoolError> {
        self.monitor.add_backend(address, weight).await
    }

    pub fn remove_backend(&self, id: &str) -> Option<Arc<BackendServer>> {
        self.monitor.remove_backend(id)
    }

    /// Metrics snapshot plus the detector's live state
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            metrics: self.metrics.snapshot(),
            suspicious_ips: self.activity.suspicious_clients(),
            blocked_ips: self.detector.denied_count(),
            tracked_clients: self.activity.tracked_clients(),
            servers: self.pool.servers().iter().map(|s| s.status()).collect(),
        }
    }

    pub fn is_suspicious(&self, identity: &str) -> bool {
        self.activity.is_suspicious(identity)
    }

    /// Evict idle clients and stale per-client state
    pub async fn sweep(&self) -> SweepStats {
        let now = now_millis();
        let detection = &self.config.ddos_detection;

        let evicted = self.activity.evict_idle(now, detection.idle_eviction_ms);
        let tracked_patterns = self.detector.evict_stale_patterns(now);
        let client_locks = self.features.evict_idle();
        let purged_keys = match self.store.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                warn!("Counter store purge failed: {}", e);
                0
            }
        };

        let stats = SweepStats {
            evicted_clients: evicted.len(),
            tracked_clients: self.activity.tracked_clients(),
            tracked_patterns,
            client_locks,
            purged_keys,
        };
        info!(
            "Eviction sweep: {} idle clients evicted, {} tracked ({} suspicious), {} patterns, {} expired keys purged",
            stats.evicted_clients,
            stats.tracked_clients,
            self.activity.suspicious_clients(),
            stats.tracked_patterns,
            stats.purged_keys
        );
        stats
    }

    /// Write pending metrics to the snapshot file
    pub async fn flush_metrics(&self) {
        match self.flusher.flush_now().await {
            Ok(true) => info!("Metrics snapshot flushed"),
            Ok(false) => {}
            Err(e) => error!("Failed to flush metrics snapshot: {}", e),
        }
    }

    /// Start the health monitor, the eviction sweep and the snapshot flusher
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let engine = Arc::clone(self);
            let interval = Duration::from_millis(engine.config.ddos_detection.sweep_interval_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    engine.sweep().await;
                }
            })
        };

        vec![
            tokio::spawn(self.monitor.clone().run()),
            sweeper,
            tokio::spawn(self.flusher.clone().run()),
        ]
    }
}
