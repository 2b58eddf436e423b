//! Backend health monitoring.
//!
//! Every backend is probed on a fixed interval with `GET {address}{path}`.
//! A 2xx answer within the probe timeout keeps (or makes) it healthy,
//! anything else marks it unhealthy. Probes run concurrently so one slow
//! backend never delays the verdict on the others. The proxy may also
//! downgrade a backend between probes when a forward fails to connect.
//!
//! Backends can be added and removed at runtime. A new backend stays out of
//! rotation until its first health check passes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::core::analytics::MetricsAggregator;
use crate::models::{BackendConfig, HealthCheckConfig};
use crate::utils::now_millis;

/// Number of probe latencies kept per backend
pub const LATENCY_HISTORY: usize = 10;

/// Errors raised when changing the backend set at runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Backend {0} is already registered")]
    Duplicate(String),
    #[error("Invalid backend: {0}")]
    Invalid(String),
}

/// A configured upstream server and its observed health
#[derive(Debug)]
pub struct BackendServer {
    id: String,
    address: String,
    weight: u32,
    healthy: AtomicBool,
    latencies: Mutex<VecDeque<u64>>,
    last_check: AtomicU64,
}

impl BackendServer {
    /// Backends start healthy until a probe says otherwise
    pub fn new(address: impl Into<String>, weight: u32) -> Self {
        Self {
            id: String::new(),
            address: address.into(),
            weight,
            healthy: AtomicBool::new(true),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_HISTORY)),
            last_check: AtomicU64::new(0),
        }
    }

    /// A backend added at runtime, kept out of rotation until its first health check passes
    pub fn unverified(address: impl Into<String>, weight: u32) -> Self {
        let server = Self::new(address, weight);
        server.healthy.store(false, Ordering::Release);
        server
    }

    /// Pool-assigned identifier, `server1`, `server2`, ...
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set the health flag and return the previous value
    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub(crate) fn record_latency(&self, latency_ms: u64) {
        let mut latencies = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if latencies.len() == LATENCY_HISTORY {
            latencies.pop_front();
        }
        latencies.push_back(latency_ms);
    }

    /// Recent probe latencies, oldest first
    pub fn latencies(&self) -> Vec<u64> {
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Mean of the recent latency history, `None` before the first probe
    pub fn mean_latency(&self) -> Option<f64> {
        let latencies = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
    }

    /// Epoch milliseconds of the last probe, zero if never probed
    pub fn last_check(&self) -> u64 {
        self.last_check.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.weight,
            healthy: self.is_healthy(),
            mean_latency_ms: self.mean_latency(),
            last_check: self.last_check(),
        }
    }
}

/// Serializable view of one backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
    pub mean_latency_ms: Option<f64>,
    pub last_check: u64,
}

/// The backend set, in insertion order.
///
/// Readers take a cheap snapshot of the list; the list itself only changes
/// when a backend is added or removed.
#[derive(Debug, Default)]
pub struct BackendPool {
    servers: RwLock<Vec<Arc<BackendServer>>>,
    next_id: AtomicUsize,
}

impl BackendPool {
    pub fn new(servers: Vec<BackendServer>) -> Self {
        let pool = Self::default();
        {
            let mut list = pool.servers.write().unwrap_or_else(PoisonError::into_inner);
            for server in servers {
                list.push(Arc::new(pool.assign_id(server)));
            }
        }
        pool
    }

    pub fn from_config(backends: &[BackendConfig]) -> Self {
        Self::new(
            backends
                .iter()
                .map(|b| BackendServer::new(b.address.trim_end_matches('/'), b.weight))
                .collect(),
        )
    }

    fn assign_id(&self, mut server: BackendServer) -> BackendServer {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        server.id = format!("server{}", n);
        server
    }

    /// Current backends, in insertion order
    pub fn servers(&self) -> Vec<Arc<BackendServer>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<String> {
        self.servers().iter().map(|s| s.address.clone()).collect()
    }

    pub fn healthy(&self) -> Vec<Arc<BackendServer>> {
        self.servers().into_iter().filter(|s| s.is_healthy()).collect()
    }

    pub fn healthy_addresses(&self) -> Vec<String> {
        self.servers()
            .iter()
            .filter(|s| s.is_healthy())
            .map(|s| s.address.clone())
            .collect()
    }

    pub fn find(&self, address: &str) -> Option<Arc<BackendServer>> {
        self.servers().into_iter().find(|s| s.address == address)
    }

    /// Register a backend at runtime. The address must be an absolute
    /// http(s) URL and must not be in the pool already.
    pub fn add(&self, server: BackendServer) -> Result<Arc<BackendServer>, PoolError> {
        let mut server = server;
        server.address = server.address.trim_end_matches('/').to_string();
        match reqwest::Url::parse(&server.address) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {}
            _ => {
                return Err(PoolError::Invalid(format!(
                    "{} is not an http(s) URL",
                    server.address
                )))
            }
        }
        if server.weight == 0 {
            return Err(PoolError::Invalid(format!(
                "backend {} has a weight of zero",
                server.address
            )));
        }

        let mut list = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        if list.iter().any(|s| s.address == server.address) {
            return Err(PoolError::Duplicate(server.address));
        }
        let server = Arc::new(self.assign_id(server));
        list.push(server.clone());
        info!("Backend {} added as {}", server.address, server.id);
        Ok(server)
    }

    /// Remove a backend by id. In-flight requests to it complete normally.
    pub fn remove(&self, id: &str) -> Option<Arc<BackendServer>> {
        let mut list = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        let index = list.iter().position(|s| s.id == id)?;
        let server = list.remove(index);
        info!("Backend {} ({}) removed", server.address, server.id);
        Some(server)
    }

    /// Downgrade a backend without waiting for the next probe.
    /// Returns true if it was healthy until now.
    pub fn mark_unhealthy(&self, address: &str) -> bool {
        match self.find(address) {
            Some(server) if server.set_healthy(false) => {
                warn!("Backend {} marked unhealthy after a failed forward", address);
                true
            }
            _ => false,
        }
    }
}

/// Periodic prober for a [`BackendPool`]
pub struct HealthMonitor {
    pool: Arc<BackendPool>,
    config: HealthCheckConfig,
    client: reqwest::Client,
    metrics: Arc<MetricsAggregator>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<BackendPool>,
        config: HealthCheckConfig,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            pool,
            config,
            client: reqwest::Client::new(),
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Probe one backend and update its state. Returns the verdict.
    pub async fn probe(&self, server: &BackendServer) -> bool {
        let url = format!("{}{}", server.address(), self.config.path);
        let started = Instant::now();
        let result = self
            .client
            .get(&url)
            .timeout(self.config.timeout())
            .send()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let healthy = match result {
            Ok(response) if response.status().is_success() => elapsed_ms < self.config.timeout_ms,
            Ok(response) => {
                debug!("Health check {} returned {}", server.address(), response.status());
                false
            }
            Err(e) => {
                debug!("Health check {} failed: {}", server.address(), e);
                false
            }
        };

        server.record_latency(elapsed_ms);
        server.last_check.store(now_millis(), Ordering::Relaxed);
        let was_healthy = server.set_healthy(healthy);

        match (was_healthy, healthy) {
            (true, false) => warn!(
                "Backend {} is now UNHEALTHY ({}ms)",
                server.address(),
                elapsed_ms
            ),
            (false, true) => info!(
                "Backend {} recovered, HEALTHY ({}ms)",
                server.address(),
                elapsed_ms
            ),
            _ => debug!(
                "Health check {}: {} ({}ms)",
                server.address(),
                if healthy { "HEALTHY" } else { "UNHEALTHY" },
                elapsed_ms
            ),
        }
        healthy
    }

    /// Probe every backend concurrently and publish the healthy set
    pub async fn check_all(&self) -> Vec<String> {
        let servers = self.pool.servers();
        join_all(servers.iter().map(|server| self.probe(server))).await;
        self.publish()
    }

    /// Push the pool's current healthy set to the metrics aggregator
    pub fn publish(&self) -> Vec<String> {
        let healthy = self.pool.healthy_addresses();
        self.metrics.record_health(healthy.clone());
        healthy
    }

    /// Add a backend out of rotation and probe it right away
    pub async fn add_backend(&self, address: &str, weight: u32) -> Result<Arc<BackendServer>, PoolError> {
        let server = self.pool.add(BackendServer::unverified(address, weight))?;
        self.metrics.register_backend(server.address());
        self.probe(&server).await;
        self.publish();
        Ok(server)
    }

    /// Drop a backend from the pool. Its historical metrics are kept.
    pub fn remove_backend(&self, id: &str) -> Option<Arc<BackendServer>> {
        let server = self.pool.remove(id)?;
        self.publish();
        Some(server)
    }

    /// Check immediately, then on every interval tick, forever
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Health monitor started: {} backends every {}ms",
            self.pool.len(),
            self.config.interval_ms
        );

        loop {
            ticker.tick().await;
            let healthy = self.check_all().await;
            debug!(
                "Health check complete: {}/{} healthy",
                healthy.len(),
                self.pool.len()
            );
        }
    }
}
