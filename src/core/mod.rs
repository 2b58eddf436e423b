//! Core functionality of the load balancer.
//!
//! This module contains the admission pipeline (activity tracking, feature
//! extraction, anomaly detection, rate limiting), the backend side
//! (health monitoring, routing, proxying) and the metrics aggregator.

pub mod activity;
pub mod analytics;
pub mod ddos_detector;
pub mod engine;
pub mod features;
pub mod geo;
pub mod health;
pub mod persistence;
pub mod proxy;
pub mod rate_limiter;
pub mod routing;
pub mod store;

pub use activity::ActivityTracker;
pub use analytics::{MetricsAggregator, MetricsSnapshot};
pub use ddos_detector::DdosDetector;
pub use engine::Engine;
pub use features::{FeatureExtractor, RequestInfo, TrafficFeatures};
pub use health::{BackendPool, BackendServer, HealthMonitor};
pub use persistence::SnapshotFlusher;
pub use proxy::{ProxyForwarder, ProxyRequest};
pub use rate_limiter::RateLimiter;
pub use routing::Router;
pub use store::{CounterStore, MemoryStore, RedisStore};
