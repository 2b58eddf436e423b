//! Backend selection over the healthy subset of the pool.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;

use crate::core::health::{BackendPool, BackendServer};
use crate::models::RoutingPolicy;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No healthy servers available")]
    NoHealthyServers,
}

/// Picks a backend for each request according to the configured policy.
///
/// Unhealthy backends are never returned; when none are healthy the caller
/// gets [`RoutingError::NoHealthyServers`].
pub struct Router {
    pool: Arc<BackendPool>,
    policy: RoutingPolicy,
    cursor: AtomicUsize,
}

impl Router {
    pub fn new(pool: Arc<BackendPool>, policy: RoutingPolicy) -> Self {
        Self {
            pool,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    pub fn select_backend(&self) -> Result<Arc<BackendServer>, RoutingError> {
        match self.policy {
            RoutingPolicy::RoundRobin => self.select_round_robin(),
            RoutingPolicy::WeightedRandom => self.select_weighted_random(),
            RoutingPolicy::LatencyRanked => self.select_latency_ranked(),
        }
    }

    /// The cursor walks the full pool, skipping unhealthy entries, so a
    /// backend dropping out does not restart the cycle.
    fn select_round_robin(&self) -> Result<Arc<BackendServer>, RoutingError> {
        let servers = self.pool.servers();
        for _ in 0..servers.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % servers.len();
            if servers[index].is_healthy() {
                return Ok(servers[index].clone());
            }
        }
        Err(RoutingError::NoHealthyServers)
    }

    fn select_weighted_random(&self) -> Result<Arc<BackendServer>, RoutingError> {
        let healthy = self.pool.healthy();
        let total_weight: u64 = healthy.iter().map(|s| u64::from(s.weight())).sum();
        if total_weight == 0 {
            return Err(RoutingError::NoHealthyServers);
        }

        let draw = rand::thread_rng().gen_range(0..total_weight);
        let mut cumulative = 0u64;
        for server in &healthy {
            cumulative += u64::from(server.weight());
            if draw < cumulative {
                return Ok(server.clone());
            }
        }
        healthy.last().cloned().ok_or(RoutingError::NoHealthyServers)
    }

    /// Lowest mean probe latency first; backends without history sort last
    fn select_latency_ranked(&self) -> Result<Arc<BackendServer>, RoutingError> {
        let mut ranked: Vec<(Option<f64>, Arc<BackendServer>)> = self
            .pool
            .healthy()
            .into_iter()
            .map(|s| (s.mean_latency(), s))
            .collect();
        // Stable, so ties keep configuration order
        ranked.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => a.partial_cmp(b).unwrap_or(CmpOrdering::Equal),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        });
        ranked
            .into_iter()
            .next()
            .map(|(_, server)| server)
            .ok_or(RoutingError::NoHealthyServers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool(weights: &[u32]) -> Arc<BackendPool> {
        Arc::new(BackendPool::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| BackendServer::new(format!("http://backend-{}", i + 1), *w))
                .collect(),
        ))
    }

    fn picks(router: &Router, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| router.select_backend().unwrap().address().to_string())
            .collect()
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let router = Router::new(pool(&[1, 1, 1, 1]), RoutingPolicy::RoundRobin);
        let expected: Vec<String> = (0..8)
            .map(|i| format!("http://backend-{}", i % 4 + 1))
            .collect();
        assert_eq!(picks(&router, 8), expected);
    }

    #[test]
    fn test_round_robin_skips_unhealthy_without_reset() {
        let pool = pool(&[1, 1, 1, 1]);
        let router = Router::new(pool.clone(), RoutingPolicy::RoundRobin);
        assert_eq!(picks(&router, 1), vec!["http://backend-1"]);

        pool.mark_unhealthy("http://backend-2");
        assert_eq!(
            picks(&router, 4),
            vec![
                "http://backend-3",
                "http://backend-4",
                "http://backend-1",
                "http://backend-3",
            ]
        );
    }

    #[test]
    fn test_no_healthy_servers() {
        let pool = pool(&[1, 1]);
        pool.mark_unhealthy("http://backend-1");
        pool.mark_unhealthy("http://backend-2");
        for policy in [
            RoutingPolicy::RoundRobin,
            RoutingPolicy::WeightedRandom,
            RoutingPolicy::LatencyRanked,
        ] {
            let router = Router::new(pool.clone(), policy);
            assert_eq!(router.select_backend().unwrap_err(), RoutingError::NoHealthyServers);
        }
        assert_eq!(
            Router::new(Arc::new(BackendPool::default()), RoutingPolicy::RoundRobin)
                .select_backend()
                .unwrap_err(),
            RoutingError::NoHealthyServers
        );
    }

    #[test]
    fn test_weighted_random_distribution() {
        let pool = pool(&[1, 3, 1]);
        pool.mark_unhealthy("http://backend-3");
        let router = Router::new(pool, RoutingPolicy::WeightedRandom);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for address in picks(&router, 4_000) {
            *counts.entry(address).or_default() += 1;
        }
        assert!(!counts.contains_key("http://backend-3"));
        let light = counts["http://backend-1"] as f64;
        let heavy = counts["http://backend-2"] as f64;
        let ratio = heavy / light;
        assert!(ratio > 2.0 && ratio < 4.5, "ratio {}", ratio);
    }

    #[test]
    fn test_latency_ranked_picks_fastest() {
        let pool = pool(&[1, 1, 1, 1]);
        for (server, latency) in pool.servers().iter().zip([50, 10, 30]) {
            server.record_latency(latency);
        }
        let router = Router::new(pool.clone(), RoutingPolicy::LatencyRanked);
        assert_eq!(picks(&router, 2), vec!["http://backend-2", "http://backend-2"]);

        pool.mark_unhealthy("http://backend-2");
        assert_eq!(picks(&router, 1), vec!["http://backend-3"]);

        // A backend without history is still eligible
        pool.mark_unhealthy("http://backend-1");
        pool.mark_unhealthy("http://backend-3");
        assert_eq!(picks(&router, 1), vec!["http://backend-4"]);
    }
}
