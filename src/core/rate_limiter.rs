//! Rate limiting implementation for the load balancer.
//!
//! Each client gets a quota of points per window, one point per request.
//! Once the quota is exhausted the client is blocked for the cooldown and
//! every attempt fails immediately with the remaining block time. Counters
//! live in a [`CounterStore`], so the same logic runs in memory or against
//! Redis.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use crate::core::store::{CounterStore, StoreError};
use crate::models::{FailurePolicy, RateLimitConfig, RateLimitPolicy};
use crate::utils::format_key;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    ExceededLimit { retry_after_ms: u64 },
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Rate limiter over a shared counter store
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    store_timeout: Duration,
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    /// Create a new rate limiter instance
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: RateLimitConfig,
        store_timeout: Duration,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            config,
            store_timeout,
            failure_policy,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one point for `identity`.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the request should be allowed
    /// * `Err(RateLimitError::ExceededLimit)` if the quota is exhausted or the client is blocked
    /// * `Err(RateLimitError::StoreUnavailable)` if the store failed and the policy is fail-closed
    pub async fn consume(&self, identity: &str) -> Result<(), RateLimitError> {
        let result = match tokio::time::timeout(self.store_timeout, self.try_consume(identity)).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::StoreUnavailable(StoreError::Timeout)),
        };

        match result {
            Ok(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(())
            }
            Err(RateLimitError::StoreUnavailable(e)) => {
                ::metrics::increment_counter!("rate_limiter_store_failures");
                match self.failure_policy {
                    FailurePolicy::Open => {
                        warn!("Rate limiter store degraded, failing open for {}: {}", identity, e);
                        Ok(())
                    }
                    FailurePolicy::Closed => {
                        warn!("Rate limiter store degraded, failing closed for {}: {}", identity, e);
                        Err(RateLimitError::StoreUnavailable(e))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the delay to apply before letting the request through.
    ///
    /// The points counter is never reset early: it lives until its window
    /// ends, so a request that raced past the block marker check still sees
    /// the exhausted count and is rejected.
    async fn try_consume(&self, identity: &str) -> Result<Duration, RateLimitError> {
        let points_key = format_key(&self.config.key_prefix, identity);
        let block_key = format_key(&points_key, "block");

        if let Some(remaining) = self.store.ttl_ms(&block_key).await? {
            return Err(RateLimitError::ExceededLimit {
                retry_after_ms: remaining,
            });
        }

        let consumed = self
            .store
            .incr(&points_key, 1, self.config.duration())
            .await?;
        let points = i64::from(self.config.points);

        if consumed > points {
            let retry_after_ms = if self.config.block_duration_ms > 0 {
                let placed = self
                    .store
                    .set_if_absent(&block_key, 1, self.config.block_duration())
                    .await?;
                if placed {
                    self.config.block_duration_ms
                } else {
                    self.store
                        .ttl_ms(&block_key)
                        .await?
                        .unwrap_or(self.config.block_duration_ms)
                }
            } else {
                self.store.ttl_ms(&points_key).await?.unwrap_or(0)
            };
            debug!("Rate limit exceeded for {} ({} > {})", identity, consumed, points);
            return Err(RateLimitError::ExceededLimit { retry_after_ms });
        }

        match self.config.policy {
            RateLimitPolicy::Burst => Ok(Duration::ZERO),
            RateLimitPolicy::Even => {
                let window_left = self.store.ttl_ms(&points_key).await?.unwrap_or(0);
                let remaining_points = (points - consumed).max(0) as u64;
                let delay = window_left / (remaining_points + 2);
                Ok(Duration::from_millis(delay.min(self.config.duration_ms)))
            }
        }
    }
}
