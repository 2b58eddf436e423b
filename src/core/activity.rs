//! Per-client sliding window of recent request timestamps.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::utils::now_millis;

/// Recent request timestamps of one client, as returned by [`ActivityTracker::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityWindow {
    /// The time the window was observed, in epoch milliseconds
    pub observed_at: u64,
    /// Timestamps within the retention horizon, oldest first
    pub timestamps: Vec<u64>,
}

impl ActivityWindow {
    /// Number of requests within `window_ms` of the observation time
    pub fn count_within(&self, window_ms: u64) -> usize {
        self.timestamps
            .iter()
            .rev()
            .take_while(|ts| self.observed_at.saturating_sub(**ts) <= window_ms)
            .count()
    }
}

#[derive(Debug, Default)]
struct ClientActivity {
    timestamps: VecDeque<u64>,
    suspicious: bool,
}

impl ClientActivity {
    fn prune(&mut self, now: u64, horizon_ms: u64) {
        while self
            .timestamps
            .front()
            .is_some_and(|ts| now.saturating_sub(*ts) > horizon_ms)
        {
            self.timestamps.pop_front();
        }
    }
}

/// Activity tracker.
///
/// Each client lives in its own map slot, so updates for different clients
/// only contend when they hash to the same shard.
#[derive(Debug)]
pub struct ActivityTracker {
    horizon_ms: u64,
    clients: DashMap<String, ClientActivity>,
}

impl ActivityTracker {
    pub fn new(horizon_ms: u64) -> Self {
        Self {
            horizon_ms,
            clients: DashMap::new(),
        }
    }

    /// Record a request from `identity` now and return its pruned window
    pub fn record(&self, identity: &str) -> ActivityWindow {
        self.record_at(identity, now_millis())
    }

    pub fn record_at(&self, identity: &str, now: u64) -> ActivityWindow {
        let mut client = self.clients.entry(identity.to_string()).or_default();
        client.timestamps.push_back(now);
        client.prune(now, self.horizon_ms);

        ActivityWindow {
            observed_at: now,
            timestamps: client.timestamps.iter().copied().collect(),
        }
    }

    /// Mark a client as persistently suspicious until it is evicted
    pub fn mark_suspicious(&self, identity: &str) {
        if let Some(mut client) = self.clients.get_mut(identity) {
            client.suspicious = true;
        }
    }

    pub fn clear_suspicious(&self, identity: &str) {
        if let Some(mut client) = self.clients.get_mut(identity) {
            client.suspicious = false;
        }
    }

    pub fn is_suspicious(&self, identity: &str) -> bool {
        self.clients
            .get(identity)
            .map(|client| client.suspicious)
            .unwrap_or(false)
    }

    /// Drop every client with no activity within `idle_ms`. Returns the evicted identities.
    pub fn evict_idle(&self, now: u64, idle_ms: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        self.clients.retain(|identity, client| {
            client.prune(now, idle_ms);
            if client.timestamps.is_empty() {
                evicted.push(identity.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn suspicious_clients(&self) -> usize {
        self.clients.iter().filter(|client| client.suspicious).count()
    }
}
