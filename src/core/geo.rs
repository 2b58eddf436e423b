//! Best-effort country resolution for client identities.

use std::net::IpAddr;

use ipnet::IpNet;
use log::warn;

use crate::models::GeoConfig;

/// Country code reported when an address cannot be resolved
pub const UNKNOWN_COUNTRY: &str = "ZZ";

/// Static CIDR → country table.
///
/// The most specific matching range wins, so operators can carve
/// exceptions out of broader entries.
#[derive(Debug, Clone, Default)]
pub struct GeoResolver {
    ranges: Vec<(IpNet, String)>,
}

impl GeoResolver {
    pub fn from_config(config: &GeoConfig) -> Self {
        let mut ranges: Vec<(IpNet, String)> = config
            .ranges
            .iter()
            .filter_map(|range| match range.cidr.parse::<IpNet>() {
                Ok(net) => Some((net, range.country.to_ascii_uppercase())),
                Err(e) => {
                    warn!("Ignoring invalid geo range {}: {}", range.cidr, e);
                    None
                }
            })
            .collect();
        ranges.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Self { ranges }
    }

    /// Resolve an identity to an ISO country code, `"ZZ"` when unknown
    pub fn lookup(&self, identity: &str) -> String {
        let Ok(ip) = identity.parse::<IpAddr>() else {
            return UNKNOWN_COUNTRY.to_string();
        };
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };

        self.ranges
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, country)| country.clone())
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
    }
}
