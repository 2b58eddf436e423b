use std::net::SocketAddr;

use chrono::Utc;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

pub fn format_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Derive the client identity for a request.
///
/// The forwarding header is only consulted when the deployment says it sits
/// behind a trusted proxy; its first entry is the original client.
pub fn client_identity(
    forwarded_for: Option<&str>,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        if let Some(first) = forwarded_for
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return first.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
