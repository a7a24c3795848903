//! Engine timing and flow-control settings. All durations are in ticks and fixed at construction.

use serde::{Deserialize, Serialize};

/// Engine configuration. Defaults assume the host ticks roughly every 25 ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Ticks between handshake attempts for an offline friend (default 40).
    pub handshake_retry_ticks: u64,
    /// Ticks a handshake may stay unanswered before the friend falls back to offline (default 200).
    pub handshake_timeout_ticks: u64,
    /// Ticks between resends of a pending friend request (default 200).
    pub request_retry_ticks: u64,
    /// Ticks of outbound silence before a keepalive is sent (default 160).
    pub ping_interval_ticks: u64,
    /// Ticks of inbound silence before an online friend is considered gone (default 400).
    pub connection_timeout_ticks: u64,
    /// Unacknowledged file chunks allowed per sending slot (default 16).
    pub max_outstanding_chunks: u32,
}

fn default_handshake_retry_ticks() -> u64 {
    40
}
fn default_handshake_timeout_ticks() -> u64 {
    200
}
fn default_request_retry_ticks() -> u64 {
    200
}
fn default_ping_interval_ticks() -> u64 {
    160
}
fn default_connection_timeout_ticks() -> u64 {
    400
}
fn default_max_outstanding_chunks() -> u32 {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_retry_ticks: default_handshake_retry_ticks(),
            handshake_timeout_ticks: default_handshake_timeout_ticks(),
            request_retry_ticks: default_request_retry_ticks(),
            ping_interval_ticks: default_ping_interval_ticks(),
            connection_timeout_ticks: default_connection_timeout_ticks(),
            max_outstanding_chunks: default_max_outstanding_chunks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_ordered() {
        let c = EngineConfig::default();
        assert!(c.ping_interval_ticks < c.connection_timeout_ticks);
        assert!(c.handshake_retry_ticks < c.handshake_timeout_ticks);
        assert!(c.max_outstanding_chunks > 0);
    }
}
