//! Configuration for the Kestrel P2P layer and sync session.

use kestrel_core::constants::{
    Network, INITIAL_RATE_FLOOR, MIN_PEER_VERSION, MIN_RATE_FLOOR, NODE_NETWORK,
    PROTOCOL_VERSION, RATE_BACKOFF_FACTOR, RATE_GRACE_SECS, RESPONSE_TIMEOUT_SECS, USER_AGENT,
};
use std::time::Duration;

/// Configuration for outbound connections and the version handshake.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Which chain we speak (selects magic, ports, PoW limit).
    pub network: Network,
    /// Protocol version we advertise.
    pub protocol_version: u32,
    /// Minimum protocol version a peer must negotiate.
    pub min_peer_version: u32,
    /// Service bits a peer must advertise.
    pub required_services: u64,
    /// User agent sent in our `version`.
    pub user_agent: String,
    /// Timeout for an outbound dial attempt.
    pub dial_timeout: Duration,
    /// Timeout for the whole version handshake.
    pub handshake_timeout: Duration,
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            protocol_version: PROTOCOL_VERSION,
            min_peer_version: MIN_PEER_VERSION,
            required_services: NODE_NETWORK,
            user_agent: USER_AGENT.to_string(),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(60),
        }
    }
}

impl NetworkConfig {
    /// Preset for a given network.
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }
}

/// Configuration for the header-sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Starting per-peer throughput floor, headers per second.
    pub initial_floor: f64,
    /// Multiplier applied to the floor on each peer failure.
    pub backoff_factor: f64,
    /// The floor never drops below this.
    pub min_floor: f64,
    /// A channel younger than this is never judged against the floor.
    pub grace: Duration,
    /// How long a peer may take to answer one `get-headers`.
    pub response_timeout: Duration,
    /// How many concurrent outbound sync attempts to run.
    pub parallel_outbound: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_floor: INITIAL_RATE_FLOOR,
            backoff_factor: RATE_BACKOFF_FACTOR,
            min_floor: MIN_RATE_FLOOR,
            grace: Duration::from_secs(RATE_GRACE_SECS),
            response_timeout: Duration::from_secs(RESPONSE_TIMEOUT_SECS),
            parallel_outbound: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_config_is_mainnet() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.network, Network::Mainnet);
        assert_eq!(cfg.protocol_version, PROTOCOL_VERSION);
        assert_eq!(cfg.required_services, NODE_NETWORK);
    }

    #[test]
    fn for_network_overrides_only_network() {
        let cfg = NetworkConfig::for_network(Network::Regtest);
        assert_eq!(cfg.network, Network::Regtest);
        assert_eq!(cfg.user_agent, USER_AGENT);
    }

    #[test]
    fn default_sync_config_matches_constants() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.initial_floor, INITIAL_RATE_FLOOR);
        assert_eq!(cfg.backoff_factor, RATE_BACKOFF_FACTOR);
        assert!(cfg.backoff_factor > 0.0 && cfg.backoff_factor < 1.0);
        assert_eq!(cfg.parallel_outbound, 1);
    }
}
