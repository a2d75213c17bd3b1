//! Configuration for the driftmesh core
//!
//! Plain value structs with sensible defaults. Transports carry their own
//! configuration in their crates; this module only covers the core engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Ttl;

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Tunables for the packet model, dedup cache, and transport manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Upper bound on packet payloads in bytes
    pub max_payload: usize,
    /// TTL stamped on newly created packets
    pub default_ttl: Ttl,
    /// How long a packet id is remembered for deduplication
    pub dedup_window: Duration,
    /// Maintenance loop cadence in the transport manager
    pub maintenance_interval: Duration,
    /// Minimum age before a pending packet is retried
    pub pending_retry_after: Duration,
    /// Retries before a pending packet is dropped
    pub max_pending_retries: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_payload: 64 * 1024,
            default_ttl: Ttl::DEFAULT,
            dedup_window: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(5),
            pending_retry_after: Duration::from_secs(5),
            max_pending_retries: 3,
        }
    }
}

// ----------------------------------------------------------------------------
// Pathfinder Configuration
// ----------------------------------------------------------------------------

/// Tunables for the routing engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathfinderConfig {
    /// Lifetime of forwarding and neighbor entries
    pub path_expiry: Duration,
    /// Cadence of our own path announcements
    pub announce_interval: Duration,
    /// Cadence of expired-entry purges
    pub cleanup_interval: Duration,
    /// Cadence of link reliability recomputation
    pub metrics_interval: Duration,
    /// Samples kept per link for reliability and latency
    pub history_window: usize,
    /// Samples considered when recomputing recent reliability
    pub recent_samples: usize,
}

impl Default for PathfinderConfig {
    fn default() -> Self {
        Self {
            path_expiry: Duration::from_secs(300),
            announce_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(10),
            history_window: 100,
            recent_samples: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// Handshake Configuration
// ----------------------------------------------------------------------------

/// Tunables for two-party key agreement and secure-link lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Overall deadline for a three-message handshake
    pub handshake_timeout: Duration,
    /// Age after which a link must be rekeyed
    pub rekey_after: Duration,
    /// Message count after which a link must be rekeyed
    pub rekey_after_messages: u64,
    /// Age after which a link is considered dead
    pub max_link_age: Duration,
    /// Cadence of the background rekey sweep
    pub rekey_check_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            rekey_after: Duration::from_secs(3600),
            rekey_after_messages: 10_000,
            max_link_age: Duration::from_secs(24 * 3600),
            rekey_check_interval: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let mesh = MeshConfig::default();
        assert_eq!(mesh.default_ttl.value(), 8);
        assert_eq!(mesh.dedup_window, Duration::from_secs(60));
        assert_eq!(mesh.max_pending_retries, 3);

        let hs = HandshakeConfig::default();
        assert_eq!(hs.handshake_timeout, Duration::from_secs(30));
        assert_eq!(hs.rekey_after_messages, 10_000);

        let pf = PathfinderConfig::default();
        assert_eq!(pf.path_expiry, Duration::from_secs(300));
        assert_eq!(pf.history_window, 100);
    }
}
