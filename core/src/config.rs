//! Synchronization core configuration

use std::time::Duration;

/// Tunables for discovery, heartbeats, and reconnection. The defaults are
/// the fixed values the protocol was designed around; everything is
/// overridable for tests and unusual deployments.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of live peer connections to hold.
    pub max_connections: usize,
    /// Per-candidate dial timeout during discovery and accept handling.
    pub handshake_timeout: Duration,
    /// Interval between HEARTBEAT broadcasts while connected.
    pub heartbeat_interval: Duration,
    /// Overall deadline for one discovery race across the candidate range.
    pub discovery_timeout: Duration,
    /// Bounded reconnection attempts after losing the broker.
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Local endpoint creation attempts before degrading to local-only mode.
    /// The peer id is regenerated on each attempt to dodge collisions.
    pub endpoint_retries: u32,
    /// Settle time between tearing down one session and starting the next.
    pub cleanup_delay: Duration,
    /// Peer-id suffixes are probed in `1..=peer_suffix_max`.
    pub peer_suffix_max: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(8),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            endpoint_retries: 3,
            cleanup_delay: Duration::from_millis(200),
            peer_suffix_max: crate::room::PEER_SUFFIX_MAX,
        }
    }
}

impl SyncConfig {
    /// Small-and-fast settings for tests: a narrow candidate range and
    /// short timers so discovery races settle in milliseconds.
    pub fn fast(peer_suffix_max: u16) -> Self {
        Self {
            handshake_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(200),
            discovery_timeout: Duration::from_millis(750),
            reconnect_delay: Duration::from_millis(50),
            cleanup_delay: Duration::from_millis(20),
            peer_suffix_max,
            ..Self::default()
        }
    }
}
