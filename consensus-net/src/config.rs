//! Configuration for the consensus networking layer.

use {
    crate::error::{ConsensusNetError, Result},
    serde::{Deserialize, Serialize},
    std::net::{Ipv4Addr, SocketAddr},
};

/// Configuration for the consensus P2P network.
///
/// Controls connection limits, timeouts, rate limits and peer scoring for
/// validator-to-validator message propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusNetConfig {
    /// Local address to bind the consensus listener on.
    /// Default: `0.0.0.0:8900`
    pub bind_addr: SocketAddr,

    /// Maximum number of peers to track.
    pub max_peers: usize,

    /// How long to wait for a send or a sync response before giving up (ms).
    pub message_timeout_ms: u64,

    /// Interval between heartbeats to peers (ms).
    pub heartbeat_interval_ms: u64,

    /// Maximum size of a single serialized envelope in bytes. Votes are a
    /// few hundred bytes; certified batches carry full transaction payloads.
    pub max_message_size: usize,

    /// Seconds a peer can be silent before it is considered disconnected.
    pub peer_timeout_secs: u64,

    /// Maximum number of sync requests in flight.
    pub max_sync_requests: usize,

    /// Certified batches returned per sync response.
    pub sync_batch_limit: u32,

    /// Sync attempts against different peers before giving up.
    pub max_sync_retries: u32,

    /// Size of the inbound message channel buffer.
    pub channel_buffer_size: usize,

    /// Width of the sliding window used for per-peer rate limiting.
    pub rate_limit_interval_secs: u64,

    /// Envelopes accepted from one address per window; the rest are dropped.
    pub max_events_per_interval: usize,

    /// Peers whose score falls to or below this value are banned.
    pub ban_score_threshold: i64,
}

impl Default for ConsensusNetConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8900)),
            max_peers: 200,
            message_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            max_message_size: 8 * 1024 * 1024,
            peer_timeout_secs: 30,
            max_sync_requests: 4,
            sync_batch_limit: 64,
            max_sync_retries: 5,
            channel_buffer_size: 10_000,
            rate_limit_interval_secs: 1,
            max_events_per_interval: 1_000,
            ban_score_threshold: 0,
        }
    }
}

impl ConsensusNetConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            max_peers: 10,
            message_timeout_ms: 1_000,
            heartbeat_interval_ms: 200,
            peer_timeout_secs: 5,
            channel_buffer_size: 1_000,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(ConsensusNetError::InvalidConfig(format!(
                "max_message_size {} must fit a u32 frame header",
                self.max_message_size
            )));
        }
        if self.max_peers == 0 {
            return Err(ConsensusNetError::InvalidConfig(
                "max_peers must be positive".to_string(),
            ));
        }
        if self.sync_batch_limit == 0 {
            return Err(ConsensusNetError::InvalidConfig(
                "sync_batch_limit must be positive".to_string(),
            ));
        }
        if self.rate_limit_interval_secs == 0 || self.max_events_per_interval == 0 {
            return Err(ConsensusNetError::InvalidConfig(
                "rate limit window and budget must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
