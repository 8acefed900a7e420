//! Manager configuration.

use std::time::Duration;

/// Tunables for the index manager and its leader-only services.
#[derive(Clone, Copy, Debug)]
pub struct ManagerConfig {
    /// Minimum spacing between durable stability-timestamp persists.
    ///
    /// The very first timestamp observed for the cluster is always persisted
    /// immediately; afterwards this bounds consensus write amplification
    /// against durability lag.
    pub timestamp_persist_interval: Duration,
    /// Upper bound on one coordinator request (propose + local apply).
    pub request_timeout: Duration,
    /// Capacity of each per-stream stability-timestamp broadcast channel.
    /// When a subscriber falls behind, newer timestamps for that stream are
    /// dropped rather than blocking the aggregation loop.
    pub timestamp_channel_capacity: usize,
    /// Capacity of the stream-worker to timestamp-keeper report channel.
    pub report_channel_capacity: usize,
    /// Capacity of each event listener's delivery channel.
    pub event_channel_capacity: usize,
    /// Number of vbuckets per bucket keyspace.
    pub num_vbuckets: u16,
    /// Delay between attempts to reopen a failed stream subscription.
    pub stream_reopen_backoff: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timestamp_persist_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            timestamp_channel_capacity: 64,
            report_channel_capacity: 256,
            event_channel_capacity: 16,
            num_vbuckets: 64,
            stream_reopen_backoff: Duration::from_millis(500),
        }
    }
}

impl ManagerConfig {
    /// All vbucket ids covered by one bucket under this configuration.
    pub fn vbuckets(&self) -> Vec<u16> {
        (0..self.num_vbuckets).collect()
    }
}
