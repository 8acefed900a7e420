//! Contract for the upstream mutation-feed collaborator.
//!
//! The wire protocol used to receive mutation streams is out of scope; the
//! stream manager only needs to open per-`(stream, bucket)` subscriptions,
//! receive raw vbucket timestamp reports, and react to control signals that
//! ask for parts of the feed to be reopened.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::timestamp::{StabilityTimestamp, StreamId, TsVbuuid};

/// Control signals emitted by an open stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamControl {
    /// The upstream producer for these vbuckets restarted; their feed must
    /// be reopened from the last durable checkpoint.
    RestartVbuckets { bucket: String, vbuckets: Vec<u16> },
}

/// Channels backing one open stream subscription.
pub struct StreamHandle {
    /// Raw per-vbucket timestamp reports as the stream advances.
    pub reports: mpsc::Receiver<TsVbuuid>,
    /// Out-of-band control signals.
    pub control: mpsc::Receiver<StreamControl>,
}

/// Upstream data-change feed consumed by the stream manager.
#[async_trait]
pub trait MutationSource: Send + Sync + 'static {
    /// Open one logical stream over `bucket`, resuming each listed vbucket
    /// from its entry in `start` (vbuckets without an entry start from
    /// scratch).
    async fn open_stream(
        &self,
        stream_id: StreamId,
        bucket: &str,
        vbuckets: &[u16],
        start: StabilityTimestamp,
    ) -> anyhow::Result<StreamHandle>;

    /// Tear down the subscription for `(stream_id, bucket)`. Closing an
    /// unknown stream is not an error.
    async fn close_stream(&self, stream_id: StreamId, bucket: &str) -> anyhow::Result<()>;
}
