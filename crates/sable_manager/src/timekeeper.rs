//! Stability-timestamp aggregation, persistence, and fan-out.
//!
//! Runs only while this node is leader. Stream workers push raw per-vbucket
//! reports into the keeper's inbound channel; the keeper merges them into an
//! in-memory checkpoint and, gated by [`PersistPolicy`], submits the merged
//! stream timestamp through the coordinator for majority commit. The apply
//! path then merges it into the durable checkpoint and forwards it to the
//! per-stream broadcast channels, so subscribers only ever observe
//! merged-and-committed values.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sable_core::{OpCode, StabilityCheckpoint, StabilityTimestamp, StreamId, TsVbuuid};

use crate::coordinator::Coordinator;
use crate::repo::{MetadataRepo, STABILITY_TIMESTAMPS_KEY};

/// One raw report routed from a stream worker to the keeper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimestampReport {
    pub stream_id: StreamId,
    pub bucket: String,
    pub ts: TsVbuuid,
}

/// Time-based debouncing of checkpoint persistence.
#[derive(Clone, Copy, Debug)]
pub struct PersistPolicy {
    pub min_interval: Duration,
}

impl PersistPolicy {
    /// Persist immediately on the very first timestamp ever observed, then
    /// only once `min_interval` has elapsed since the last successful
    /// persist.
    pub fn should_persist(&self, last_persist: Instant, now: Instant, first: bool) -> bool {
        first || now.saturating_duration_since(last_persist) >= self.min_interval
    }
}

/// Per-stream broadcast of merged-and-committed stability timestamps.
///
/// Channels are bounded; when a subscriber is slow, newer timestamps for
/// that stream are dropped rather than blocking the apply path
/// (at-most-latest delivery, not at-least-once).
pub struct TimestampFanout {
    capacity: usize,
    senders: Mutex<HashMap<StreamId, mpsc::Sender<StabilityTimestamp>>>,
}

impl TimestampFanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Open the broadcast channel for one stream. Subscribing again replaces
    /// the previous subscriber's channel.
    pub fn subscribe(&self, stream_id: StreamId) -> mpsc::Receiver<StabilityTimestamp> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.lock().unwrap().insert(stream_id, tx);
        rx
    }

    pub fn publish(&self, timestamp: &StabilityTimestamp) {
        let senders = self.senders.lock().unwrap();
        let Some(tx) = senders.get(&timestamp.stream_id) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(timestamp.clone()) {
            debug!(
                stream = %timestamp.stream_id,
                bucket = %timestamp.bucket,
                "timestamp channel full, dropping broadcast"
            );
        }
    }
}

/// Leader-only aggregation loop handle.
pub struct TimestampKeeper {
    inbound: mpsc::Sender<TimestampReport>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TimestampKeeper {
    /// Seed the in-memory checkpoint from the repository and start the
    /// aggregation loop.
    pub fn start(
        repo: Arc<MetadataRepo>,
        coordinator: Arc<Coordinator>,
        persist_interval_nanos: Arc<AtomicU64>,
        report_capacity: usize,
    ) -> Self {
        let (inbound, rx) = mpsc::channel(report_capacity.max(1));
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_keeper(
            repo,
            coordinator,
            persist_interval_nanos,
            rx,
            stop_rx,
        ));
        Self {
            inbound,
            stop,
            task,
        }
    }

    /// Channel stream workers push raw reports into.
    pub fn inbound(&self) -> mpsc::Sender<TimestampReport> {
        self.inbound.clone()
    }

    /// Stop the loop immediately, discarding in-memory merges newer than the
    /// last successful persist. This bounds data loss on a role transition
    /// to at most one persist interval.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run_keeper(
    repo: Arc<MetadataRepo>,
    coordinator: Arc<Coordinator>,
    persist_interval_nanos: Arc<AtomicU64>,
    mut reports: mpsc::Receiver<TimestampReport>,
    mut stop: watch::Receiver<bool>,
) {
    let mut checkpoint = match repo.get_stability_checkpoint() {
        Ok(checkpoint) => checkpoint,
        Err(err) => {
            warn!(error = %err, "cannot read stability checkpoint, starting fresh");
            StabilityCheckpoint::new()
        }
    };
    // Persist the very first observation immediately so a checkpoint exists
    // as soon as possible after the first stream opens.
    let mut first = checkpoint.is_empty();
    let mut last_persist = Instant::now();
    let mut dirty: BTreeSet<(StreamId, String)> = BTreeSet::new();

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!("timestamp keeper stopping");
                    return;
                }
            }
            maybe = reports.recv() => {
                let Some(report) = maybe else {
                    debug!("report channel closed, timestamp keeper exiting");
                    return;
                };
                if checkpoint.merge_report(report.stream_id, &report.bucket, report.ts) {
                    dirty.insert((report.stream_id, report.bucket));
                }
                if dirty.is_empty() {
                    continue;
                }
                let policy = PersistPolicy {
                    min_interval: Duration::from_nanos(
                        persist_interval_nanos.load(Ordering::Relaxed),
                    ),
                };
                if !policy.should_persist(last_persist, Instant::now(), first) {
                    continue;
                }
                if flush_dirty(&checkpoint, &coordinator, &mut dirty).await {
                    first = false;
                    last_persist = Instant::now();
                }
            }
        }
    }
}

/// Submit each dirty stream timestamp for majority commit. Returns true when
/// at least one submission succeeded; failed streams stay dirty and are
/// retried on the next persist boundary, never escalated.
async fn flush_dirty(
    checkpoint: &StabilityCheckpoint,
    coordinator: &Coordinator,
    dirty: &mut BTreeSet<(StreamId, String)>,
) -> bool {
    let mut persisted_any = false;
    let pending: Vec<(StreamId, String)> = dirty.iter().cloned().collect();
    for (stream_id, bucket) in pending {
        let Some(timestamp) = checkpoint.timestamp(stream_id, &bucket) else {
            dirty.remove(&(stream_id, bucket));
            continue;
        };
        let content = match serde_json::to_vec(timestamp) {
            Ok(content) => content,
            Err(err) => {
                warn!(stream = %stream_id, bucket = %bucket, error = %err,
                    "cannot serialize stability timestamp, dropping");
                dirty.remove(&(stream_id, bucket));
                continue;
            }
        };
        match coordinator
            .new_request(
                OpCode::NotifyTimestamp,
                STABILITY_TIMESTAMPS_KEY.to_string(),
                content,
            )
            .await
        {
            Ok(()) => {
                debug!(stream = %stream_id, bucket = %bucket,
                    "stability timestamp durably committed");
                dirty.remove(&(stream_id, bucket));
                persisted_any = true;
            }
            Err(err) => {
                warn!(stream = %stream_id, bucket = %bucket, error = %err,
                    "stability timestamp submit failed, will retry");
            }
        }
    }
    persisted_any
}
