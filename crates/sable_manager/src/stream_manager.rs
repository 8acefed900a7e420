//! Supervision of open mutation streams while this node is leader.
//!
//! One worker task per logical `(stream, bucket)` subscription: it routes
//! raw vbucket reports into the timestamp keeper and reacts to control
//! signals from the feed. Reopens always resume from the last durably known
//! checkpoint, never from scratch, so a producer restart cannot replay below
//! or skip past what has been checkpointed as consumed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sable_core::{
    MutationSource, StabilityTimestamp, StreamControl, StreamHandle, StreamId,
};

use crate::error::MetaError;
use crate::repo::MetadataRepo;
use crate::timekeeper::TimestampReport;

pub struct StreamManager {
    source: Arc<dyn MutationSource>,
    repo: Arc<MetadataRepo>,
    reports: mpsc::Sender<TimestampReport>,
    vbuckets: Vec<u16>,
    reopen_backoff: Duration,
    stop: watch::Sender<bool>,
    workers: Mutex<WorkerSet>,
    closed: AtomicBool,
}

/// Worker tasks plus the `(stream, bucket)` pairs they serve, so repeated
/// topology scans never double-subscribe a pair.
#[derive(Default)]
struct WorkerSet {
    tasks: Vec<JoinHandle<()>>,
    open: BTreeSet<(StreamId, String)>,
}

impl StreamManager {
    pub fn new(
        source: Arc<dyn MutationSource>,
        repo: Arc<MetadataRepo>,
        reports: mpsc::Sender<TimestampReport>,
        vbuckets: Vec<u16>,
        reopen_backoff: Duration,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            source,
            repo,
            reports,
            vbuckets,
            reopen_backoff,
            stop,
            workers: Mutex::new(WorkerSet::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open one logical stream per `(stream, bucket)` pair referenced by the
    /// current topology and start routing reports to the keeper.
    ///
    /// Invoked again whenever a topology update commits while this node is
    /// leader; pairs that already have a worker are left alone.
    pub async fn start_handling_topology_change(&self) -> Result<(), MetaError> {
        let Some(global) = self.repo.get_global_topology()? else {
            debug!("no global topology, no streams to open");
            return Ok(());
        };

        let mut workers = self.workers.lock().await;
        for key in &global.topology_keys {
            let Some(topology) = self.repo.get_topology_by_key(key)? else {
                // Orphaned key; the cleanup path owns removing it.
                warn!(key = %key, "global topology references missing record, skipping");
                continue;
            };
            for stream_id in topology.streams() {
                if !workers.open.insert((stream_id, topology.bucket.clone())) {
                    continue;
                }
                let worker = StreamWorker {
                    source: Arc::clone(&self.source),
                    repo: Arc::clone(&self.repo),
                    reports: self.reports.clone(),
                    stream_id,
                    bucket: topology.bucket.clone(),
                    vbuckets: self.vbuckets.clone(),
                    reopen_backoff: self.reopen_backoff,
                    stop: self.stop.subscribe(),
                };
                info!(stream = %stream_id, bucket = %topology.bucket, "opening mutation stream");
                workers.tasks.push(tokio::spawn(worker.run()));
            }
        }
        Ok(())
    }

    /// Stop all workers and release their subscriptions. Safe to call more
    /// than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop.send(true);
        let mut workers = self.workers.lock().await;
        for worker in workers.tasks.drain(..) {
            let _ = worker.await;
        }
        workers.open.clear();
        debug!("stream manager closed");
    }
}

struct StreamWorker {
    source: Arc<dyn MutationSource>,
    repo: Arc<MetadataRepo>,
    reports: mpsc::Sender<TimestampReport>,
    stream_id: StreamId,
    bucket: String,
    vbuckets: Vec<u16>,
    reopen_backoff: Duration,
    stop: watch::Receiver<bool>,
}

impl StreamWorker {
    async fn run(mut self) {
        let Some(mut handle) = self.open_from_checkpoint().await else {
            return;
        };
        let mut control_open = true;

        loop {
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        let _ = self.source.close_stream(self.stream_id, &self.bucket).await;
                        return;
                    }
                }
                maybe = handle.reports.recv() => match maybe {
                    Some(report) => {
                        // Backpressure from the keeper is fine here; only
                        // this stream's worker blocks.
                        if self.reports.send(TimestampReport {
                            stream_id: self.stream_id,
                            bucket: self.bucket.clone(),
                            ts: report,
                        }).await.is_err() {
                            let _ = self.source.close_stream(self.stream_id, &self.bucket).await;
                            return;
                        }
                    }
                    None => {
                        warn!(stream = %self.stream_id, bucket = %self.bucket,
                            "mutation feed ended, reopening from checkpoint");
                        let Some(reopened) = self.reopen().await else { return; };
                        handle = reopened;
                        control_open = true;
                    }
                },
                maybe = handle.control.recv(), if control_open => match maybe {
                    Some(StreamControl::RestartVbuckets { bucket, vbuckets }) => {
                        info!(stream = %self.stream_id, bucket = %bucket, ?vbuckets,
                            "restart requested, reopening from checkpoint");
                        let Some(reopened) = self.reopen().await else { return; };
                        handle = reopened;
                        control_open = true;
                    }
                    None => {
                        control_open = false;
                    }
                },
            }
        }
    }

    async fn reopen(&mut self) -> Option<StreamHandle> {
        let _ = self.source.close_stream(self.stream_id, &self.bucket).await;
        self.open_from_checkpoint().await
    }

    /// Open the subscription starting from the last durably known
    /// checkpoint, retrying with backoff until it succeeds or the manager
    /// stops. Failures here never affect other streams.
    async fn open_from_checkpoint(&mut self) -> Option<StreamHandle> {
        loop {
            if *self.stop.borrow() {
                return None;
            }
            let start = self.last_checkpoint();
            match self
                .source
                .open_stream(self.stream_id, &self.bucket, &self.vbuckets, start)
                .await
            {
                Ok(handle) => return Some(handle),
                Err(err) => {
                    warn!(stream = %self.stream_id, bucket = %self.bucket, error = %err,
                        "cannot open mutation stream, retrying");
                }
            }
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        return None;
                    }
                }
                _ = tokio::time::sleep(self.reopen_backoff) => {}
            }
        }
    }

    fn last_checkpoint(&self) -> StabilityTimestamp {
        match self.repo.get_stability_checkpoint() {
            Ok(checkpoint) => checkpoint
                .timestamp(self.stream_id, &self.bucket)
                .cloned()
                .unwrap_or_else(|| StabilityTimestamp::new(self.stream_id, &*self.bucket)),
            Err(err) => {
                warn!(stream = %self.stream_id, bucket = %self.bucket, error = %err,
                    "cannot read checkpoint, starting stream from scratch");
                StabilityTimestamp::new(self.stream_id, &*self.bucket)
            }
        }
    }
}
