//! Linearized metadata writes over the replicated log.
//!
//! Any node can submit a change request; the replicated-log collaborator
//! carries it to a majority, and a single apply task on every node consumes
//! the committed-entry feed in order, applying each entry to the metadata
//! repository and firing listener notifications. A request only succeeds
//! once its entry has been applied locally, so success implies the change is
//! visible to subsequent reads on this node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sable_core::{LogEntry, OpCode, ReplicatedLog, Role, StabilityTimestamp};

use crate::error::MetaError;
use crate::event::{EventManager, MetaEvent};
use crate::repo::{self, MetadataRepo};
use crate::timekeeper::TimestampFanout;
use crate::topology::{IndexDefn, IndexTopology};

pub struct Coordinator {
    log: Arc<dyn ReplicatedLog>,
    repo: Arc<MetadataRepo>,
    events: Arc<EventManager>,
    fanout: Arc<TimestampFanout>,
    request_timeout: Duration,
    last_req_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<(), MetaError>>>>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build the coordinator and spawn its apply task on the committed-entry
    /// feed.
    pub fn start(
        log: Arc<dyn ReplicatedLog>,
        repo: Arc<MetadataRepo>,
        events: Arc<EventManager>,
        fanout: Arc<TimestampFanout>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let commits = log.subscribe_commits();
        let coordinator = Arc::new(Self {
            log,
            repo,
            events,
            fanout,
            request_timeout,
            last_req_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            apply_task: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&coordinator).run_apply(commits));
        *coordinator.apply_task.lock().unwrap() = Some(task);
        coordinator
    }

    pub fn role(&self) -> Role {
        self.log.current_role()
    }

    pub fn subscribe_roles(&self) -> watch::Receiver<Role> {
        self.log.subscribe_roles()
    }

    /// Submit a change for majority commit and wait until it has been
    /// applied locally.
    ///
    /// Rejected immediately with `NotLeaderOrFollower` while this node is
    /// unsynchronized. A timeout or log failure means the outcome is
    /// unknown, not rolled back; the caller owns retry policy. An
    /// apply-side `Repository`/`Codec` error surfaces after the entry was
    /// majority-committed: the change is durable cluster-wide even though
    /// this node failed to apply it.
    pub async fn new_request(
        &self,
        op: OpCode,
        key: String,
        content: Vec<u8>,
    ) -> Result<(), MetaError> {
        if self.log.current_role() == Role::Unsynchronized {
            return Err(MetaError::NotLeaderOrFollower);
        }

        let req_id = self.next_req_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(req_id, tx);

        let entry = LogEntry {
            req_id,
            op,
            key,
            content,
        };
        let deadline = self.request_timeout;
        let started = tokio::time::Instant::now();

        let committed = match tokio::time::timeout(deadline, self.log.propose(entry)).await {
            Err(_) => {
                self.forget(req_id);
                return Err(MetaError::ConsensusTimeout(deadline));
            }
            Ok(Err(err)) => {
                self.forget(req_id);
                return Err(MetaError::Log(err.to_string()));
            }
            Ok(Ok(committed)) => committed,
        };
        if !committed {
            self.forget(req_id);
            return Err(MetaError::NotLeaderOrFollower);
        }

        // Committed by a majority; wait for the local apply so listeners
        // have fired before the caller observes success.
        let remaining = deadline.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, rx).await {
            Err(_) => {
                self.forget(req_id);
                Err(MetaError::ConsensusTimeout(deadline))
            }
            Ok(Err(_)) => Err(MetaError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.apply_task.lock().unwrap().take() {
            task.abort();
        }
        self.pending.lock().unwrap().clear();
    }

    fn forget(&self, req_id: u64) {
        self.pending.lock().unwrap().remove(&req_id);
    }

    /// Wall-clock-derived request id, forced monotonic across calls.
    fn next_req_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64;
        self.last_req_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .map(|last| now.max(last.saturating_add(1)))
            .unwrap_or(now)
    }

    async fn run_apply(self: Arc<Self>, mut commits: mpsc::Receiver<LogEntry>) {
        while let Some(entry) = commits.recv().await {
            let result = self.apply_committed(&entry);
            if let Err(err) = &result {
                warn!(
                    req_id = entry.req_id,
                    op = ?entry.op,
                    key = %entry.key,
                    error = %err,
                    "failed to apply committed entry"
                );
            }
            let waiter = self.pending.lock().unwrap().remove(&entry.req_id);
            if let Some(tx) = waiter {
                let _ = tx.send(result);
            }
        }
        debug!("committed-entry feed closed, apply task exiting");
    }

    fn apply_committed(&self, entry: &LogEntry) -> Result<(), MetaError> {
        match entry.op {
            OpCode::AddIndexDefn => {
                let defn: IndexDefn = serde_json::from_slice(&entry.content)?;
                self.repo.apply_add_index_defn(&defn)?;
                debug!(
                    bucket = %defn.bucket,
                    name = %defn.name,
                    defn_id = defn.defn_id,
                    "applied index definition"
                );
                self.events.notify(MetaEvent::IndexCreated(defn));
            }
            OpCode::DelIndexDefn => {
                let Some((bucket, name)) = repo::parse_index_defn_key(&entry.key) else {
                    return Err(MetaError::InvalidArgument(format!(
                        "malformed index definition key {:?}",
                        entry.key
                    )));
                };
                let removed = self.repo.apply_del_index_defn(bucket, name)?;
                debug!(bucket, name, "removed index definition");
                self.events.notify(MetaEvent::IndexDropped {
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                    defn_id: removed.map(|defn| defn.defn_id),
                });
            }
            OpCode::UpdateTopology => {
                let topology: IndexTopology = serde_json::from_slice(&entry.content)?;
                let bucket = topology.bucket.clone();
                self.repo.apply_set_topology(&topology)?;
                self.events.notify(MetaEvent::TopologyUpdated { bucket });
            }
            OpCode::NotifyTimestamp => {
                let timestamp: StabilityTimestamp = serde_json::from_slice(&entry.content)?;
                let merged = self.repo.apply_merge_timestamp(&timestamp)?;
                self.fanout.publish(&merged);
            }
            OpCode::DeleteMeta => {
                self.repo.delete_meta(&entry.key)?;
            }
        }
        Ok(())
    }
}
