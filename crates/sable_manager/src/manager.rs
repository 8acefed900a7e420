//! Top-level index manager: owns every subsystem and drives role
//! transitions.
//!
//! The stream manager and timestamp keeper run only while this node is
//! leader; a single async mutex guards their {start, stop, close} so a role
//! flap cannot interleave with shutdown and leave split-brain writers
//! behind.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sable_core::{
    MutationSource, OpCode, ReplicatedLog, Role, StabilityTimestamp, StreamId,
};

use crate::config::ManagerConfig;
use crate::coordinator::Coordinator;
use crate::error::MetaError;
use crate::event::{EventKind, EventManager, MetaEvent};
use crate::repo::{self, MetadataRepo, STABILITY_TIMESTAMPS_KEY};
use crate::request_handler::RequestHandler;
use crate::stream_manager::StreamManager;
use crate::timekeeper::{TimestampFanout, TimestampKeeper};
use crate::topology::{DefnId, GlobalTopology, IndexDefn, IndexTopology};

/// Leader-only services plus the closed flag, all behind one lock.
#[derive(Default)]
struct MasterState {
    closed: bool,
    keeper: Option<TimestampKeeper>,
    streams: Option<StreamManager>,
}

/// Everything needed to start or stop the leader-only services.
struct MasterDeps {
    config: ManagerConfig,
    repo: Arc<MetadataRepo>,
    coordinator: Arc<Coordinator>,
    source: Arc<dyn MutationSource>,
    persist_interval: Arc<AtomicU64>,
}

pub struct IndexManager {
    repo: Arc<MetadataRepo>,
    coordinator: Arc<Coordinator>,
    events: Arc<EventManager>,
    fanout: Arc<TimestampFanout>,
    handler: RequestHandler,
    persist_interval: Arc<AtomicU64>,
    master: Arc<Mutex<MasterState>>,
    background_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl IndexManager {
    /// Open the metadata repository, start the coordinator's apply task, and
    /// begin following role transitions from the replicated log.
    pub fn new(
        config: ManagerConfig,
        data_dir: impl AsRef<Path>,
        log: Arc<dyn ReplicatedLog>,
        source: Arc<dyn MutationSource>,
    ) -> Result<Arc<Self>, MetaError> {
        let repo = Arc::new(MetadataRepo::open(data_dir)?);
        let events = Arc::new(EventManager::new(config.event_channel_capacity));
        let fanout = Arc::new(TimestampFanout::new(config.timestamp_channel_capacity));
        let coordinator = Coordinator::start(
            log,
            Arc::clone(&repo),
            Arc::clone(&events),
            Arc::clone(&fanout),
            config.request_timeout,
        );
        let persist_interval = Arc::new(AtomicU64::new(
            config.timestamp_persist_interval.as_nanos().min(u128::from(u64::MAX)) as u64,
        ));
        let deps = Arc::new(MasterDeps {
            config,
            repo: Arc::clone(&repo),
            coordinator: Arc::clone(&coordinator),
            source,
            persist_interval: Arc::clone(&persist_interval),
        });
        let master = Arc::new(Mutex::new(MasterState::default()));
        let handler = RequestHandler::new(Arc::clone(&coordinator), Arc::clone(&repo));
        let topology_events =
            events.register("manager-topology-refresh", EventKind::TopologyUpdated)?;

        let manager = Arc::new(Self {
            repo,
            coordinator,
            events,
            fanout,
            handler,
            persist_interval,
            master: Arc::clone(&master),
            background_tasks: std::sync::Mutex::new(Vec::new()),
        });

        let role_task = tokio::spawn(follow_roles(
            manager.coordinator.subscribe_roles(),
            deps,
            Arc::clone(&master),
        ));
        let refresh_task = tokio::spawn(follow_topology_updates(topology_events, master));
        manager
            .background_tasks
            .lock()
            .unwrap()
            .extend([role_task, refresh_task]);

        Ok(manager)
    }

    // ---- metadata operations ----

    /// Create-index DDL. Blocks until the definition is durably applied
    /// cluster-wide; an error means "outcome unknown", never "rolled back".
    pub async fn create_index_ddl(&self, defn: IndexDefn) -> Result<IndexDefn, MetaError> {
        self.ensure_open().await?;
        self.handler.create_index(defn).await
    }

    /// Drop-index DDL; same durability contract as create.
    pub async fn drop_index_ddl(&self, bucket: &str, name: &str) -> Result<(), MetaError> {
        self.ensure_open().await?;
        self.handler.drop_index(bucket, name).await
    }

    pub fn get_index_defn_by_name(
        &self,
        bucket: &str,
        name: &str,
    ) -> Result<Option<IndexDefn>, MetaError> {
        self.repo.get_index_defn_by_name(bucket, name)
    }

    pub fn get_index_defn_by_id(&self, defn_id: DefnId) -> Result<Option<IndexDefn>, MetaError> {
        self.repo.get_index_defn_by_id(defn_id)
    }

    /// Snapshot of all index definitions.
    pub fn index_defns(&self) -> Result<Vec<IndexDefn>, MetaError> {
        self.repo.index_defns()
    }

    pub fn get_topology_by_bucket(
        &self,
        bucket: &str,
    ) -> Result<Option<IndexTopology>, MetaError> {
        self.repo.get_topology_by_bucket(bucket)
    }

    /// Replace a bucket's topology through a majority-committed request.
    pub async fn set_topology_by_bucket(
        &self,
        topology: &IndexTopology,
    ) -> Result<(), MetaError> {
        self.ensure_open().await?;
        self.handler.set_topology(topology).await
    }

    pub fn get_global_topology(&self) -> Result<Option<GlobalTopology>, MetaError> {
        self.repo.get_global_topology()
    }

    // ---- event subscriptions ----

    pub fn listen_index_create(
        &self,
        listener_id: &str,
    ) -> Result<mpsc::Receiver<MetaEvent>, MetaError> {
        self.events.register(listener_id, EventKind::IndexCreated)
    }

    pub fn unlisten_index_create(&self, listener_id: &str) {
        self.events.unregister(listener_id, EventKind::IndexCreated);
    }

    pub fn listen_index_drop(
        &self,
        listener_id: &str,
    ) -> Result<mpsc::Receiver<MetaEvent>, MetaError> {
        self.events.register(listener_id, EventKind::IndexDropped)
    }

    pub fn unlisten_index_drop(&self, listener_id: &str) {
        self.events.unregister(listener_id, EventKind::IndexDropped);
    }

    pub fn listen_topology_update(
        &self,
        listener_id: &str,
    ) -> Result<mpsc::Receiver<MetaEvent>, MetaError> {
        self.events.register(listener_id, EventKind::TopologyUpdated)
    }

    pub fn unlisten_topology_update(&self, listener_id: &str) {
        self.events.unregister(listener_id, EventKind::TopologyUpdated);
    }

    // ---- timestamp operations ----

    /// Subscribe to merged-and-committed stability timestamps for a stream.
    pub fn stability_timestamp_channel(
        &self,
        stream_id: StreamId,
    ) -> mpsc::Receiver<StabilityTimestamp> {
        self.fanout.subscribe(stream_id)
    }

    /// Point lookup against the last durably known checkpoint.
    pub fn stability_timestamp_for_vb(
        &self,
        stream_id: StreamId,
        bucket: &str,
        vbucket: u16,
    ) -> Result<Option<(u64, u64)>, MetaError> {
        Ok(self
            .repo
            .get_stability_checkpoint()?
            .find(stream_id, bucket, vbucket))
    }

    /// Change the persistence debounce interval; takes effect on the next
    /// report the keeper processes.
    pub fn set_timestamp_persist_interval(&self, interval: Duration) {
        self.persist_interval.store(
            interval.as_nanos().min(u128::from(u64::MAX)) as u64,
            Ordering::Relaxed,
        );
    }

    pub fn role(&self) -> Role {
        self.coordinator.role()
    }

    // ---- cleanup ----

    /// Remove every per-bucket topology record listed in the global topology
    /// (orphans included) and then the global index itself.
    pub async fn cleanup_topology(&self) -> Result<(), MetaError> {
        self.ensure_open().await?;
        let Some(global) = self.repo.get_global_topology()? else {
            return Ok(());
        };
        for key in global.topology_keys {
            self.coordinator
                .new_request(OpCode::DeleteMeta, key, Vec::new())
                .await?;
        }
        self.coordinator
            .new_request(OpCode::DeleteMeta, repo::GLOBAL_TOPOLOGY_KEY.to_string(), Vec::new())
            .await
    }

    /// Stop the leader-only services and remove the durable stability
    /// checkpoint.
    pub async fn cleanup_stability_timestamp(&self) -> Result<(), MetaError> {
        {
            let mut master = self.master.lock().await;
            if master.closed {
                return Err(MetaError::Closed);
            }
            stop_master(&mut master).await;
        }
        self.coordinator
            .new_request(OpCode::DeleteMeta, STABILITY_TIMESTAMPS_KEY.to_string(), Vec::new())
            .await
    }

    // ---- lifecycle ----

    pub async fn is_closed(&self) -> bool {
        self.master.lock().await.closed
    }

    /// Tear everything down. Safe to call more than once.
    pub async fn close(&self) {
        {
            let mut master = self.master.lock().await;
            if master.closed {
                return;
            }
            master.closed = true;
            stop_master(&mut master).await;
        }
        self.events.close();
        self.coordinator.shutdown();
        for task in self.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("index manager closed");
    }

    async fn ensure_open(&self) -> Result<(), MetaError> {
        if self.master.lock().await.closed {
            return Err(MetaError::Closed);
        }
        Ok(())
    }
}

/// Drive leader-only services from the replicated log's role feed.
async fn follow_roles(
    mut roles: tokio::sync::watch::Receiver<Role>,
    deps: Arc<MasterDeps>,
    master: Arc<Mutex<MasterState>>,
) {
    loop {
        let role = *roles.borrow_and_update();
        {
            let mut state = master.lock().await;
            if state.closed {
                return;
            }
            match role {
                Role::Leader => {
                    if let Err(err) = start_master(&deps, &mut state).await {
                        warn!(error = %err, "cannot start leader services");
                    }
                }
                Role::Follower | Role::Unsynchronized => {
                    stop_master(&mut state).await;
                }
            }
        }
        if roles.changed().await.is_err() {
            debug!("role feed closed, role follower exiting");
            return;
        }
    }
}

/// Re-scan the topology for new streams whenever a topology update commits
/// while the leader-only services are running. Updates committed while not
/// leader are picked up by the scan at the next leadership gain.
async fn follow_topology_updates(
    mut updates: mpsc::Receiver<MetaEvent>,
    master: Arc<Mutex<MasterState>>,
) {
    while updates.recv().await.is_some() {
        let state = master.lock().await;
        if state.closed {
            return;
        }
        if let Some(streams) = &state.streams {
            if let Err(err) = streams.start_handling_topology_change().await {
                warn!(error = %err, "cannot open streams for updated topology");
            }
        }
    }
    debug!("topology update feed closed, refresh task exiting");
}

/// Start the timestamp keeper and stream manager. Caller holds the master
/// lock.
async fn start_master(deps: &MasterDeps, state: &mut MasterState) -> Result<(), MetaError> {
    if state.keeper.is_some() {
        return Ok(());
    }
    info!("gained leadership, starting master services");

    let keeper = TimestampKeeper::start(
        Arc::clone(&deps.repo),
        Arc::clone(&deps.coordinator),
        Arc::clone(&deps.persist_interval),
        deps.config.report_channel_capacity,
    );
    let streams = StreamManager::new(
        Arc::clone(&deps.source),
        Arc::clone(&deps.repo),
        keeper.inbound(),
        deps.config.vbuckets(),
        deps.config.stream_reopen_backoff,
    );
    streams.start_handling_topology_change().await?;

    state.keeper = Some(keeper);
    state.streams = Some(streams);
    Ok(())
}

/// Stop the leader-only services immediately, discarding unpersisted keeper
/// state. Caller holds the master lock.
async fn stop_master(state: &mut MasterState) {
    if let Some(streams) = state.streams.take() {
        streams.close().await;
    }
    if let Some(keeper) = state.keeper.take() {
        keeper.stop().await;
        info!("lost leadership, master services stopped");
    }
}
