//! Shared helpers for integration tests.
//!
//! Provides an in-process single-node `ReplicatedLog` whose role is
//! scriptable from the test, and a scriptable `MutationSource` that records
//! every open/close and lets tests drive the feed side.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use sable_core::{
    LogEntry, MutationSource, ReplicatedLog, Role, StabilityTimestamp, StreamControl,
    StreamHandle, StreamId, TsVbuuid,
};
use sable_manager::{IndexManager, IndexInstance, IndexState, IndexTopology, ManagerConfig};

/// Upper bound for any condition the tests wait on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-node replicated log: commits immediately unless wedged.
pub struct LocalLog {
    roles: watch::Sender<Role>,
    commits: mpsc::Sender<LogEntry>,
    commits_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
    wedged: AtomicBool,
    failures_left: AtomicU64,
}

impl LocalLog {
    pub fn new(initial: Role) -> Arc<Self> {
        let (roles, _) = watch::channel(initial);
        let (commits, rx) = mpsc::channel(256);
        Arc::new(Self {
            roles,
            commits,
            commits_rx: Mutex::new(Some(rx)),
            wedged: AtomicBool::new(false),
            failures_left: AtomicU64::new(0),
        })
    }

    pub fn set_role(&self, role: Role) {
        let _ = self.roles.send(role);
    }

    /// Simulate loss of majority: proposals never resolve.
    pub fn wedge(&self) {
        self.wedged.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` proposals fail with a transport error.
    pub fn fail_next_proposes(&self, count: u64) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    async fn propose(&self, entry: LogEntry) -> anyhow::Result<bool> {
        if self.wedged.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow::anyhow!("injected proposal failure"));
        }
        if self.current_role() == Role::Unsynchronized {
            return Ok(false);
        }
        self.commits
            .send(entry)
            .await
            .map_err(|_| anyhow::anyhow!("commit feed closed"))?;
        Ok(true)
    }

    fn current_role(&self) -> Role {
        *self.roles.borrow()
    }

    fn subscribe_roles(&self) -> watch::Receiver<Role> {
        self.roles.subscribe()
    }

    fn subscribe_commits(&self) -> mpsc::Receiver<LogEntry> {
        self.commits_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1)
    }
}

/// Metadata of one recorded `open_stream` call.
#[derive(Clone)]
pub struct OpenedStream {
    pub stream_id: StreamId,
    pub bucket: String,
    pub vbuckets: Vec<u16>,
    pub start: StabilityTimestamp,
}

struct Feed {
    reports: mpsc::Sender<TsVbuuid>,
    control: mpsc::Sender<StreamControl>,
}

/// Mutation source recording opens/closes; feed senders stay inside so a
/// test can drop them to simulate end-of-feed.
#[derive(Default)]
pub struct ScriptedSource {
    opened: Mutex<Vec<OpenedStream>>,
    feeds: Mutex<Vec<Option<Feed>>>,
    closed: Mutex<Vec<(StreamId, String)>>,
    open_failures: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` `open_stream` calls for `bucket` fail.
    pub fn fail_next_opens(&self, bucket: &str, count: usize) {
        self.open_failures
            .lock()
            .unwrap()
            .insert(bucket.to_string(), count);
    }

    pub fn opened(&self) -> Vec<OpenedStream> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<(StreamId, String)> {
        self.closed.lock().unwrap().clone()
    }

    /// Push a timestamp report into the feed of the `index`-th open.
    pub async fn send_report(&self, index: usize, report: TsVbuuid) {
        let sender = {
            let feeds = self.feeds.lock().unwrap();
            feeds[index]
                .as_ref()
                .expect("feed already dropped")
                .reports
                .clone()
        };
        sender.send(report).await.expect("worker gone");
    }

    /// Push a control message into the feed of the `index`-th open.
    pub async fn send_control(&self, index: usize, control: StreamControl) {
        let sender = {
            let feeds = self.feeds.lock().unwrap();
            feeds[index]
                .as_ref()
                .expect("feed already dropped")
                .control
                .clone()
        };
        sender.send(control).await.expect("worker gone");
    }

    /// Drop the feed senders of the `index`-th open, ending that feed.
    pub fn drop_feed(&self, index: usize) {
        self.feeds.lock().unwrap()[index] = None;
    }

    pub async fn wait_for_opens(&self, count: usize) -> Vec<OpenedStream> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let opened = self.opened();
            if opened.len() >= count {
                return opened;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} stream opens (saw {})",
                opened.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_closes(&self, count: usize) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while self.closed().len() < count {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} stream closes"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl MutationSource for ScriptedSource {
    async fn open_stream(
        &self,
        stream_id: StreamId,
        bucket: &str,
        vbuckets: &[u16],
        start: StabilityTimestamp,
    ) -> anyhow::Result<StreamHandle> {
        {
            let mut failures = self.open_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(bucket) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("injected open failure for {bucket}");
                }
            }
        }
        let (reports_tx, reports_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(8);
        self.opened.lock().unwrap().push(OpenedStream {
            stream_id,
            bucket: bucket.to_string(),
            vbuckets: vbuckets.to_vec(),
            start,
        });
        self.feeds.lock().unwrap().push(Some(Feed {
            reports: reports_tx,
            control: control_tx,
        }));
        Ok(StreamHandle {
            reports: reports_rx,
            control: control_rx,
        })
    }

    async fn close_stream(&self, stream_id: StreamId, bucket: &str) -> anyhow::Result<()> {
        self.closed
            .lock()
            .unwrap()
            .push((stream_id, bucket.to_string()));
        Ok(())
    }
}

/// One in-process node under test.
pub struct TestNode {
    pub dir: tempfile::TempDir,
    pub log: Arc<LocalLog>,
    pub source: Arc<ScriptedSource>,
    pub manager: Arc<IndexManager>,
}

/// Small vbucket count and aggressive timings so tests run quickly.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        timestamp_persist_interval: Duration::ZERO,
        request_timeout: Duration::from_secs(2),
        num_vbuckets: 4,
        stream_reopen_backoff: Duration::from_millis(50),
        ..ManagerConfig::default()
    }
}

/// Opt into log output with RUST_LOG; quiet by default.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

pub fn start_node(config: ManagerConfig, initial_role: Role) -> TestNode {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let log = LocalLog::new(initial_role);
    let source = ScriptedSource::new();
    let log_dyn: Arc<dyn ReplicatedLog> = log.clone();
    let source_dyn: Arc<dyn MutationSource> = source.clone();
    let manager =
        IndexManager::new(config, dir.path(), log_dyn, source_dyn).expect("start index manager");
    TestNode {
        dir,
        log,
        source,
        manager,
    }
}

/// A one-instance maintenance-stream topology for `bucket`.
pub fn maintenance_topology(bucket: &str) -> IndexTopology {
    let mut topology = IndexTopology::new(bucket);
    topology.version = 1;
    topology.instances.push(IndexInstance {
        inst_id: 1,
        defn_id: 1,
        state: IndexState::Active,
        stream_id: StreamId::Maintenance,
    });
    topology
}

/// Poll until `cond` holds or the shared wait timeout elapses.
pub async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
