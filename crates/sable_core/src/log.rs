//! Contract for the replicated-log collaborator.
//!
//! The manager is transport-agnostic: the consensus/replication engine sits
//! behind [`ReplicatedLog`], which provides majority-acknowledged proposals,
//! role notifications, and an ordered feed of committed entries that every
//! node applies to its local metadata repository.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// Role of this node in the single-writer coordination protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not yet synchronized with a majority; requests are rejected.
    #[default]
    Unsynchronized,
    Follower,
    Leader,
}

/// Operation carried by a committed log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    AddIndexDefn,
    DelIndexDefn,
    UpdateTopology,
    NotifyTimestamp,
    DeleteMeta,
}

/// A metadata change proposed to, and later committed by, the replicated log.
///
/// `req_id` is monotonic per submitting node within a leader term and is used
/// to release the local waiter once the entry has been applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub req_id: u64,
    pub op: OpCode,
    pub key: String,
    pub content: Vec<u8>,
}

/// Majority-replicated log consumed by the coordinator.
///
/// Implementations can be a full consensus engine, an in-memory single-node
/// log, or a test harness; the manager only relies on the semantics below.
#[async_trait]
pub trait ReplicatedLog: Send + Sync + 'static {
    /// Propose an entry for majority commit.
    ///
    /// Resolves `Ok(true)` only once a majority of live nodes has durably
    /// accepted the entry, `Ok(false)` when the proposal was rejected before
    /// replication (for example because leadership moved). Errors and
    /// caller-side timeouts mean the outcome is unknown, not rolled back.
    async fn propose(&self, entry: LogEntry) -> anyhow::Result<bool>;

    /// Current role of this node.
    fn current_role(&self) -> Role;

    /// Watch channel following role transitions of this node.
    fn subscribe_roles(&self) -> watch::Receiver<Role>;

    /// Ordered feed of committed entries.
    ///
    /// Single consumer: the coordinator's apply task. Entries arrive in
    /// commit order, which within one leader term is submission order.
    fn subscribe_commits(&self) -> mpsc::Receiver<LogEntry>;
}
