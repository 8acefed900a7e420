//! Index definitions and per-bucket placement topology.
//!
//! An `IndexDefn` is immutable once created; rename is unsupported
//! (drop + create). Topology records are owned exclusively by the metadata
//! repository and mutated only through coordinator-committed requests.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use sable_core::StreamId;

pub type DefnId = u64;
pub type InstId = u64;

/// Storage engine backing an index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[default]
    Lsm,
    Memory,
    View,
}

/// Language of the index expressions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprKind {
    #[default]
    N1ql,
    Simple,
}

/// How index entries are partitioned across instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionScheme {
    #[default]
    Single,
    KeyHash,
    Test,
}

/// Immutable index definition body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefn {
    pub defn_id: DefnId,
    pub bucket: String,
    pub name: String,
    pub is_primary: bool,
    pub using: StorageKind,
    pub expr_kind: ExprKind,
    pub secondary_exprs: Vec<String>,
    pub partition_scheme: PartitionScheme,
    pub partition_expr: String,
}

impl IndexDefn {
    /// Minimal secondary-index definition; remaining fields take defaults.
    pub fn new(bucket: impl Into<String>, name: impl Into<String>, exprs: Vec<String>) -> Self {
        Self {
            defn_id: 0,
            bucket: bucket.into(),
            name: name.into(),
            is_primary: false,
            using: StorageKind::default(),
            expr_kind: ExprKind::default(),
            secondary_exprs: exprs,
            partition_scheme: PartitionScheme::default(),
            partition_expr: String::new(),
        }
    }
}

/// Lifecycle state of one index instance placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Initial,
    Active,
    Deferred,
    Deleted,
}

/// One placed instance of an index within a bucket topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInstance {
    pub inst_id: InstId,
    pub defn_id: DefnId,
    pub state: IndexState,
    pub stream_id: StreamId,
}

/// Per-bucket mapping from index instances to placement state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTopology {
    pub bucket: String,
    pub version: u64,
    pub instances: Vec<IndexInstance>,
}

impl IndexTopology {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            version: 0,
            instances: Vec::new(),
        }
    }

    /// Distinct streams serving instances that are not deleted.
    pub fn streams(&self) -> BTreeSet<StreamId> {
        self.instances
            .iter()
            .filter(|inst| inst.state != IndexState::Deleted)
            .map(|inst| inst.stream_id)
            .collect()
    }
}

/// Index of all per-bucket topology keys. Keys referenced here that do not
/// resolve to a stored topology record are orphans and are removed by the
/// cleanup path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTopology {
    pub topology_keys: Vec<String>,
}

impl GlobalTopology {
    /// Record a topology key; returns false when already present.
    pub fn add_key(&mut self, key: &str) -> bool {
        if self.topology_keys.iter().any(|k| k == key) {
            return false;
        }
        self.topology_keys.push(key.to_string());
        true
    }
}
