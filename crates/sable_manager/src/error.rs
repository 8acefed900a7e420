//! Error taxonomy for the metadata manager's public contract.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the index manager and its components.
///
/// `ConsensusTimeout` and `Log` mean the outcome of the request is unknown:
/// the change may still have been committed by other nodes. Callers own the
/// retry policy; nothing at this layer retries DDL automatically.
#[derive(Debug, Error)]
pub enum MetaError {
    /// A majority did not acknowledge the request within the bound.
    #[error("consensus timeout after {0:?}; outcome unknown")]
    ConsensusTimeout(Duration),

    /// This node is not synchronized as leader or follower; the request was
    /// rejected before being proposed.
    #[error("node is neither leader nor follower")]
    NotLeaderOrFollower,

    /// Durable read/write against the metadata repository failed.
    #[error("metadata repository failure")]
    Repository(#[from] fjall::Error),

    /// A record or log command could not be (de)serialized.
    #[error("metadata codec failure")]
    Codec(#[from] serde_json::Error),

    /// The replicated-log collaborator reported a transport-level failure.
    #[error("replicated log failure: {0}")]
    Log(String),

    #[error("index {bucket}/{name} not found")]
    IndexNotFound { bucket: String, name: String },

    #[error("index {bucket}/{name} already exists")]
    IndexExists { bucket: String, name: String },

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("index manager is closed")]
    Closed,
}

impl MetaError {
    /// True when the request outcome is unknown rather than known-failed.
    ///
    /// `Repository` and `Codec` are not classified here because they can
    /// also arise from pre-propose reads, where nothing was submitted.
    /// When one of them is returned by a DDL call, the entry was already
    /// majority-committed and only the local apply failed: the change is
    /// durable cluster-wide and reachable on replicas even though this
    /// node's read path may not reflect it.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, MetaError::ConsensusTimeout(_) | MetaError::Log(_))
    }
}
