//! Externally-facing façade over the coordinator and repository.
//!
//! Translates create/drop/query-topology calls into coordinator requests or
//! repository reads. Local callers use it directly; a remote admin surface
//! would sit on top of it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use sable_core::OpCode;

use crate::coordinator::Coordinator;
use crate::error::MetaError;
use crate::repo::{self, MetadataRepo};
use crate::topology::{GlobalTopology, IndexDefn, IndexTopology};

pub struct RequestHandler {
    coordinator: Arc<Coordinator>,
    repo: Arc<MetadataRepo>,
}

impl RequestHandler {
    pub fn new(coordinator: Arc<Coordinator>, repo: Arc<MetadataRepo>) -> Self {
        Self { coordinator, repo }
    }

    /// Handle a create-index DDL request.
    ///
    /// Blocks until the definition is durably applied cluster-wide. An error
    /// from the coordinator means the outcome is unknown: the definition may
    /// still have been committed elsewhere.
    pub async fn create_index(&self, mut defn: IndexDefn) -> Result<IndexDefn, MetaError> {
        if defn.bucket.is_empty() || defn.name.is_empty() {
            return Err(MetaError::InvalidArgument(
                "index bucket and name must be non-empty".into(),
            ));
        }
        if self
            .repo
            .get_index_defn_by_name(&defn.bucket, &defn.name)?
            .is_some()
        {
            return Err(MetaError::IndexExists {
                bucket: defn.bucket,
                name: defn.name,
            });
        }
        if defn.defn_id == 0 {
            defn.defn_id = wallclock_id();
        }

        let key = repo::index_defn_key(&defn.bucket, &defn.name);
        let content = serde_json::to_vec(&defn)?;
        self.coordinator
            .new_request(OpCode::AddIndexDefn, key, content)
            .await?;
        info!(bucket = %defn.bucket, name = %defn.name, defn_id = defn.defn_id,
            "create index committed");
        Ok(defn)
    }

    /// Handle a drop-index DDL request. Rename is unsupported; drop + create
    /// is the only way to change a definition.
    pub async fn drop_index(&self, bucket: &str, name: &str) -> Result<(), MetaError> {
        if self.repo.get_index_defn_by_name(bucket, name)?.is_none() {
            return Err(MetaError::IndexNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }

        let key = repo::index_defn_key(bucket, name);
        self.coordinator
            .new_request(OpCode::DelIndexDefn, key, Vec::new())
            .await?;
        info!(bucket, name, "drop index committed");
        Ok(())
    }

    /// Submit a per-bucket topology update for majority commit.
    pub async fn set_topology(&self, topology: &IndexTopology) -> Result<(), MetaError> {
        if topology.bucket.is_empty() {
            return Err(MetaError::InvalidArgument(
                "topology bucket must be non-empty".into(),
            ));
        }
        let key = repo::topology_key(&topology.bucket);
        let content = serde_json::to_vec(topology)?;
        self.coordinator
            .new_request(OpCode::UpdateTopology, key, content)
            .await
    }

    pub fn topology(&self, bucket: &str) -> Result<Option<IndexTopology>, MetaError> {
        self.repo.get_topology_by_bucket(bucket)
    }

    pub fn global_topology(&self) -> Result<Option<GlobalTopology>, MetaError> {
        self.repo.get_global_topology()
    }
}

/// Wall-clock-derived definition id for requests that do not supply one.
fn wallclock_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(u128::from(u64::MAX)) as u64
}
