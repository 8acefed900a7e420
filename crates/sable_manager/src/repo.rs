//! Durable metadata repository.
//!
//! Stores index definitions, per-bucket topology, the global topology index,
//! and the stability-timestamp checkpoint in a fjall partition. The repo
//! performs no consensus of its own: every mutating operation here is only
//! invoked by the coordinator's apply task after a request has been
//! majority-committed, so reads from any task observe last-committed values
//! only.

use std::path::Path;
use std::sync::Arc;

use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use sable_core::{StabilityCheckpoint, StabilityTimestamp};

use crate::error::MetaError;
use crate::topology::{DefnId, GlobalTopology, IndexDefn, IndexTopology};

pub const GLOBAL_TOPOLOGY_KEY: &str = "topology_global";
pub const STABILITY_TIMESTAMPS_KEY: &str = "stability_timestamps";

pub fn index_defn_key(bucket: &str, name: &str) -> String {
    format!("defn/{bucket}/{name}")
}

pub fn index_defn_id_key(defn_id: DefnId) -> String {
    format!("defnid/{defn_id}")
}

pub fn topology_key(bucket: &str) -> String {
    format!("topology/{bucket}")
}

/// Split a `defn/<bucket>/<name>` key back into its parts.
pub fn parse_index_defn_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix("defn/")?.split_once('/')
}

/// Fjall-backed repository of all durable metadata records.
pub struct MetadataRepo {
    keyspace: Arc<Keyspace>,
    meta: fjall::PartitionHandle,
}

impl MetadataRepo {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MetaError> {
        let keyspace = Arc::new(fjall::Config::new(dir.as_ref()).open()?);
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, meta })
    }

    fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MetaError> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, key: &str, record: &T) -> Result<(), MetaError> {
        let data = serde_json::to_vec(record)?;
        self.meta.insert(key, data)?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(())
    }

    pub fn get_index_defn_by_name(
        &self,
        bucket: &str,
        name: &str,
    ) -> Result<Option<IndexDefn>, MetaError> {
        self.get_record(&index_defn_key(bucket, name))
    }

    pub fn get_index_defn_by_id(&self, defn_id: DefnId) -> Result<Option<IndexDefn>, MetaError> {
        self.get_record(&index_defn_id_key(defn_id))
    }

    /// Snapshot of all stored index definitions, in key order.
    pub fn index_defns(&self) -> Result<Vec<IndexDefn>, MetaError> {
        let mut out = Vec::new();
        for item in self.meta.prefix("defn/") {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    pub fn get_topology_by_bucket(
        &self,
        bucket: &str,
    ) -> Result<Option<IndexTopology>, MetaError> {
        self.get_record(&topology_key(bucket))
    }

    /// Read a topology record by its raw global-topology key.
    pub fn get_topology_by_key(&self, key: &str) -> Result<Option<IndexTopology>, MetaError> {
        self.get_record(key)
    }

    pub fn get_global_topology(&self) -> Result<Option<GlobalTopology>, MetaError> {
        self.get_record(GLOBAL_TOPOLOGY_KEY)
    }

    /// The last durably committed stability checkpoint; empty when none has
    /// ever been persisted.
    pub fn get_stability_checkpoint(&self) -> Result<StabilityCheckpoint, MetaError> {
        Ok(self
            .get_record::<StabilityCheckpoint>(STABILITY_TIMESTAMPS_KEY)?
            .unwrap_or_default())
    }

    // ---- apply-side mutations (coordinator apply task only) ----

    /// Store a committed index definition under both its name and id keys.
    pub fn apply_add_index_defn(&self, defn: &IndexDefn) -> Result<(), MetaError> {
        let data = serde_json::to_vec(defn)?;
        self.meta.insert(index_defn_key(&defn.bucket, &defn.name), data.clone())?;
        self.meta.insert(index_defn_id_key(defn.defn_id), data)?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(())
    }

    /// Remove a committed index definition. Returns the removed definition,
    /// if it existed; deleting an absent definition is not an error.
    pub fn apply_del_index_defn(
        &self,
        bucket: &str,
        name: &str,
    ) -> Result<Option<IndexDefn>, MetaError> {
        let Some(defn) = self.get_index_defn_by_name(bucket, name)? else {
            return Ok(None);
        };
        self.meta.remove(index_defn_key(bucket, name))?;
        self.meta.remove(index_defn_id_key(defn.defn_id))?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(Some(defn))
    }

    /// Store a committed topology record and keep the global topology index
    /// in sync.
    pub fn apply_set_topology(&self, topology: &IndexTopology) -> Result<(), MetaError> {
        let key = topology_key(&topology.bucket);
        let data = serde_json::to_vec(topology)?;
        self.meta.insert(key.as_str(), data)?;

        let mut global = self.get_global_topology()?.unwrap_or_default();
        if global.add_key(&key) {
            self.meta
                .insert(GLOBAL_TOPOLOGY_KEY, serde_json::to_vec(&global)?)?;
        }
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(())
    }

    /// Merge a committed stream timestamp into the durable checkpoint and
    /// return the merged value for that stream.
    pub fn apply_merge_timestamp(
        &self,
        timestamp: &StabilityTimestamp,
    ) -> Result<StabilityTimestamp, MetaError> {
        let mut checkpoint = self.get_stability_checkpoint()?;
        checkpoint.merge_timestamp(timestamp);
        let merged = checkpoint
            .timestamp(timestamp.stream_id, &timestamp.bucket)
            .cloned()
            .unwrap_or_else(|| timestamp.clone());
        self.put_record(STABILITY_TIMESTAMPS_KEY, &checkpoint)?;
        Ok(merged)
    }

    /// Delete a metadata record by raw key. Idempotent: deleting an absent
    /// key is not an error. Used only by cleanup paths.
    pub fn delete_meta(&self, key: &str) -> Result<(), MetaError> {
        self.meta.remove(key)?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(())
    }
}
