//! Vbucket timestamps and stream stability checkpoints.
//!
//! A stability timestamp asserts "all mutations up to this sequence number
//! per vbucket have been observed" for one logical stream over one bucket.
//! The per-vbucket merge rule is total, commutative, and idempotent, so
//! merged checkpoints are insensitive to the arrival order of reports from
//! concurrent stream workers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical identifier of a mutation stream. A stream is distinct per
/// semantic purpose even when it covers the same bucket.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum StreamId {
    /// Steady-state stream feeding active index instances.
    Maintenance,
    /// Initial-build stream for newly created indexes.
    Init,
    /// Catch-up stream for instances recovering lost ground.
    Catchup,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamId::Maintenance => "maintenance",
            StreamId::Init => "init",
            StreamId::Catchup => "catchup",
        };
        f.write_str(name)
    }
}

/// Durable cursor marking how far a vbucket's mutation stream has been
/// consumed.
///
/// `seqno` is monotonically non-decreasing for a fixed `epoch`; an epoch
/// change indicates a rollback/reopen of the vbucket's failover branch and
/// resets ordering assumptions for that vbucket only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsVbuuid {
    pub vbucket: u16,
    pub seqno: u64,
    pub epoch: u64,
}

impl TsVbuuid {
    pub fn new(vbucket: u16, seqno: u64, epoch: u64) -> Self {
        Self {
            vbucket,
            seqno,
            epoch,
        }
    }

    /// True when `self` supersedes `other` under the merge rule: a higher
    /// epoch always wins regardless of seqno; within one epoch the higher
    /// seqno wins.
    pub fn supersedes(&self, other: &TsVbuuid) -> bool {
        if self.epoch != other.epoch {
            return self.epoch > other.epoch;
        }
        self.seqno > other.seqno
    }
}

/// Ordered per-vbucket cursors for one `(stream, bucket)` pair.
///
/// Holds at most one entry per vbucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityTimestamp {
    pub stream_id: StreamId,
    pub bucket: String,
    entries: BTreeMap<u16, TsVbuuid>,
}

impl StabilityTimestamp {
    pub fn new(stream_id: StreamId, bucket: impl Into<String>) -> Self {
        Self {
            stream_id,
            bucket: bucket.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, vbucket: u16) -> Option<&TsVbuuid> {
        self.entries.get(&vbucket)
    }

    /// Iterate entries in vbucket order.
    pub fn iter(&self) -> impl Iterator<Item = &TsVbuuid> {
        self.entries.values()
    }

    /// Merge a single raw report. Returns true when the report advanced the
    /// timestamp (stale and duplicate reports are no-ops).
    pub fn merge_report(&mut self, report: TsVbuuid) -> bool {
        match self.entries.get(&report.vbucket) {
            Some(current) if !report.supersedes(current) => false,
            _ => {
                self.entries.insert(report.vbucket, report);
                true
            }
        }
    }

    /// Merge every entry of `other` into `self`.
    pub fn merge(&mut self, other: &StabilityTimestamp) -> bool {
        let mut advanced = false;
        for entry in other.iter() {
            advanced |= self.merge_report(*entry);
        }
        advanced
    }

    /// True when every entry of `other` is covered by `self` under the
    /// merge rule.
    pub fn covers(&self, other: &StabilityTimestamp) -> bool {
        other.iter().all(|entry| match self.get(entry.vbucket) {
            Some(mine) => !entry.supersedes(mine),
            None => false,
        })
    }
}

/// The full durable collection of stability timestamps, one per
/// `(stream, bucket)` pair. This is the unit persisted in the metadata
/// repository.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityCheckpoint {
    timestamps: Vec<StabilityTimestamp>,
}

impl StabilityCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StabilityTimestamp> {
        self.timestamps.iter()
    }

    pub fn timestamp(&self, stream_id: StreamId, bucket: &str) -> Option<&StabilityTimestamp> {
        self.timestamps
            .iter()
            .find(|ts| ts.stream_id == stream_id && ts.bucket == bucket)
    }

    fn timestamp_mut(&mut self, stream_id: StreamId, bucket: &str) -> &mut StabilityTimestamp {
        if let Some(idx) = self
            .timestamps
            .iter()
            .position(|ts| ts.stream_id == stream_id && ts.bucket == bucket)
        {
            return &mut self.timestamps[idx];
        }
        self.timestamps
            .push(StabilityTimestamp::new(stream_id, bucket));
        self.timestamps.last_mut().unwrap()
    }

    /// Merge a raw report into the checkpoint. Returns true when the
    /// checkpoint advanced.
    pub fn merge_report(&mut self, stream_id: StreamId, bucket: &str, report: TsVbuuid) -> bool {
        self.timestamp_mut(stream_id, bucket).merge_report(report)
    }

    /// Merge a whole stream timestamp into the checkpoint.
    pub fn merge_timestamp(&mut self, timestamp: &StabilityTimestamp) -> bool {
        self.timestamp_mut(timestamp.stream_id, &timestamp.bucket)
            .merge(timestamp)
    }

    /// Point lookup against the checkpoint.
    pub fn find(&self, stream_id: StreamId, bucket: &str, vbucket: u16) -> Option<(u64, u64)> {
        self.timestamp(stream_id, bucket)
            .and_then(|ts| ts.get(vbucket))
            .map(|entry| (entry.seqno, entry.epoch))
    }
}
