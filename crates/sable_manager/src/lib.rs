//! Metadata-coordination core of a distributed secondary-indexing service.
//!
//! Any node can durably create/drop index definitions, track per-bucket
//! index topology, and follow cluster-wide stability timestamps. Metadata
//! writes are linearized through a majority-replicated log (the
//! [`sable_core::ReplicatedLog`] collaborator); stream checkpoints are
//! aggregated from the upstream mutation feed (the
//! [`sable_core::MutationSource`] collaborator) by leader-only services that
//! the [`manager::IndexManager`] starts and stops as this node's role
//! changes.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod manager;
pub mod repo;
pub mod request_handler;
pub mod stream_manager;
pub mod timekeeper;
pub mod topology;

pub use config::ManagerConfig;
pub use error::MetaError;
pub use event::{EventKind, EventManager, MetaEvent};
pub use manager::IndexManager;
pub use repo::MetadataRepo;
pub use timekeeper::{PersistPolicy, TimestampReport};
pub use topology::{
    DefnId, GlobalTopology, IndexDefn, IndexInstance, IndexState, IndexTopology, InstId,
};
