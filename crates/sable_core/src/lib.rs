//! Shared types and collaborator contracts for the sable metadata plane.
//!
//! These types are kept in a small, dependency-light crate because they are
//! used by both the metadata manager and the transport/feed layers that
//! implement the `ReplicatedLog` and `MutationSource` contracts.

pub mod log;
pub mod stream;
pub mod timestamp;

pub use log::{LogEntry, OpCode, ReplicatedLog, Role};
pub use stream::{MutationSource, StreamControl, StreamHandle};
pub use timestamp::{StabilityCheckpoint, StabilityTimestamp, StreamId, TsVbuuid};
