//! Coordinator-side cluster state: the consistent-hash ring that assigns
//! partition keys to shards, the replica registry with TTL-based liveness
//! and first-come leader election, and the table registry.

mod registry;
mod ring;
mod tables;

pub use registry::{ReplicaRecord, ReplicaRegistry};
pub use ring::{HashRing, DEFAULT_VNODES};
pub use tables::TableRegistry;
