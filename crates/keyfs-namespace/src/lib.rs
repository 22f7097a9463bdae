//! KeyFS namespace layer
//!
//! Exact-key storage with versioned writes over a set of drives. A
//! [`SimpleNamespace`] fronts a single drive; a [`ReplicatedNamespace`]
//! hashes keys onto partitions of replicated drives and keeps them
//! consistent through fencing, drive lifecycle and read-repair.

pub mod drive;
pub mod memory;
pub mod namespace;
pub mod pool;
pub mod redb_drive;
pub mod replicated;

pub use drive::{Drive, DriveError, DriveResult, WriteRequest};
pub use memory::{MemoryConnector, MemoryDrive};
pub use namespace::{Namespace, SimpleNamespace};
pub use pool::{DriveConnector, DrivePool};
pub use redb_drive::{RedbConnector, RedbDrive};
pub use replicated::{RepairAction, ReplicatedNamespace};
