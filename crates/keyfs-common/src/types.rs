//! Core type definitions for KeyFS
//!
//! This module defines the fundamental types shared by the namespace,
//! path-map and client layers: drive references, partitions, versioned
//! key-value records and capacity reports.

use crate::checksum::ChecksumAlgorithm;
use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separator between the routing segment of a key and the remainder
pub const SEGMENT_SEPARATOR: char = '|';

/// Exclusive upper bound usable for "scan everything" key ranges
pub const KEY_RANGE_END: &str = "\u{10FFFF}";

/// Return the routing segment of a key (everything before the first `|`)
#[must_use]
pub fn first_segment(key: &str) -> &str {
    key.split_once(SEGMENT_SEPARATOR)
        .map_or(key, |(segment, _)| segment)
}

/// Smallest key strictly greater than `key` (used to page through ranges)
#[must_use]
pub fn key_successor(key: &str) -> String {
    let mut next = String::with_capacity(key.len() + 1);
    next.push_str(key);
    next.push('\0');
    next
}

/// Identity of a drive (`host:port`)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into)]
#[display("{_0}")]
pub struct DriveId(String);

impl DriveId {
    /// Create a drive id from host and port
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriveId({})", self.0)
    }
}

/// Trust state of a drive within its partition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveStatus {
    /// Fully synchronized, used for reads and writes
    #[default]
    Green,
    /// Reachable but resynchronizing; receives writes, avoided for reads
    Yellow,
    /// Excluded from quorum
    Red,
}

impl DriveStatus {
    /// Whether the drive participates in writes
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Red)
    }
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
        };
        f.write_str(name)
    }
}

/// A drive as seen by a partition definition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveRef {
    pub host: String,
    pub port: u16,
    pub status: DriveStatus,
}

impl DriveRef {
    /// Create a GREEN drive reference
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            status: DriveStatus::Green,
        }
    }

    /// Identity of this drive
    #[must_use]
    pub fn id(&self) -> DriveId {
        DriveId::new(&self.host, self.port)
    }
}

/// Partition identifier (index into the cluster map)
pub type PartitionId = u32;

/// A fixed group of drives responsible for a hashed slice of the keyspace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub partition_id: PartitionId,
    pub drives: Vec<DriveRef>,
    /// Fencing token; every drive must be tagged with this value to accept requests
    pub cluster_version: i64,
    /// Partition that records keys written while a drive here is RED
    pub log_partition_id: Option<PartitionId>,
}

impl Partition {
    /// Create a partition with all drives GREEN at cluster version 0
    #[must_use]
    pub fn new(partition_id: PartitionId, drives: Vec<DriveRef>) -> Self {
        Self {
            partition_id,
            drives,
            cluster_version: 0,
            log_partition_id: None,
        }
    }

    /// Look up a drive by id
    #[must_use]
    pub fn drive(&self, id: &DriveId) -> Option<&DriveRef> {
        self.drives.iter().find(|d| &d.id() == id)
    }

    /// Mutable lookup of a drive by id
    pub fn drive_mut(&mut self, id: &DriveId) -> Option<&mut DriveRef> {
        self.drives.iter_mut().find(|d| &d.id() == id)
    }

    /// Drives that receive writes (GREEN and YELLOW)
    pub fn writable_drives(&self) -> impl Iterator<Item = &DriveRef> {
        self.drives.iter().filter(|d| d.status.is_writable())
    }

    /// Drives trusted for reads
    pub fn green_drives(&self) -> impl Iterator<Item = &DriveRef> {
        self.drives
            .iter()
            .filter(|d| d.status == DriveStatus::Green)
    }

    /// Whether any drive is excluded from quorum
    #[must_use]
    pub fn has_red(&self) -> bool {
        self.drives.iter().any(|d| d.status == DriveStatus::Red)
    }

    /// Whether every drive is GREEN
    #[must_use]
    pub fn all_green(&self) -> bool {
        self.drives.iter().all(|d| d.status == DriveStatus::Green)
    }
}

/// Optimistic-concurrency token attached to every stored record
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Version(String);

impl Version {
    /// Mint a fresh, globally unique version
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing token
    #[must_use]
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the token as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

/// Whether a write checks the expected version
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Reject the write unless the stored version matches the expected one
    #[default]
    Versioned,
    /// Overwrite regardless of the stored version
    Force,
}

/// A key-value record as returned by a drive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: Bytes,
    pub version: Version,
    pub checksum_algorithm: ChecksumAlgorithm,
}

/// Storage capacity report
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl Capacity {
    /// Bytes still available
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}
