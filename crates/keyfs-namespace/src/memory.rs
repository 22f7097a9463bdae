//! In-memory drive
//!
//! Behaves like a real drive (fencing, optimistic concurrency, checksums) and
//! adds fault injection: a drive can be taken offline, and records can be
//! written or corrupted behind the protocol's back to simulate divergence.

use crate::drive::{
    Drive, DriveError, DriveResult, WriteRequest, check_delete, check_fence, check_put,
};
use crate::pool::DriveConnector;
use async_trait::async_trait;
use bytes::Bytes;
use keyfs_common::{
    Capacity, Checksum, ChecksumAlgorithm, DriveId, DriveRef, Partition, Record, Version,
    WriteMode,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

const DEFAULT_TOTAL_BYTES: u64 = 1 << 30;

#[derive(Clone)]
struct StoredRecord {
    version: Version,
    value: Bytes,
    checksum: Checksum,
}

impl StoredRecord {
    fn new(value: Bytes, version: Version, algorithm: ChecksumAlgorithm) -> Self {
        let checksum = algorithm.compute(&value);
        Self {
            version,
            value,
            checksum,
        }
    }
}

struct DriveState {
    records: BTreeMap<String, StoredRecord>,
    cluster_version: i64,
    online: bool,
}

/// A drive that keeps its records in memory
pub struct MemoryDrive {
    id: DriveId,
    state: Mutex<DriveState>,
    total_bytes: u64,
}

impl MemoryDrive {
    /// Create an empty, online drive at cluster version 0
    pub fn new(id: DriveId) -> Self {
        Self {
            id,
            state: Mutex::new(DriveState {
                records: BTreeMap::new(),
                cluster_version: 0,
                online: true,
            }),
            total_bytes: DEFAULT_TOTAL_BYTES,
        }
    }

    /// Simulate the drive going away (every request fails with an I/O error)
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Current fencing token
    pub fn cluster_version(&self) -> i64 {
        self.state.lock().cluster_version
    }

    /// Version stored for `key`, bypassing fencing
    pub fn version_of(&self, key: &str) -> Option<Version> {
        self.state.lock().records.get(key).map(|r| r.version.clone())
    }

    /// Value stored for `key`, bypassing fencing
    pub fn value_of(&self, key: &str) -> Option<Bytes> {
        self.state.lock().records.get(key).map(|r| r.value.clone())
    }

    /// All keys held by the drive
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().records.keys().cloned().collect()
    }

    /// Write a record directly, bypassing fencing and version checks
    pub fn insert_raw(&self, key: &str, value: Bytes, version: Version) {
        let record = StoredRecord::new(value, version, ChecksumAlgorithm::default());
        self.state.lock().records.insert(key.to_string(), record);
    }

    /// Remove a record directly
    pub fn remove_raw(&self, key: &str) {
        self.state.lock().records.remove(key);
    }

    /// Damage the stored value without updating its checksum
    pub fn corrupt(&self, key: &str) {
        if let Some(record) = self.state.lock().records.get_mut(key) {
            let mut damaged = record.value.to_vec();
            damaged.push(0xFF);
            record.value = Bytes::from(damaged);
        }
    }

    fn with_state<T>(
        &self,
        cluster_version: i64,
        f: impl FnOnce(&mut DriveState) -> DriveResult<T>,
    ) -> DriveResult<T> {
        let mut state = self.state.lock();
        if !state.online {
            return Err(DriveError::Io(format!("drive {} is offline", self.id)));
        }
        check_fence(state.cluster_version, cluster_version)?;
        f(&mut state)
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    fn id(&self) -> &DriveId {
        &self.id
    }

    async fn get(&self, key: &str, cluster_version: i64) -> DriveResult<Record> {
        self.with_state(cluster_version, |state| {
            let stored = state.records.get(key).ok_or(DriveError::NotFound)?;
            if !stored.checksum.verify(&stored.value) {
                return Err(DriveError::Corruption(format!(
                    "stored {} {}",
                    stored.checksum.algorithm,
                    stored.checksum.to_hex()
                )));
            }
            Ok(Record {
                key: key.to_string(),
                value: stored.value.clone(),
                version: stored.version.clone(),
                checksum_algorithm: stored.checksum.algorithm,
            })
        })
    }

    async fn get_version(&self, key: &str, cluster_version: i64) -> DriveResult<Version> {
        self.with_state(cluster_version, |state| {
            state
                .records
                .get(key)
                .map(|r| r.version.clone())
                .ok_or(DriveError::NotFound)
        })
    }

    async fn put(&self, request: &WriteRequest, cluster_version: i64) -> DriveResult<()> {
        self.with_state(cluster_version, |state| {
            check_put(
                state.records.get(&request.key).map(|r| &r.version),
                request,
            )?;
            let record = StoredRecord::new(
                request.value.clone(),
                request.new_version.clone(),
                request.checksum_algorithm,
            );
            state.records.insert(request.key.clone(), record);
            Ok(())
        })
    }

    async fn delete(
        &self,
        key: &str,
        expected: Option<&Version>,
        mode: WriteMode,
        cluster_version: i64,
    ) -> DriveResult<()> {
        self.with_state(cluster_version, |state| {
            check_delete(state.records.get(key).map(|r| &r.version), expected, mode)?;
            state.records.remove(key);
            Ok(())
        })
    }

    async fn get_key_range(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        cluster_version: i64,
    ) -> DriveResult<Vec<String>> {
        self.with_state(cluster_version, |state| {
            if start >= end {
                return Ok(Vec::new());
            }
            Ok(state
                .records
                .range::<str, _>((Bound::Included(start), Bound::Excluded(end)))
                .take(limit)
                .map(|(k, _)| k.clone())
                .collect())
        })
    }

    async fn capacity(&self, cluster_version: i64) -> DriveResult<Capacity> {
        self.with_state(cluster_version, |state| {
            let used_bytes = state
                .records
                .iter()
                .map(|(k, r)| (k.len() + r.value.len()) as u64)
                .sum();
            Ok(Capacity {
                total_bytes: self.total_bytes,
                used_bytes,
            })
        })
    }

    async fn noop(&self, cluster_version: i64) -> DriveResult<()> {
        self.with_state(cluster_version, |_| Ok(()))
    }

    async fn set_cluster_version(&self, current: i64, new: i64) -> DriveResult<()> {
        self.with_state(current, |state| {
            state.cluster_version = new;
            Ok(())
        })
    }
}

/// Connector over a fixed set of in-memory drives
#[derive(Default)]
pub struct MemoryConnector {
    drives: RwLock<HashMap<DriveId, Arc<MemoryDrive>>>,
}

impl MemoryConnector {
    /// Create one empty drive for every drive named by the partitions
    pub fn for_partitions(partitions: &[Partition]) -> Self {
        let connector = Self::default();
        for drive in partitions.iter().flat_map(|p| &p.drives) {
            connector.register(drive.id());
        }
        connector
    }

    /// Add a drive, returning the existing one if already registered
    pub fn register(&self, id: DriveId) -> Arc<MemoryDrive> {
        let mut drives = self.drives.write();
        Arc::clone(
            drives
                .entry(id.clone())
                .or_insert_with(|| Arc::new(MemoryDrive::new(id))),
        )
    }

    /// Look up a registered drive
    pub fn drive(&self, id: &DriveId) -> Option<Arc<MemoryDrive>> {
        self.drives.read().get(id).cloned()
    }
}

#[async_trait]
impl DriveConnector for MemoryConnector {
    async fn connect(&self, drive: &DriveRef) -> DriveResult<Arc<dyn Drive>> {
        let id = drive.id();
        match self.drive(&id) {
            Some(handle) => Ok(handle as Arc<dyn Drive>),
            None => Err(DriveError::Io(format!("no route to drive {id}"))),
        }
    }
}
