//! Replicated, partition-aware namespace
//!
//! Every key belongs to exactly one partition, chosen by hashing the key's
//! first segment (the part before `|`). A partition is a fixed group of
//! drives; writes go to every drive that is not RED and must agree, reads go
//! to one GREEN drive picked at random.
//!
//! Disagreement is resolved locally:
//! - a fencing mismatch refreshes the partition definition and retries,
//! - an I/O error fails the drive out of the partition and retries,
//! - anything else is a partial write, settled by read-repair.

mod lifecycle;
mod partition;
mod repair;

pub use repair::RepairAction;

use crate::drive::{Drive, DriveError, DriveResult, WriteRequest};
use crate::namespace::Namespace;
use crate::pool::{DriveConnector, DrivePool};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, join_all};
use keyfs_common::config::NamespaceConfig;
use keyfs_common::{
    Capacity, DriveId, DriveRef, Error, Partition, PartitionId, Record, Result, Version,
    WriteMode, first_segment,
};
use metrics::counter;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};
use xxhash_rust::xxh64::xxh64;

/// A mutation sent to every writable drive of a partition
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Put(WriteRequest),
    Delete {
        expected: Option<Version>,
        mode: WriteMode,
    },
}

impl WriteOp {
    async fn apply(&self, drive: &Arc<dyn Drive>, key: &str, cluster_version: i64) -> DriveResult<()> {
        match self {
            Self::Put(request) => drive.put(request, cluster_version).await,
            Self::Delete { expected, mode } => {
                drive
                    .delete(key, expected.as_ref(), *mode, cluster_version)
                    .await
            }
        }
    }
}

/// Namespace replicated across partitions of drives
pub struct ReplicatedNamespace {
    partitions: RwLock<Vec<Partition>>,
    pool: DrivePool,
    config: NamespaceConfig,
}

impl ReplicatedNamespace {
    /// Create a namespace over the given cluster map
    pub fn new(
        partitions: Vec<Partition>,
        connector: Arc<dyn DriveConnector>,
        config: NamespaceConfig,
    ) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::Configuration("cluster has no partitions".into()));
        }
        for (index, partition) in partitions.iter().enumerate() {
            if partition.partition_id as usize != index {
                return Err(Error::Configuration(format!(
                    "partition at position {index} has id {}",
                    partition.partition_id
                )));
            }
        }
        Ok(Self {
            partitions: RwLock::new(partitions),
            pool: DrivePool::new(connector, config.request_timeout()),
            config,
        })
    }

    /// Partition responsible for a key
    #[allow(clippy::cast_possible_truncation)]
    pub fn partition_for(&self, key: &str) -> PartitionId {
        let count = self.partitions.read().len() as u64;
        (xxh64(first_segment(key).as_bytes(), 0) % count) as PartitionId
    }

    /// Current local view of one partition
    pub fn partition(&self, partition_id: PartitionId) -> Result<Partition> {
        self.partitions
            .read()
            .get(partition_id as usize)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("partition {partition_id}")))
    }

    /// Current local view of the whole cluster
    pub fn cluster_map(&self) -> Vec<Partition> {
        self.partitions.read().clone()
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    /// Replace a partition definition if the given one is newer
    pub(crate) fn install(&self, partition: Partition) -> bool {
        let mut partitions = self.partitions.write();
        match partitions.get_mut(partition.partition_id as usize) {
            Some(slot) if slot.cluster_version < partition.cluster_version => {
                *slot = partition;
                true
            }
            _ => false,
        }
    }

    /// Run one request against a drive through the pool, bounded by the request timeout
    pub(crate) async fn with_drive<T, F, Fut>(&self, drive: &DriveRef, op: F) -> DriveResult<T>
    where
        F: FnOnce(Arc<dyn Drive>) -> Fut,
        Fut: Future<Output = DriveResult<T>>,
    {
        let handle = self.pool.get(drive).await?;
        match tokio::time::timeout(self.config.request_timeout(), op(handle)).await {
            Ok(result) => result,
            Err(_) => Err(DriveError::Io(format!(
                "request to {} timed out",
                drive.id()
            ))),
        }
    }

    /// Execute a read against one random GREEN drive of a partition
    pub(crate) async fn execute_read<T, F, Fut>(
        &self,
        partition_id: PartitionId,
        context: &str,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn Drive>, i64) -> Fut + Send + Sync,
        Fut: Future<Output = DriveResult<T>> + Send,
        T: Send,
    {
        let mut failed: HashSet<DriveId> = HashSet::new();
        for _ in 0..=self.config.max_retries {
            let partition = self.partition(partition_id)?;
            let cluster_version = partition.cluster_version;
            let Some(drive) = pick_green(&partition, &failed) else {
                return Err(Error::QuorumUnavailable(format!(
                    "no reachable GREEN drive in partition {partition_id}"
                )));
            };

            match self
                .with_drive(&drive, |handle| op(handle, cluster_version))
                .await
            {
                Ok(value) => return Ok(value),
                Err(DriveError::ClusterVersionMismatch { drive_version }) => {
                    debug!(
                        "Drive {} is at cluster version {}, partition {} expected {}",
                        drive.id(),
                        drive_version,
                        partition_id,
                        cluster_version
                    );
                    self.refresh_partition(partition_id).await?;
                }
                Err(e) if e.is_unexpected() => {
                    warn!("Read of '{}' from drive {} failed: {}", context, drive.id(), e);
                    failed.insert(drive.id());
                    if let Err(disable_err) = self.disable_drive(partition_id, &drive.id()).await {
                        warn!("Could not disable drive {}: {}", drive.id(), disable_err);
                    }
                }
                Err(e) => return Err(e.into_error(context, cluster_version)),
            }
        }
        Err(Error::QuorumUnavailable(format!(
            "read of '{context}' did not settle after {} attempts",
            self.config.max_retries + 1
        )))
    }

    /// Execute a mutation against every writable drive of a partition
    pub(crate) async fn execute_write(
        &self,
        partition_id: PartitionId,
        key: &str,
        op: &WriteOp,
        log_keys: bool,
    ) -> Result<()> {
        // Set once any drive has accepted this exact mutation, so a retry that
        // sees our own write as a mismatch is not mistaken for a conflict.
        let mut applied_somewhere = false;

        for _ in 0..=self.config.max_retries {
            let partition = self.partition(partition_id)?;
            let cluster_version = partition.cluster_version;
            if log_keys && partition.has_red() {
                self.log_key(&partition, key).await;
            }

            let targets: Vec<DriveRef> = partition.writable_drives().cloned().collect();
            if targets.is_empty() {
                return Err(Error::QuorumUnavailable(format!(
                    "partition {partition_id} has no writable drive"
                )));
            }

            let results = join_all(targets.iter().map(|drive| {
                self.with_drive(drive, |handle| async move {
                    op.apply(&handle, key, cluster_version).await
                })
            }))
            .await;
            applied_somewhere |= results.iter().any(std::result::Result::is_ok);

            if results
                .iter()
                .any(|r| matches!(r, Err(DriveError::ClusterVersionMismatch { .. })))
            {
                debug!("Fencing mismatch writing '{}', refreshing partition {}", key, partition_id);
                counter!("keyfs_fencing_refreshes_total").increment(1);
                self.refresh_partition(partition_id).await?;
                continue;
            }

            let failed = targets.iter().zip(&results).find_map(|(drive, result)| match result {
                Err(e) if e.is_unexpected() => Some((drive, e.clone())),
                _ => None,
            });
            if let Some((drive, err)) = failed {
                warn!("Write of '{}' to drive {} failed: {}", key, drive.id(), err);
                match self.disable_drive(partition_id, &drive.id()).await {
                    Ok(()) => continue,
                    Err(disable_err) => {
                        error!("Could not disable drive {}: {}", drive.id(), disable_err);
                        return Err(err.into_error(key, cluster_version));
                    }
                }
            }

            let first = &results[0];
            if results.iter().all(|r| r == first) && (first.is_ok() || !applied_somewhere) {
                return first.clone().map_err(|e| e.into_error(key, cluster_version));
            }

            counter!("keyfs_partial_writes_total").increment(1);
            warn!("Partial write of '{}' in partition {}, repairing", key, partition_id);
            return self.resolve_partial_write(partition_id, key, op).await;
        }
        Err(Error::QuorumUnavailable(format!(
            "write of '{key}' did not settle after {} attempts",
            self.config.max_retries + 1
        )))
    }

    /// Decide a partial write by repairing the key and comparing versions.
    ///
    /// If the repair itself fails the outcome stays unknown and the caller
    /// gets `PartialWrite`.
    async fn resolve_partial_write(
        &self,
        partition_id: PartitionId,
        key: &str,
        op: &WriteOp,
    ) -> Result<()> {
        let settled = match self.read_repair_in(partition_id, key).await {
            Ok(settled) => settled,
            Err(e @ Error::QuorumUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!("Could not settle partial write of '{}': {}", key, e);
                return Err(Error::PartialWrite {
                    key: key.to_string(),
                });
            }
        };
        let won = match op {
            WriteOp::Put(request) => settled.as_ref() == Some(&request.new_version),
            WriteOp::Delete { .. } => settled.is_none(),
        };
        if won {
            Ok(())
        } else {
            Err(Error::conflict(key))
        }
    }

    /// Record a key written while its partition has a RED drive
    fn log_key<'a>(&'a self, partition: &'a Partition, key: &'a str) -> BoxFuture<'a, ()> {
        async move {
            let Some(log_partition) = partition.log_partition_id else {
                return;
            };
            if log_partition == partition.partition_id {
                return;
            }
            let log_key = partition::keylog_key(partition.partition_id, key);
            let op = WriteOp::Put(WriteRequest::create(log_key.clone(), Bytes::new()).force());
            if let Err(e) = self.execute_write(log_partition, &log_key, &op, false).await {
                counter!("keyfs_key_log_failures_total").increment(1);
                warn!(
                    "Failed to log key '{}' to partition {}: {}",
                    key, log_partition, e
                );
            }
        }
        .boxed()
    }

    /// List keys of one partition
    pub(crate) async fn key_range_in(
        &self,
        partition_id: PartitionId,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.execute_read(partition_id, start, |drive, cv| async move {
            drive.get_key_range(start, end, limit, cv).await
        })
        .await
    }

    /// Refresh every partition definition from the drives
    pub async fn refresh_all(&self) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        for partition_id in 0..self.partition_count() as PartitionId {
            self.refresh_partition(partition_id).await?;
        }
        Ok(())
    }
}

/// Pick a random GREEN drive that has not failed during this operation
fn pick_green(partition: &Partition, failed: &HashSet<DriveId>) -> Option<DriveRef> {
    let candidates: Vec<&DriveRef> = partition
        .green_drives()
        .filter(|d| !failed.contains(&d.id()))
        .collect();
    candidates
        .choose(&mut rand::thread_rng())
        .map(|d| (*d).clone())
}

#[async_trait]
impl Namespace for ReplicatedNamespace {
    async fn get(&self, key: &str) -> Result<Record> {
        let partition_id = self.partition_for(key);
        self.execute_read(partition_id, key, |drive, cv| async move {
            drive.get(key, cv).await
        })
        .await
    }

    async fn get_version(&self, key: &str) -> Result<Version> {
        let partition_id = self.partition_for(key);
        self.execute_read(partition_id, key, |drive, cv| async move {
            drive.get_version(key, cv).await
        })
        .await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Version>,
        mode: WriteMode,
    ) -> Result<Version> {
        let mut request = WriteRequest::new(key, value, expected.cloned());
        request.mode = mode;
        let new_version = request.new_version.clone();
        let partition_id = self.partition_for(key);
        self.execute_write(partition_id, key, &WriteOp::Put(request), true)
            .await?;
        Ok(new_version)
    }

    async fn delete(&self, key: &str, expected: Option<&Version>, mode: WriteMode) -> Result<()> {
        let op = WriteOp::Delete {
            expected: expected.cloned(),
            mode,
        };
        let partition_id = self.partition_for(key);
        self.execute_write(partition_id, key, &op, true).await
    }

    async fn get_key_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<String>> {
        let partition_id = self.partition_for(start);
        self.key_range_in(partition_id, start, end, limit).await
    }

    async fn capacity(&self) -> Result<Capacity> {
        let mut total = Capacity::default();
        #[allow(clippy::cast_possible_truncation)]
        for partition_id in 0..self.partition_count() as PartitionId {
            let capacity = self
                .execute_read(partition_id, "capacity", |drive, cv| async move {
                    drive.capacity(cv).await
                })
                .await?;
            total.total_bytes += capacity.total_bytes;
            total.used_bytes += capacity.used_bytes;
        }
        Ok(total)
    }

    async fn self_check(&self) -> Result<bool> {
        let mut healthy = true;
        for partition in self.cluster_map() {
            if let Err(e) = partition::test_partition(&partition) {
                warn!("{}", e);
                healthy = false;
            }
            let cluster_version = partition.cluster_version;
            for drive in partition.writable_drives() {
                let probe = self
                    .with_drive(drive, |handle| async move { handle.noop(cluster_version).await })
                    .await;
                if let Err(e) = probe {
                    warn!(
                        "Self-check: drive {} in partition {} failed: {}",
                        drive.id(),
                        partition.partition_id,
                        e
                    );
                    healthy = false;
                }
            }
        }
        Ok(healthy)
    }
}
