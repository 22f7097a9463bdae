//! Partition definitions and their convergence
//!
//! A partition definition is stored on the partition's own drives under
//! `partition|{id}|{cluster_version}`. Publishing version N+1 is a create-only
//! write of that key on each surviving drive, in partition order, followed by
//! moving the drive's fencing token from N to N+1. The first drive acts as the
//! arbiter: only one writer can create version N+1 there.

use super::ReplicatedNamespace;
use crate::drive::{DriveError, DriveResult, WriteRequest};
use bytes::Bytes;
use keyfs_common::{DriveId, DriveRef, Error, Partition, PartitionId, Result};
use metrics::counter;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Key prefix of stored partition definitions
pub(crate) const PARTITION_PREFIX: &str = "partition|";

/// Key prefix of keys logged for RED drives
pub(crate) const KEYLOG_PREFIX: &str = "keylog|";

/// Key of a stored partition definition
pub(crate) fn partition_key(partition_id: PartitionId, cluster_version: i64) -> String {
    format!("{PARTITION_PREFIX}{partition_id}|{cluster_version:020}")
}

/// Key recording that `key` of `partition_id` changed while a drive was RED
pub(crate) fn keylog_key(partition_id: PartitionId, key: &str) -> String {
    format!("{KEYLOG_PREFIX}{partition_id}|{key}")
}

/// Bounds of every logged key for a partition
pub(crate) fn keylog_range(partition_id: PartitionId) -> (String, String) {
    (
        format!("{KEYLOG_PREFIX}{partition_id}|"),
        format!("{KEYLOG_PREFIX}{partition_id}}}"),
    )
}

/// Reject topologies that cannot tell a drive failure from a network split
pub(crate) fn test_partition(partition: &Partition) -> Result<()> {
    if partition.green_drives().next().is_none() {
        return Err(Error::QuorumUnavailable(format!(
            "partition {} would have no GREEN drive",
            partition.partition_id
        )));
    }
    if partition.drives.len() == 2 && partition.has_red() && partition.log_partition_id.is_none()
    {
        return Err(Error::QuorumUnavailable(format!(
            "two-drive partition {} cannot lose a drive without a log partition",
            partition.partition_id
        )));
    }
    Ok(())
}

fn encode(partition: &Partition) -> Result<Bytes> {
    bincode::serialize(partition)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> DriveResult<Partition> {
    bincode::deserialize(bytes)
        .map_err(|e| DriveError::Corruption(format!("undecodable partition definition: {e}")))
}

impl ReplicatedNamespace {
    /// Publish `updated` (version N+1) on every surviving drive.
    ///
    /// Drives are expected at `previous_version` unless `fences` names another
    /// token for them (a drive rejoining with an old token).
    pub(crate) async fn persist_partition(
        &self,
        previous_version: i64,
        updated: &Partition,
        fences: &HashMap<DriveId, i64>,
    ) -> Result<()> {
        let key = partition_key(updated.partition_id, updated.cluster_version);
        let request = WriteRequest::create(key.clone(), encode(updated)?);
        let request = &request;
        let new_version = updated.cluster_version;

        for drive in updated.writable_drives() {
            let fence = fences.get(&drive.id()).copied().unwrap_or(previous_version);
            let stored = self
                .with_drive(drive, |handle| async move { handle.put(request, fence).await })
                .await;
            match stored {
                Ok(()) => {}
                Err(DriveError::VersionMismatch) => {
                    debug!("Partition definition {} already published", key);
                    return Err(Error::conflict(&key));
                }
                Err(e) => return Err(e.into_error(&key, fence)),
            }
            self.with_drive(drive, |handle| async move {
                handle.set_cluster_version(fence, new_version).await
            })
            .await
            .map_err(|e| e.into_error(&key, fence))?;
        }

        self.install(updated.clone());
        info!(
            "Partition {} now at cluster version {}",
            updated.partition_id, new_version
        );
        Ok(())
    }

    async fn read_definition(
        &self,
        drive: &DriveRef,
        partition_id: PartitionId,
        cluster_version: i64,
        fence: i64,
    ) -> DriveResult<Option<Partition>> {
        let key = partition_key(partition_id, cluster_version);
        let key = key.as_str();
        match self
            .with_drive(drive, |handle| async move { handle.get(key, fence).await })
            .await
        {
            Ok(record) => decode(&record.value).map(Some),
            Err(DriveError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Converge on the newest partition definition any drive knows about.
    ///
    /// Each drive reports its fencing token; definitions from that token on
    /// are probed in increasing order. The highest version wins, ties going to
    /// the first drive in partition order. Drives whose token lags the winner
    /// (a half-finished publish) are rolled forward.
    pub async fn refresh_partition(&self, partition_id: PartitionId) -> Result<Partition> {
        counter!("keyfs_partition_refreshes_total").increment(1);
        let current = self.partition(partition_id)?;
        let current_version = current.cluster_version;
        let mut best = current.clone();
        let mut reported: Vec<(DriveRef, i64)> = Vec::new();

        for drive in current.writable_drives() {
            let probe = self
                .with_drive(drive, |handle| async move { handle.noop(current_version).await })
                .await;
            let fence = match probe {
                Ok(()) => current_version,
                Err(DriveError::ClusterVersionMismatch { drive_version }) => drive_version,
                Err(e) => {
                    debug!("Skipping drive {} during refresh: {}", drive.id(), e);
                    continue;
                }
            };
            reported.push((drive.clone(), fence));

            let mut version = fence.max(best.cluster_version + 1);
            loop {
                match self
                    .read_definition(drive, partition_id, version, fence)
                    .await
                {
                    Ok(Some(definition)) => {
                        if definition.cluster_version > best.cluster_version {
                            best = definition;
                        }
                        version += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(
                            "Failed to read partition {} version {} from drive {}: {}",
                            partition_id,
                            version,
                            drive.id(),
                            e
                        );
                        break;
                    }
                }
            }
        }

        if best.cluster_version > current_version && self.install(best.clone()) {
            info!(
                "Partition {} refreshed from cluster version {} to {}",
                partition_id, current_version, best.cluster_version
            );
        }
        self.roll_forward(&best, &reported).await;
        self.partition(partition_id)
    }

    /// Move lagging surviving drives to the winning definition's token
    async fn roll_forward(&self, best: &Partition, reported: &[(DriveRef, i64)]) {
        let new_version = best.cluster_version;
        let key = partition_key(best.partition_id, new_version);
        let request = match encode(best) {
            Ok(value) => WriteRequest::create(key.clone(), value),
            Err(e) => {
                warn!("Cannot encode partition {}: {}", best.partition_id, e);
                return;
            }
        };
        let request = &request;

        for (drive, fence) in reported {
            let fence = *fence;
            let surviving = best
                .drive(&drive.id())
                .is_some_and(|d| d.status.is_writable());
            if fence >= new_version || !surviving {
                continue;
            }

            let stored = self
                .with_drive(drive, |handle| async move { handle.put(request, fence).await })
                .await;
            if let Err(e) = stored {
                if e != DriveError::VersionMismatch {
                    warn!("Failed to copy {} to drive {}: {}", key, drive.id(), e);
                    continue;
                }
            }
            match self
                .with_drive(drive, |handle| async move {
                    handle.set_cluster_version(fence, new_version).await
                })
                .await
            {
                Ok(()) => info!(
                    "Rolled drive {} forward from cluster version {} to {}",
                    drive.id(),
                    fence,
                    new_version
                ),
                Err(e) => warn!("Failed to roll drive {} forward: {}", drive.id(), e),
            }
        }
    }
}
