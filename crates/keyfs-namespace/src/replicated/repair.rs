//! Read-repair
//!
//! The first GREEN drive of a partition is the reference. Every other
//! writable drive is brought to the reference's state for a key: stale copies
//! are overwritten, copies the reference no longer has are deleted.
//! A version mismatch while repairing means another client fixed the copy
//! first, which is fine.

use super::ReplicatedNamespace;
use crate::drive::{DriveError, DriveResult, WriteRequest};
use futures::future::join_all;
use keyfs_common::{DriveRef, Error, PartitionId, Record, Result, Version, WriteMode};
use metrics::counter;
use tracing::{debug, warn};

/// What read-repair did to one drive's copy of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Copy already matched the reference
    InSync,
    /// Reference record written over a missing or stale copy
    Copied,
    /// Copy removed because the reference has none
    Deleted,
    /// Another writer changed the copy while we were repairing it
    Raced,
}

impl ReplicatedNamespace {
    /// Repair `key` in its partition and return the version all drives now hold
    pub async fn read_repair(&self, key: &str) -> Result<Option<Version>> {
        self.read_repair_in(self.partition_for(key), key).await
    }

    pub(crate) async fn read_repair_in(
        &self,
        partition_id: PartitionId,
        key: &str,
    ) -> Result<Option<Version>> {
        for _ in 0..=self.config.max_retries {
            let partition = self.partition(partition_id)?;
            let cluster_version = partition.cluster_version;
            let Some(reference) = partition.green_drives().next().cloned() else {
                return Err(Error::QuorumUnavailable(format!(
                    "partition {partition_id} has no GREEN drive to repair from"
                )));
            };

            let read = self
                .with_drive(&reference, |handle| async move {
                    handle.get(key, cluster_version).await
                })
                .await;
            let reference_record = match read {
                Ok(record) => Some(record),
                Err(DriveError::NotFound) => None,
                Err(DriveError::ClusterVersionMismatch { .. }) => {
                    self.refresh_partition(partition_id).await?;
                    continue;
                }
                Err(e) if e.is_unexpected() => {
                    warn!("Repair reference drive {} failed: {}", reference.id(), e);
                    self.disable_drive(partition_id, &reference.id()).await?;
                    continue;
                }
                Err(e) => return Err(e.into_error(key, cluster_version)),
            };

            let others: Vec<DriveRef> = partition
                .writable_drives()
                .filter(|d| d.id() != reference.id())
                .cloned()
                .collect();
            let results = join_all(others.iter().map(|drive| {
                self.repair_copy(drive, key, reference_record.as_ref(), cluster_version)
            }))
            .await;

            let mut settled = true;
            for (drive, result) in others.iter().zip(results) {
                match result {
                    Ok(RepairAction::InSync) => {}
                    Ok(action) => {
                        counter!("keyfs_read_repairs_total").increment(1);
                        debug!("Repaired '{}' on drive {}: {:?}", key, drive.id(), action);
                    }
                    Err(DriveError::ClusterVersionMismatch { .. }) => settled = false,
                    Err(e) if e.is_unexpected() => {
                        warn!("Repair of '{}' on drive {} failed: {}", key, drive.id(), e);
                        self.disable_drive(partition_id, &drive.id()).await?;
                    }
                    Err(e) => return Err(e.into_error(key, cluster_version)),
                }
            }
            if !settled {
                self.refresh_partition(partition_id).await?;
                continue;
            }
            return Ok(reference_record.map(|r| r.version));
        }
        Err(Error::QuorumUnavailable(format!(
            "repair of '{key}' did not settle after {} attempts",
            self.config.max_retries + 1
        )))
    }

    /// Bring one drive's copy of `key` to the reference state
    async fn repair_copy(
        &self,
        drive: &DriveRef,
        key: &str,
        reference: Option<&Record>,
        cluster_version: i64,
    ) -> DriveResult<RepairAction> {
        self.with_drive(drive, |handle| async move {
            let current = match handle.get_version(key, cluster_version).await {
                Ok(version) => Some(version),
                Err(DriveError::NotFound) => None,
                Err(e) => return Err(e),
            };

            let outcome = match (reference, current) {
                (None, None) => return Ok(RepairAction::InSync),
                (Some(record), Some(version)) if record.version == version => {
                    return Ok(RepairAction::InSync);
                }
                (None, Some(version)) => handle
                    .delete(key, Some(&version), WriteMode::Versioned, cluster_version)
                    .await
                    .map(|()| RepairAction::Deleted),
                (Some(record), current) => {
                    let request = WriteRequest {
                        key: key.to_string(),
                        value: record.value.clone(),
                        expected: current,
                        new_version: record.version.clone(),
                        mode: WriteMode::Versioned,
                        checksum_algorithm: record.checksum_algorithm,
                    };
                    handle
                        .put(&request, cluster_version)
                        .await
                        .map(|()| RepairAction::Copied)
                }
            };
            match outcome {
                Err(DriveError::VersionMismatch | DriveError::NotFound) => Ok(RepairAction::Raced),
                other => other,
            }
        })
        .await
    }
}
