//! Drive lifecycle: GREEN -> RED on failure, RED -> YELLOW on return,
//! YELLOW -> GREEN once resynchronized.
//!
//! Every transition bumps the partition's cluster version and is published
//! through the partition definition, so all clients agree on membership.

use super::partition::{PARTITION_PREFIX, keylog_range, test_partition};
use super::{ReplicatedNamespace, WriteOp};
use crate::drive::DriveError;
use keyfs_common::{
    DriveId, DriveRef, DriveStatus, Error, KEY_RANGE_END, Partition, PartitionId, Result,
    WriteMode, key_successor,
};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

impl ReplicatedNamespace {
    /// Apply a topology change, retrying against refreshed state on races.
    ///
    /// `change` returns `None` when the partition already has the wanted
    /// shape. Returns the published definition, if any.
    async fn change_topology<F>(
        &self,
        partition_id: PartitionId,
        fences: &HashMap<DriveId, i64>,
        change: F,
    ) -> Result<Option<Partition>>
    where
        F: Fn(&Partition) -> Result<Option<Partition>> + Send + Sync,
    {
        for _ in 0..=self.config.max_retries {
            let current = self.partition(partition_id)?;
            let Some(mut updated) = change(&current)? else {
                return Ok(None);
            };
            updated.cluster_version = current.cluster_version + 1;
            test_partition(&updated)?;

            match self
                .persist_partition(current.cluster_version, &updated, fences)
                .await
            {
                Ok(()) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() || matches!(e, Error::ClusterFencingMismatch { .. }) => {
                    debug!("Topology change of partition {} raced: {}", partition_id, e);
                    self.refresh_partition(partition_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::QuorumUnavailable(format!(
            "topology change of partition {partition_id} did not settle"
        )))
    }

    /// Another partition whose drives are all GREEN, to hold logged keys
    fn choose_log_partition(&self, partition_id: PartitionId) -> Option<PartitionId> {
        let partitions = self.cluster_map();
        let count = partitions.len();
        (1..count)
            .map(|offset| &partitions[(partition_id as usize + offset) % count])
            .find(|p| p.all_green())
            .map(|p| p.partition_id)
    }

    /// Fail a drive out of its partition
    pub async fn disable_drive(&self, partition_id: PartitionId, drive_id: &DriveId) -> Result<()> {
        let published = self
            .change_topology(partition_id, &HashMap::new(), |current| {
                let drive = current
                    .drive(drive_id)
                    .ok_or_else(|| Error::not_found(format!("drive {drive_id}")))?;
                if drive.status == DriveStatus::Red {
                    return Ok(None);
                }
                // Logging is only trustworthy if it starts at the first failure
                let first_failure = current.all_green();
                let mut updated = current.clone();
                if let Some(drive) = updated.drive_mut(drive_id) {
                    drive.status = DriveStatus::Red;
                }
                if updated.log_partition_id.is_none() && first_failure {
                    updated.log_partition_id = self.choose_log_partition(partition_id);
                }
                Ok(Some(updated))
            })
            .await?;

        if let Some(partition) = published {
            counter!("keyfs_drive_failures_total").increment(1);
            warn!(
                "Drive {} in partition {} marked RED (cluster version {}, log partition {:?})",
                drive_id, partition_id, partition.cluster_version, partition.log_partition_id
            );
        }
        Ok(())
    }

    /// Discover the fencing token a drive is actually at
    async fn probe_drive_version(&self, drive: &DriveRef, guess: i64) -> Result<i64> {
        let mut guess = guess;
        for _ in 0..=self.config.max_retries {
            let probe = self
                .with_drive(drive, |handle| async move { handle.noop(guess).await })
                .await;
            match probe {
                Ok(()) => return Ok(guess),
                Err(DriveError::ClusterVersionMismatch { drive_version }) => {
                    debug!("Drive {} rejected token {}, trying {}", drive.id(), guess, drive_version);
                    guess = drive_version;
                }
                Err(e) => return Err(e.into_error("noop", guess)),
            }
        }
        Err(Error::QuorumUnavailable(format!(
            "drive {} did not accept any fencing token",
            drive.id()
        )))
    }

    /// Bring a RED drive back as YELLOW and resynchronize it in the background.
    ///
    /// A drive that is already YELLOW (an interrupted resync) is resynchronized
    /// again. The returned handle resolves once the drive is GREEN.
    pub async fn enable_drive(
        self: &Arc<Self>,
        partition_id: PartitionId,
        drive_id: &DriveId,
    ) -> Result<JoinHandle<Result<()>>> {
        let partition = self.partition(partition_id)?;
        let drive = partition
            .drive(drive_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("drive {drive_id}")))?;

        match drive.status {
            DriveStatus::Green => {
                return Err(Error::invalid_argument(format!(
                    "drive {drive_id} is already GREEN"
                )));
            }
            DriveStatus::Yellow => {
                info!("Resuming resynchronization of drive {}", drive_id);
            }
            DriveStatus::Red => {
                let drive_version = self
                    .probe_drive_version(&drive, partition.cluster_version)
                    .await?;
                let fences = HashMap::from([(drive_id.clone(), drive_version)]);
                self.change_topology(partition_id, &fences, |current| {
                    if current.drive(drive_id).map(|d| d.status) != Some(DriveStatus::Red) {
                        return Ok(None);
                    }
                    let mut updated = current.clone();
                    if let Some(drive) = updated.drive_mut(drive_id) {
                        drive.status = DriveStatus::Yellow;
                    }
                    Ok(Some(updated))
                })
                .await?;
                info!(
                    "Drive {} in partition {} marked YELLOW (was at cluster version {})",
                    drive_id, partition_id, drive_version
                );
            }
        }

        let ns = Arc::clone(self);
        let drive_id = drive_id.clone();
        Ok(tokio::spawn(async move {
            ns.synchronize_drive(partition_id, &drive_id).await
        }))
    }

    /// Resynchronize a YELLOW drive and mark it GREEN.
    ///
    /// On any failure the drive stays YELLOW.
    pub async fn synchronize_drive(&self, partition_id: PartitionId, drive_id: &DriveId) -> Result<()> {
        let partition = self.partition(partition_id)?;
        info!(
            "Resynchronizing drive {} in partition {} ({})",
            drive_id,
            partition_id,
            if partition.log_partition_id.is_some() { "key log" } else { "full scan" }
        );

        let replayed = match partition.log_partition_id {
            Some(log_partition) => self.resync_from_log(partition_id, log_partition).await,
            None => self.resync_full_scan(partition_id, drive_id).await,
        };
        let replayed = match replayed {
            Ok(count) => count,
            Err(e) => {
                warn!("Resync of drive {} failed, it stays YELLOW: {}", drive_id, e);
                return Err(e);
            }
        };

        self.change_topology(partition_id, &HashMap::new(), |current| {
            match current.drive(drive_id).map(|d| d.status) {
                Some(DriveStatus::Yellow) => {}
                Some(DriveStatus::Green) => return Ok(None),
                Some(DriveStatus::Red) => {
                    return Err(Error::invalid_argument(format!(
                        "drive {drive_id} failed during resync"
                    )));
                }
                None => return Err(Error::not_found(format!("drive {drive_id}"))),
            }
            let mut updated = current.clone();
            if let Some(drive) = updated.drive_mut(drive_id) {
                drive.status = DriveStatus::Green;
            }
            if updated.all_green() {
                updated.log_partition_id = None;
            }
            Ok(Some(updated))
        })
        .await?;

        info!(
            "Drive {} in partition {} is GREEN after repairing {} keys",
            drive_id, partition_id, replayed
        );
        Ok(())
    }

    /// Repair every key logged for the partition while a drive was RED
    async fn resync_from_log(
        &self,
        partition_id: PartitionId,
        log_partition: PartitionId,
    ) -> Result<usize> {
        let (start, end) = keylog_range(partition_id);
        let page = self.config.key_range_page_size.max(1);
        let mut cursor = start.clone();
        let mut replayed = 0;

        loop {
            let logged = self
                .key_range_in(log_partition, &cursor, &end, page)
                .await?;
            let Some(last) = logged.last() else {
                break;
            };
            cursor = key_successor(last);

            // Another RED drive still needs these entries
            let keep_log = self.partition(partition_id)?.has_red();
            for log_key in &logged {
                let key = &log_key[start.len()..];
                self.read_repair_in(partition_id, key).await?;
                replayed += 1;
                if keep_log {
                    continue;
                }
                let op = WriteOp::Delete {
                    expected: None,
                    mode: WriteMode::Force,
                };
                match self.execute_write(log_partition, log_key, &op, false).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("Failed to remove logged key '{}': {}", log_key, e),
                }
            }
            if logged.len() < page {
                break;
            }
        }
        Ok(replayed)
    }

    /// Repair every key held by a GREEN sibling or by the drive itself
    async fn resync_full_scan(&self, partition_id: PartitionId, drive_id: &DriveId) -> Result<usize> {
        let page = self.config.key_range_page_size.max(1);
        let mut repaired = 0;

        // Keys the partition has
        let mut cursor = String::new();
        loop {
            let keys = self
                .key_range_in(partition_id, &cursor, KEY_RANGE_END, page)
                .await?;
            let Some(last) = keys.last() else {
                break;
            };
            cursor = key_successor(last);
            for key in keys.iter().filter(|k| !k.starts_with(PARTITION_PREFIX)) {
                self.read_repair_in(partition_id, key).await?;
                repaired += 1;
            }
            if keys.len() < page {
                break;
            }
        }

        // Keys only the returning drive has (deleted while it was away)
        let mut cursor = String::new();
        loop {
            let partition = self.partition(partition_id)?;
            let cluster_version = partition.cluster_version;
            let drive = partition
                .drive(drive_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("drive {drive_id}")))?;
            let start = cursor.as_str();
            let keys = self
                .with_drive(&drive, |handle| async move {
                    handle
                        .get_key_range(start, KEY_RANGE_END, page, cluster_version)
                        .await
                })
                .await
                .map_err(|e| e.into_error(drive_id.as_str(), cluster_version))?;
            let Some(last) = keys.last() else {
                break;
            };
            let next = key_successor(last);
            for key in keys.iter().filter(|k| !k.starts_with(PARTITION_PREFIX)) {
                self.read_repair_in(partition_id, key).await?;
                repaired += 1;
            }
            if keys.len() < page {
                break;
            }
            cursor = next;
        }
        Ok(repaired)
    }
}
