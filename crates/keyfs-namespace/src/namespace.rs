//! Namespace capability interface
//!
//! Upper layers only see `Namespace`. Which implementation backs it (a single
//! drive or a replicated cluster) is decided once at startup.

use crate::drive::{Drive, DriveError, WriteRequest};
use async_trait::async_trait;
use bytes::Bytes;
use keyfs_common::{Capacity, Error, Record, Result, Version, WriteMode};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

/// Exact-key storage with optimistic concurrency
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Read a record
    async fn get(&self, key: &str) -> Result<Record>;

    /// Read only a record's version
    async fn get_version(&self, key: &str) -> Result<Version>;

    /// Write a record and return its new version.
    ///
    /// With `WriteMode::Versioned`, `expected = None` creates the key and fails
    /// if it already exists.
    async fn put(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Version>,
        mode: WriteMode,
    ) -> Result<Version>;

    /// Remove a record
    async fn delete(&self, key: &str, expected: Option<&Version>, mode: WriteMode) -> Result<()>;

    /// Keys in `[start, end)`, at most `limit`
    async fn get_key_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<String>>;

    /// Aggregate space report
    async fn capacity(&self) -> Result<Capacity>;

    /// Probe every backing drive; false if any is unreachable or misfenced
    async fn self_check(&self) -> Result<bool>;
}

/// Namespace over a single drive
pub struct SimpleNamespace {
    drive: Arc<dyn Drive>,
    cluster_version: AtomicI64,
    max_retries: u32,
}

impl SimpleNamespace {
    pub fn new(drive: Arc<dyn Drive>, max_retries: u32) -> Self {
        Self {
            drive,
            cluster_version: AtomicI64::new(0),
            max_retries,
        }
    }

    /// Run `op`, adopting the drive's fencing token if ours is stale
    async fn call<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Drive>, i64) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, DriveError>> + Send,
        T: Send,
    {
        let mut cluster_version = self.cluster_version.load(Ordering::Acquire);
        for _ in 0..=self.max_retries {
            match op(Arc::clone(&self.drive), cluster_version).await {
                Err(DriveError::ClusterVersionMismatch { drive_version }) => {
                    debug!(
                        "Drive {} moved from cluster version {} to {}",
                        self.drive.id(),
                        cluster_version,
                        drive_version
                    );
                    self.cluster_version.store(drive_version, Ordering::Release);
                    cluster_version = drive_version;
                }
                other => return other.map_err(|e| e.into_error(key, cluster_version)),
            }
        }
        Err(Error::QuorumUnavailable(format!(
            "drive {} keeps changing cluster version",
            self.drive.id()
        )))
    }
}

#[async_trait]
impl Namespace for SimpleNamespace {
    async fn get(&self, key: &str) -> Result<Record> {
        self.call(key, |drive, cv| async move { drive.get(key, cv).await })
            .await
    }

    async fn get_version(&self, key: &str) -> Result<Version> {
        self.call(key, |drive, cv| async move { drive.get_version(key, cv).await })
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
        let request = &request;
        self.call(key, |drive, cv| async move { drive.put(request, cv).await })
            .await?;
        Ok(request.new_version.clone())
    }

    async fn delete(&self, key: &str, expected: Option<&Version>, mode: WriteMode) -> Result<()> {
        self.call(key, |drive, cv| async move {
            drive.delete(key, expected, mode, cv).await
        })
        .await
    }

    async fn get_key_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<String>> {
        self.call(start, |drive, cv| async move {
            drive.get_key_range(start, end, limit, cv).await
        })
        .await
    }

    async fn capacity(&self) -> Result<Capacity> {
        self.call("", |drive, cv| async move { drive.capacity(cv).await })
            .await
    }

    async fn self_check(&self) -> Result<bool> {
        match self.call("", |drive, cv| async move { drive.noop(cv).await }).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Self-check of drive {} failed: {}", self.drive.id(), e);
                Ok(false)
            }
        }
    }
}
