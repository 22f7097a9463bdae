//! Path service: the local path map kept current against the shared log

use crate::db::{PathMapDb, Purpose, Resolution};
use crate::log::{LOG_PREFIX, MutationLog};
use crate::mutation::Mutation;
use keyfs_common::config::PathMapConfig;
use keyfs_common::{Error, Result};
use keyfs_namespace::Namespace;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One client's view of path virtualization
pub struct PathService {
    map: PathMapDb,
    log: MutationLog,
    config: PathMapConfig,
    catching_up: Mutex<()>,
}

impl PathService {
    pub fn new(ns: Arc<dyn Namespace>, config: PathMapConfig) -> Self {
        Self {
            map: PathMapDb::new(config.max_symlink_hops),
            log: MutationLog::new(ns),
            config,
            catching_up: Mutex::new(()),
        }
    }

    pub const fn map(&self) -> &PathMapDb {
        &self.map
    }

    pub const fn log(&self) -> &MutationLog {
        &self.log
    }

    /// Resolve against the local map; never touches the network
    pub fn resolve_path(&self, path: &str, purpose: Purpose) -> Result<Resolution> {
        self.map.resolve(path, purpose)
    }

    /// Bring the local map up to the log's latest entry.
    ///
    /// A client more than one snapshot interval behind loads the stored
    /// snapshot first. Returns the version reached.
    pub async fn catch_up(&self) -> Result<i64> {
        let _guard = self.catching_up.lock().await;
        let latest = self.log.latest_sequence().await?;
        let mut version = self.map.version();
        if latest <= version {
            return Ok(version);
        }

        let behind = u64::try_from(latest - version).unwrap_or_default();
        if behind > self.config.snapshot_interval {
            if let Some(snapshot) = self.log.read_snapshot().await? {
                let snapshot_version = snapshot.version;
                if self.map.load_snapshot(snapshot) {
                    info!(
                        "Loaded path map snapshot at version {} (was {})",
                        snapshot_version, version
                    );
                    version = self.map.version();
                }
            }
        }

        if latest > version {
            let entries = self.log.read_range(version, latest).await?;
            let applied = self.map.apply_log_range(&entries, version, latest)?;
            debug!("Replayed {} log entries up to version {}", applied, latest);
        }
        Ok(self.map.version())
    }

    /// Append a mutation to the log and apply it locally.
    ///
    /// `verify` re-checks that the file-system operation is still valid
    /// against the current map; it runs after every catch-up, so an
    /// operation invalidated by another client's entry fails instead of
    /// being logged. Returns the sequence the mutation landed at.
    pub async fn record_mutation<F>(&self, mutation: Mutation, verify: F) -> Result<i64>
    where
        F: Fn(&PathMapDb) -> Result<()> + Send + Sync,
    {
        mutation.validate()?;
        for attempt in 0..=self.config.max_append_retries {
            self.catch_up().await?;
            verify(&self.map)?;

            let entry = mutation.clone().at(self.map.version() + 1);
            match self.log.append(&entry).await {
                Ok(sequence) => {
                    self.map.apply(&entry)?;
                    debug!("Recorded {}", entry);
                    if self.compaction_due(sequence) {
                        if let Err(e) = self.compact().await {
                            warn!("Path map compaction at {} failed: {}", sequence, e);
                        }
                    }
                    return Ok(sequence);
                }
                Err(e) if e.is_conflict() => {
                    debug!(
                        "Log append of {} lost the race (attempt {}), catching up",
                        entry,
                        attempt + 1
                    );
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            "Giving up on {} after {} conflicting appends",
            mutation,
            self.config.max_append_retries + 1
        );
        Err(Error::conflict(LOG_PREFIX))
    }

    fn compaction_due(&self, sequence: i64) -> bool {
        let interval = self.config.snapshot_interval;
        interval > 0 && u64::try_from(sequence).is_ok_and(|s| s % interval == 0)
    }

    /// Persist the local map as the shared snapshot
    pub async fn compact(&self) -> Result<bool> {
        let snapshot = self.map.snapshot();
        let stored = self.log.write_snapshot(&snapshot).await?;
        if stored {
            info!("Compacted path map at version {}", snapshot.version);
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::entry_key;
    use async_trait::async_trait;
    use bytes::Bytes;
    use keyfs_common::{Capacity, DriveId, Record, Version, WriteMode};
    use keyfs_namespace::{Drive, MemoryDrive, SimpleNamespace};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shared_namespace() -> Arc<dyn Namespace> {
        let drive = Arc::new(MemoryDrive::new(DriveId::new("localhost", 8123)));
        Arc::new(SimpleNamespace::new(drive as Arc<dyn Drive>, 4))
    }

    fn config(snapshot_interval: u64) -> PathMapConfig {
        PathMapConfig {
            snapshot_interval,
            ..PathMapConfig::default()
        }
    }

    #[tokio::test]
    async fn test_other_client_catches_up() {
        let ns = shared_namespace();
        let a = PathService::new(Arc::clone(&ns), config(64));
        let b = PathService::new(ns, config(64));

        let sequence = a
            .record_mutation(Mutation::moved("/docs", "/archive/docs"), |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(a.resolve_path("/archive/docs", Purpose::Lookup).unwrap().key, "/docs");

        // B only sees it after catching up
        assert_eq!(b.resolve_path("/archive/docs", Purpose::Lookup).unwrap().key, "/archive/docs");
        assert_eq!(b.catch_up().await.unwrap(), 1);
        assert_eq!(b.resolve_path("/archive/docs", Purpose::Lookup).unwrap().key, "/docs");
    }

    #[tokio::test]
    async fn test_stale_client_appends_after_catching_up() {
        let ns = shared_namespace();
        let a = PathService::new(Arc::clone(&ns), config(64));
        let b = PathService::new(ns, config(64));

        a.record_mutation(Mutation::moved("/a", "/b"), |_| Ok(())).await.unwrap();
        let sequence = b
            .record_mutation(Mutation::permission_change("/c"), |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(sequence, 2);

        a.catch_up().await.unwrap();
        assert_eq!(a.map().snapshot(), b.map().snapshot());
    }

    #[tokio::test]
    async fn test_verify_sees_other_clients_entries() {
        let ns = shared_namespace();
        let a = PathService::new(Arc::clone(&ns), config(64));
        let b = PathService::new(ns, config(64));

        a.record_mutation(Mutation::moved("/src", "/moved"), |_| Ok(()))
            .await
            .unwrap();

        // B wants to rename /src too, but only while it still names the original inode
        let err = b
            .record_mutation(Mutation::moved("/src", "/other"), |map| {
                let key = map.resolve("/src", Purpose::Lookup)?.key;
                if key == "/src" {
                    Ok(())
                } else {
                    Err(Error::not_found("/src"))
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(b.log().latest_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_far_behind_client_loads_snapshot() {
        let ns = shared_namespace();
        let writer = PathService::new(Arc::clone(&ns), config(4));
        for n in 0..9 {
            writer
                .record_mutation(Mutation::moved(format!("/d{n}"), format!("/e{n}")), |_| Ok(()))
                .await
                .unwrap();
        }
        assert_eq!(writer.log().read_snapshot().await.unwrap().unwrap().version, 8);

        let reader = PathService::new(ns, config(4));
        assert_eq!(reader.catch_up().await.unwrap(), 9);
        assert_eq!(reader.map().snapshot(), writer.map().snapshot());
    }

    /// Lets a competing client win every log sequence
    struct RacingNamespace {
        inner: Arc<dyn Namespace>,
        raced: AtomicUsize,
    }

    #[async_trait]
    impl Namespace for RacingNamespace {
        async fn get(&self, key: &str) -> Result<Record> {
            self.inner.get(key).await
        }

        async fn get_version(&self, key: &str) -> Result<Version> {
            self.inner.get_version(key).await
        }

        async fn put(
            &self,
            key: &str,
            value: Bytes,
            expected: Option<&Version>,
            mode: WriteMode,
        ) -> Result<Version> {
            if let Some(sequence) = key
                .strip_prefix(LOG_PREFIX)
                .and_then(|s| s.parse::<i64>().ok())
            {
                let competing = Mutation::permission_change("/elsewhere").at(sequence);
                self.inner
                    .put(&entry_key(sequence), competing.encode()?, None, WriteMode::Versioned)
                    .await?;
                self.raced.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.put(key, value, expected, mode).await
        }

        async fn delete(&self, key: &str, expected: Option<&Version>, mode: WriteMode) -> Result<()> {
            self.inner.delete(key, expected, mode).await
        }

        async fn get_key_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<String>> {
            self.inner.get_key_range(start, end, limit).await
        }

        async fn capacity(&self) -> Result<Capacity> {
            self.inner.capacity().await
        }

        async fn self_check(&self) -> Result<bool> {
            self.inner.self_check().await
        }
    }

    #[tokio::test]
    async fn test_append_retries_are_bounded() {
        let racing = Arc::new(RacingNamespace {
            inner: shared_namespace(),
            raced: AtomicUsize::new(0),
        });
        let service = PathService::new(
            Arc::clone(&racing) as Arc<dyn Namespace>,
            PathMapConfig {
                max_append_retries: 3,
                ..PathMapConfig::default()
            },
        );

        let err = service
            .record_mutation(Mutation::moved("/a", "/b"), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(racing.raced.load(Ordering::SeqCst), 4);
        // Every competing entry was replayed locally
        assert_eq!(service.map().version(), 3);
    }
}
