//! Shared fixtures for the client tests

use crate::metadata::{FileKind, InodeRecord};
use crate::store::FileStore;
use async_trait::async_trait;
use bytes::Bytes;
use keyfs_common::config::{CacheConfig, ClientConfig, PathMapConfig};
use keyfs_common::{Capacity, DriveId, Error, Record, Result, Version, WriteMode};
use keyfs_namespace::{Drive, MemoryDrive, Namespace, SimpleNamespace};
use keyfs_pathmap::PathService;
use parking_lot::Mutex;
use std::sync::Arc;

/// Namespace that fails puts or deletes under chosen key prefixes
pub(crate) struct FaultyNamespace {
    inner: SimpleNamespace,
    failing_puts: Mutex<Vec<String>>,
    failing_deletes: Mutex<Vec<String>>,
    conflicting_puts: Mutex<Vec<String>>,
}

impl FaultyNamespace {
    pub(crate) fn fail_puts(&self, prefix: impl Into<String>) {
        self.failing_puts.lock().push(prefix.into());
    }

    pub(crate) fn fail_deletes(&self, prefix: impl Into<String>) {
        self.failing_deletes.lock().push(prefix.into());
    }

    /// Puts under `prefix` lose every version race
    pub(crate) fn conflict_puts(&self, prefix: impl Into<String>) {
        self.conflicting_puts.lock().push(prefix.into());
    }

    pub(crate) fn heal(&self) {
        self.failing_puts.lock().clear();
        self.failing_deletes.lock().clear();
        self.conflicting_puts.lock().clear();
    }
}

fn matches_any(prefixes: &Mutex<Vec<String>>, key: &str) -> bool {
    prefixes.lock().iter().any(|p| key.starts_with(p.as_str()))
}

fn check(failing: &Mutex<Vec<String>>, key: &str) -> Result<()> {
    if matches_any(failing, key) {
        Err(Error::io(format!("injected failure writing {key}")))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Namespace for FaultyNamespace {
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
        check(&self.failing_puts, key)?;
        if matches_any(&self.conflicting_puts, key) {
            return Err(Error::conflict(key));
        }
        self.inner.put(key, value, expected, mode).await
    }

    async fn delete(&self, key: &str, expected: Option<&Version>, mode: WriteMode) -> Result<()> {
        check(&self.failing_deletes, key)?;
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

/// A second client over the same namespace
pub(crate) fn client(ns: Arc<FaultyNamespace>) -> FileStore<InodeRecord> {
    let ns = ns as Arc<dyn Namespace>;
    let paths = Arc::new(PathService::new(Arc::clone(&ns), PathMapConfig::default()));
    FileStore::new(ns, paths, &CacheConfig::default(), ClientConfig::default())
}

/// One client over a fresh namespace with the root directory in place
pub(crate) async fn fixture() -> (Arc<FaultyNamespace>, FileStore<InodeRecord>) {
    let drive = Arc::new(MemoryDrive::new(DriveId::new("localhost", 8123)));
    let ns = Arc::new(FaultyNamespace {
        inner: SimpleNamespace::new(drive as Arc<dyn Drive>, 4),
        failing_puts: Mutex::new(Vec::new()),
        failing_deletes: Mutex::new(Vec::new()),
        conflicting_puts: Mutex::new(Vec::new()),
    });
    let store = client(Arc::clone(&ns));
    store
        .init_root(&InodeRecord::new(FileKind::Directory, 0o755))
        .await
        .unwrap();
    (ns, store)
}
