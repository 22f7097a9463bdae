//! File-level access helpers
//!
//! Metadata, data blocks and directory entries over a [`Namespace`], with
//! user paths resolved through the [`PathService`]. Version conflicts are
//! retried here with refreshed state; callers only see them once the retry
//! bound is exhausted.

use crate::keys::{data_block_key, dirent_key, dirent_range};
use crate::metadata::{DirEntry, InodeId, Metadata};
use bytes::{Bytes, BytesMut};
use keyfs_cache::{BoundedCache, CacheStats};
use keyfs_common::config::{CacheConfig, ClientConfig};
use keyfs_common::{Error, FatalError, Result, Version, WriteMode, key_successor};
use keyfs_namespace::Namespace;
use keyfs_pathmap::{PathService, Purpose, Resolution, path};
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

/// Directory entries fetched per range request
const LIST_PAGE: usize = 256;

/// A metadata record plus what it was read at
#[derive(Debug, Clone)]
pub struct Cached<M> {
    pub record: M,
    pub version: Version,
    /// Permission epoch the record was validated against
    pub epoch: i64,
}

/// Outcome of a read-modify-write
pub(crate) struct Modified<M> {
    /// Storage key that was written
    pub key: String,
    pub previous: M,
    pub updated: M,
}

/// File helpers for one client
pub struct FileStore<M: Metadata> {
    pub(crate) ns: Arc<dyn Namespace>,
    pub(crate) paths: Arc<PathService>,
    cache: BoundedCache<String, Cached<M>>,
    pub(crate) config: ClientConfig,
    halted: Mutex<Option<FatalError>>,
}

impl<M: Metadata> FileStore<M> {
    pub fn new(
        ns: Arc<dyn Namespace>,
        paths: Arc<PathService>,
        cache: &CacheConfig,
        config: ClientConfig,
    ) -> Self {
        Self {
            ns,
            paths,
            cache: BoundedCache::new(cache.capacity, cache.expiration()),
            config,
            halted: Mutex::new(None),
        }
    }

    pub fn paths(&self) -> &PathService {
        &self.paths
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// The fatal error that stopped this client, if any
    pub fn fatal_error(&self) -> Option<FatalError> {
        self.halted.lock().clone()
    }

    /// Refuse mutations once a compound operation could not be undone
    pub(crate) fn check_halted(&self) -> Result<()> {
        match self.halted.lock().as_ref() {
            Some(fatal) => Err(Error::Unsafe(fatal.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn halt(&self, fatal: FatalError) -> Error {
        error!("Filesystem marked unsafe: {}", fatal);
        counter!("keyfs_fatal_errors_total").increment(1);
        let mut halted = self.halted.lock();
        Error::Unsafe(halted.get_or_insert(fatal).clone())
    }

    /// Resolve a user path; the reserved reuse area is not addressable
    pub fn resolve(&self, path: &str, purpose: Purpose) -> Result<Resolution> {
        if path::is_reserved(&path::normalize(path)?) {
            return Err(Error::PermissionDenied(path.to_string()));
        }
        self.paths.resolve_path(path, purpose)
    }

    /// Drop a cached record after its key was changed behind the cache
    pub(crate) fn forget(&self, key: &str) {
        self.cache.invalidate(&key.to_string());
    }

    /// Read a path's metadata, from cache unless the path's permission
    /// epoch moved past the cached copy
    pub async fn get_metadata(&self, path: &str) -> Result<Cached<M>> {
        let resolution = self.resolve(path, Purpose::Lookup)?;
        self.get_metadata_at(&resolution).await
    }

    pub(crate) async fn get_metadata_at(&self, resolution: &Resolution) -> Result<Cached<M>> {
        let key = resolution.key.clone();
        if let Some(cached) = self.cache.get(&key).await {
            if cached.epoch >= resolution.epoch {
                return Ok(cached);
            }
            debug!(
                "Cached metadata of {} is stale (epoch {} < {})",
                key, cached.epoch, resolution.epoch
            );
            self.cache.invalidate(&key);
        }

        let epoch = resolution.epoch;
        let ns = Arc::clone(&self.ns);
        self.cache
            .get_or_fetch(key.clone(), || async move {
                let record = ns.get(&key).await?;
                Ok::<_, Error>(Cached {
                    record: M::from_bytes(&record.value)?,
                    version: record.version,
                    epoch,
                })
            })
            .await
    }

    /// Store metadata for a path that must not exist yet
    pub async fn create_metadata(&self, path: &str, record: &M) -> Result<Version> {
        self.check_halted()?;
        let resolution = self.resolve(path, Purpose::Lookup)?;
        self.put_at(&resolution, record, None).await.map_err(|e| {
            if e.is_conflict() {
                Error::AlreadyExists(path.to_string())
            } else {
                e
            }
        })
    }

    /// Overwrite a path's metadata if it is still at `expected`
    pub async fn put_metadata(&self, path: &str, record: &M, expected: &Version) -> Result<Version> {
        self.check_halted()?;
        let resolution = self.resolve(path, Purpose::Lookup)?;
        self.put_at(&resolution, record, Some(expected)).await
    }

    pub(crate) async fn put_at(
        &self,
        resolution: &Resolution,
        record: &M,
        expected: Option<&Version>,
    ) -> Result<Version> {
        let key = &resolution.key;
        match self
            .ns
            .put(key, record.to_bytes()?, expected, WriteMode::Versioned)
            .await
        {
            Ok(version) => {
                self.cache.replace(
                    key.clone(),
                    Cached {
                        record: record.clone(),
                        version: version.clone(),
                        epoch: resolution.epoch,
                    },
                );
                Ok(version)
            }
            Err(e) => {
                self.cache.invalidate(key);
                Err(e)
            }
        }
    }

    /// Optimistic read-modify-write of a path's metadata
    pub async fn update_metadata<F>(&self, path: &str, update: F) -> Result<M>
    where
        F: Fn(&mut M) -> Result<()> + Send + Sync,
    {
        self.modify_metadata(path, update)
            .await
            .map(|modified| modified.updated)
    }

    pub(crate) async fn modify_metadata<F>(&self, path: &str, update: F) -> Result<Modified<M>>
    where
        F: Fn(&mut M) -> Result<()> + Send + Sync,
    {
        self.check_halted()?;
        let mut key = None;
        for attempt in 0..=self.config.max_update_retries {
            let resolution = self.resolve(path, Purpose::Lookup)?;
            let cached = self.get_metadata_at(&resolution).await?;
            let mut record = cached.record.clone();
            update(&mut record)?;
            match self.put_at(&resolution, &record, Some(&cached.version)).await {
                Ok(_) => {
                    return Ok(Modified {
                        key: resolution.key,
                        previous: cached.record,
                        updated: record,
                    });
                }
                Err(e) if e.is_conflict() => {
                    debug!("Update of {} raced (attempt {}), re-reading", path, attempt + 1);
                    counter!("keyfs_metadata_update_conflicts_total").increment(1);
                    key = Some(resolution.key);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(key.unwrap_or_else(|| path.to_string())))
    }

    pub async fn delete_metadata(&self, path: &str, expected: Option<&Version>) -> Result<()> {
        self.check_halted()?;
        let key = self.resolve(path, Purpose::Lookup)?.key;
        let mode = if expected.is_some() { WriteMode::Versioned } else { WriteMode::Force };
        let result = self.ns.delete(&key, expected, mode).await;
        self.cache.invalidate(&key);
        result
    }

    pub async fn read_block(&self, inode: InodeId, block: u64) -> Result<Option<Bytes>> {
        match self.ns.get(&data_block_key(inode, block)).await {
            Ok(record) => Ok(Some(record.value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_block(&self, inode: InodeId, block: u64, data: Bytes) -> Result<Version> {
        self.check_halted()?;
        self.ns
            .put(&data_block_key(inode, block), data, None, WriteMode::Force)
            .await
    }

    pub async fn delete_block(&self, inode: InodeId, block: u64) -> Result<()> {
        self.check_halted()?;
        match self
            .ns
            .delete(&data_block_key(inode, block), None, WriteMode::Force)
            .await
        {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Append to the value under a storage key, creating it if absent
    pub async fn append(&self, key: &str, data: &[u8]) -> Result<Version> {
        self.check_halted()?;
        for _ in 0..=self.config.max_update_retries {
            let (current, expected) = match self.ns.get(key).await {
                Ok(record) => (record.value, Some(record.version)),
                Err(e) if e.is_not_found() => (Bytes::new(), None),
                Err(e) => return Err(e),
            };
            let mut value = BytesMut::with_capacity(current.len() + data.len());
            value.extend_from_slice(&current);
            value.extend_from_slice(data);
            match self
                .ns
                .put(key, value.freeze(), expected.as_ref(), WriteMode::Versioned)
                .await
            {
                Ok(version) => return Ok(version),
                Err(e) if e.is_conflict() => debug!("Append to {} raced, retrying", key),
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(key))
    }

    /// Add a directory entry; `AlreadyExists` if the name is taken
    pub async fn add_dirent(&self, parent: InodeId, name: &str, entry: DirEntry) -> Result<()> {
        self.check_halted()?;
        let key = dirent_key(parent, name);
        match self
            .ns
            .put(&key, entry.to_bytes()?, None, WriteMode::Versioned)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Err(Error::AlreadyExists(key)),
            Err(e) => Err(e),
        }
    }

    pub async fn lookup_dirent(&self, parent: InodeId, name: &str) -> Result<Option<DirEntry>> {
        match self.ns.get(&dirent_key(parent, name)).await {
            Ok(record) => DirEntry::from_bytes(&record.value).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_dirent(&self, parent: InodeId, name: &str) -> Result<()> {
        self.check_halted()?;
        self.ns
            .delete(&dirent_key(parent, name), None, WriteMode::Force)
            .await
    }

    /// Names in a directory, in key order
    pub async fn list_directory(&self, parent: InodeId) -> Result<Vec<String>> {
        let (start, end) = dirent_range(parent);
        let mut names = Vec::new();
        let mut cursor = start.clone();
        loop {
            let keys = self.ns.get_key_range(&cursor, &end, LIST_PAGE).await?;
            let Some(last) = keys.last() else {
                break;
            };
            cursor = key_successor(last);
            names.extend(keys.iter().map(|k| k[start.len()..].to_string()));
            if keys.len() < LIST_PAGE {
                break;
            }
        }
        Ok(names)
    }
}
