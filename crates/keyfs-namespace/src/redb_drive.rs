//! Persistent drive backed by redb.
//!
//! Each drive is a single redb file with two tables: the records themselves
//! (bincode-encoded with version and checksum) and a small meta table holding
//! the drive's fencing token. Every request runs in one transaction, so the
//! fence check and the optimistic-concurrency check are atomic with the write.

use crate::drive::{
    Drive, DriveError, DriveResult, WriteRequest, check_delete, check_fence, check_put,
};
use crate::pool::DriveConnector;
use async_trait::async_trait;
use bytes::Bytes;
use keyfs_common::{Capacity, Checksum, DriveId, DriveRef, Record, Version, WriteMode};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const META: TableDefinition<&str, i64> = TableDefinition::new("meta");
const CLUSTER_VERSION_KEY: &str = "cluster_version";

/// Error type for redb drive operations
#[derive(Debug, thiserror::Error)]
pub enum RedbDriveError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Drive(#[from] DriveError),
}

impl From<redb::TransactionError> for RedbDriveError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<RedbDriveError> for DriveError {
    fn from(e: RedbDriveError) -> Self {
        match e {
            RedbDriveError::Drive(inner) => inner,
            other => Self::Io(other.to_string()),
        }
    }
}

type RedbResult<T> = Result<T, RedbDriveError>;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    version: Version,
    value: Vec<u8>,
    checksum: Checksum,
}

/// A drive persisted in a redb database file
pub struct RedbDrive {
    id: DriveId,
    db: Database,
    path: PathBuf,
    total_bytes: u64,
}

impl RedbDrive {
    /// Open (or create) the drive database at the given path.
    pub fn open(id: DriveId, path: impl AsRef<Path>, total_bytes: u64) -> RedbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(RECORDS)?;
            let mut meta = write_txn.open_table(META)?;
            let initialized = meta.get(CLUSTER_VERSION_KEY)?.is_some();
            if !initialized {
                meta.insert(CLUSTER_VERSION_KEY, 0)?;
            }
        }
        write_txn.commit()?;

        debug!("Opened drive {} at {}", id, path.display());
        Ok(Self {
            id,
            db,
            path: path.to_path_buf(),
            total_bytes,
        })
    }

    fn read_fence(meta: &impl ReadableTable<&'static str, i64>) -> RedbResult<i64> {
        Ok(meta
            .get(CLUSTER_VERSION_KEY)?
            .map_or(0, |guard| guard.value()))
    }

    fn decode(key: &str, bytes: &[u8]) -> RedbResult<StoredRecord> {
        bincode::deserialize(bytes).map_err(|e| {
            error!("Failed to decode record '{}': {}", key, e);
            RedbDriveError::Drive(DriveError::Corruption(format!("undecodable record: {e}")))
        })
    }

    fn load(&self, key: &str, cluster_version: i64) -> RedbResult<Option<StoredRecord>> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        check_fence(Self::read_fence(&meta)?, cluster_version)?;
        let records = read_txn.open_table(RECORDS)?;
        let stored = match records.get(key)? {
            Some(guard) => Some(Self::decode(key, guard.value())?),
            None => None,
        };
        Ok(stored)
    }

    fn store(&self, request: &WriteRequest, cluster_version: i64) -> RedbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let meta = write_txn.open_table(META)?;
            check_fence(Self::read_fence(&meta)?, cluster_version)?;
            let mut records = write_txn.open_table(RECORDS)?;
            // Read and compare, then drop the guard before mutating
            let stored_version = match records.get(request.key.as_str())? {
                Some(guard) => Some(Self::decode(&request.key, guard.value())?.version),
                None => None,
            };
            check_put(stored_version.as_ref(), request)?;

            let stored = StoredRecord {
                version: request.new_version.clone(),
                value: request.value.to_vec(),
                checksum: request.checksum_algorithm.compute(&request.value),
            };
            let bytes = bincode::serialize(&stored)?;
            records.insert(request.key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(
        &self,
        key: &str,
        expected: Option<&Version>,
        mode: WriteMode,
        cluster_version: i64,
    ) -> RedbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let meta = write_txn.open_table(META)?;
            check_fence(Self::read_fence(&meta)?, cluster_version)?;
            let mut records = write_txn.open_table(RECORDS)?;
            let stored_version = match records.get(key)? {
                Some(guard) => Some(Self::decode(key, guard.value())?.version),
                None => None,
            };
            check_delete(stored_version.as_ref(), expected, mode)?;
            records.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        cluster_version: i64,
    ) -> RedbResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        check_fence(Self::read_fence(&meta)?, cluster_version)?;
        if start >= end {
            return Ok(Vec::new());
        }
        let records = read_txn.open_table(RECORDS)?;
        let mut keys = Vec::new();
        for entry in records.range::<&str>(start..end)? {
            if keys.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn fence(&self, cluster_version: i64) -> RedbResult<()> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        check_fence(Self::read_fence(&meta)?, cluster_version)?;
        Ok(())
    }

    fn swap_fence(&self, current: i64, new: i64) -> RedbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META)?;
            let fence = Self::read_fence(&meta)?;
            check_fence(fence, current)?;
            meta.insert(CLUSTER_VERSION_KEY, new)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl Drive for RedbDrive {
    fn id(&self) -> &DriveId {
        &self.id
    }

    async fn get(&self, key: &str, cluster_version: i64) -> DriveResult<Record> {
        let stored = self
            .load(key, cluster_version)?
            .ok_or(DriveError::NotFound)?;
        if !stored.checksum.verify(&stored.value) {
            error!("Checksum mismatch on drive {} key '{}'", self.id, key);
            return Err(DriveError::Corruption(format!(
                "stored {} {}",
                stored.checksum.algorithm,
                stored.checksum.to_hex()
            )));
        }
        Ok(Record {
            key: key.to_string(),
            value: Bytes::from(stored.value),
            version: stored.version,
            checksum_algorithm: stored.checksum.algorithm,
        })
    }

    async fn get_version(&self, key: &str, cluster_version: i64) -> DriveResult<Version> {
        self.load(key, cluster_version)?
            .map(|stored| stored.version)
            .ok_or(DriveError::NotFound)
    }

    async fn put(&self, request: &WriteRequest, cluster_version: i64) -> DriveResult<()> {
        Ok(self.store(request, cluster_version)?)
    }

    async fn delete(
        &self,
        key: &str,
        expected: Option<&Version>,
        mode: WriteMode,
        cluster_version: i64,
    ) -> DriveResult<()> {
        Ok(self.remove(key, expected, mode, cluster_version)?)
    }

    async fn get_key_range(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        cluster_version: i64,
    ) -> DriveResult<Vec<String>> {
        Ok(self.scan(start, end, limit, cluster_version)?)
    }

    async fn capacity(&self, cluster_version: i64) -> DriveResult<Capacity> {
        self.fence(cluster_version)?;
        let used_bytes = std::fs::metadata(&self.path)
            .map_err(|e| DriveError::Io(e.to_string()))?
            .len();
        Ok(Capacity {
            total_bytes: self.total_bytes,
            used_bytes,
        })
    }

    async fn noop(&self, cluster_version: i64) -> DriveResult<()> {
        Ok(self.fence(cluster_version)?)
    }

    async fn set_cluster_version(&self, current: i64, new: i64) -> DriveResult<()> {
        Ok(self.swap_fence(current, new)?)
    }
}

/// Maps drive identities to redb files under a data directory
pub struct RedbConnector {
    data_dir: PathBuf,
    total_bytes: u64,
    /// redb refuses to open a file twice, so opened drives are kept here
    opened: Mutex<HashMap<DriveId, Arc<RedbDrive>>>,
}

impl RedbConnector {
    pub fn new(data_dir: impl Into<PathBuf>, total_bytes: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            total_bytes,
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Database file backing a drive
    #[must_use]
    pub fn path_for(&self, drive: &DriveRef) -> PathBuf {
        self.data_dir
            .join(format!("{}-{}.redb", drive.host, drive.port))
    }
}

#[async_trait]
impl DriveConnector for RedbConnector {
    async fn connect(&self, drive: &DriveRef) -> DriveResult<Arc<dyn Drive>> {
        let id = drive.id();
        let mut opened = self.opened.lock();
        if let Some(existing) = opened.get(&id) {
            return Ok(Arc::clone(existing) as Arc<dyn Drive>);
        }
        let handle = Arc::new(RedbDrive::open(
            id.clone(),
            self.path_for(drive),
            self.total_bytes,
        )?);
        opened.insert(id, Arc::clone(&handle));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_drive(dir: &TempDir) -> RedbDrive {
        RedbDrive::open(
            DriveId::new("localhost", 8123),
            dir.path().join("drive.redb"),
            1 << 20,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let drive = open_drive(&dir);

        let request = WriteRequest::create("7|readme", Bytes::from_static(b"inode-7"));
        drive.put(&request, 0).await.unwrap();
        let record = drive.get("7|readme", 0).await.unwrap();
        assert_eq!(record.value, Bytes::from_static(b"inode-7"));
        assert_eq!(record.version, request.new_version);
        assert_eq!(
            drive.get_version("7|readme", 0).await.unwrap(),
            request.new_version
        );
    }

    #[tokio::test]
    async fn test_versioned_update_and_delete() {
        let dir = TempDir::new().unwrap();
        let drive = open_drive(&dir);

        let create = WriteRequest::create("k", Bytes::from_static(b"v1"));
        drive.put(&create, 0).await.unwrap();

        let stale = WriteRequest::new("k", Bytes::from_static(b"v2"), Some(Version::generate()));
        assert_eq!(drive.put(&stale, 0).await, Err(DriveError::VersionMismatch));

        let update = WriteRequest::new(
            "k",
            Bytes::from_static(b"v2"),
            Some(create.new_version.clone()),
        );
        drive.put(&update, 0).await.unwrap();
        assert_eq!(
            drive
                .delete("k", Some(&create.new_version), WriteMode::Versioned, 0)
                .await,
            Err(DriveError::VersionMismatch)
        );
        drive
            .delete("k", Some(&update.new_version), WriteMode::Versioned, 0)
            .await
            .unwrap();
        assert_eq!(drive.get("k", 0).await, Err(DriveError::NotFound));
    }

    #[tokio::test]
    async fn test_fence_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let drive = open_drive(&dir);
            drive.set_cluster_version(0, 5).await.unwrap();
            assert_eq!(
                drive.noop(0).await,
                Err(DriveError::ClusterVersionMismatch { drive_version: 5 })
            );
        }
        let drive = open_drive(&dir);
        drive.noop(5).await.unwrap();
    }

    #[tokio::test]
    async fn test_key_range() {
        let dir = TempDir::new().unwrap();
        let drive = open_drive(&dir);
        for key in ["9|b", "9|a", "9|c", "90|a"] {
            drive
                .put(&WriteRequest::create(key, Bytes::new()), 0)
                .await
                .unwrap();
        }
        let keys = drive.get_key_range("9|", "9}", 100, 0).await.unwrap();
        assert_eq!(keys, vec!["9|a", "9|b", "9|c"]);
        let keys = drive.get_key_range("9|", "9}", 1, 0).await.unwrap();
        assert_eq!(keys, vec!["9|a"]);
    }

    #[tokio::test]
    async fn test_connector_reuses_open_database() {
        let dir = TempDir::new().unwrap();
        let connector = RedbConnector::new(dir.path(), 1 << 20);
        let drive_ref = DriveRef::new("10.0.0.1", 8123);

        let first = connector.connect(&drive_ref).await.unwrap();
        first
            .put(&WriteRequest::create("k", Bytes::from_static(b"v")), 0)
            .await
            .unwrap();
        let second = connector.connect(&drive_ref).await.unwrap();
        assert!(second.get("k", 0).await.is_ok());
        assert!(connector.path_for(&drive_ref).exists());
        assert!(first.capacity(0).await.unwrap().used_bytes > 0);
    }
}
