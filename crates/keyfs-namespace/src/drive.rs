//! Storage drive protocol
//!
//! A drive is a flat, versioned key-value store that only understands exact
//! keys and lexicographic key ranges. Every request carries the caller's view
//! of the partition's cluster version; a drive tagged with a different version
//! rejects the request and reports its own.

use async_trait::async_trait;
use bytes::Bytes;
use keyfs_common::{Capacity, ChecksumAlgorithm, DriveId, Error, Record, Version, WriteMode};

/// Status classes a drive can answer with
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriveError {
    #[error("key not found")]
    NotFound,

    #[error("version mismatch")]
    VersionMismatch,

    #[error("not authorized")]
    NotAuthorized,

    #[error("cluster version mismatch (drive is at {drive_version})")]
    ClusterVersionMismatch { drive_version: i64 },

    #[error("checksum mismatch: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DriveError {
    /// Whether this error means the drive itself is unhealthy
    #[must_use]
    pub const fn is_unexpected(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Convert into the namespace error taxonomy
    pub fn into_error(self, key: &str, cluster_version: i64) -> Error {
        match self {
            Self::NotFound => Error::not_found(key),
            Self::VersionMismatch => Error::conflict(key),
            Self::NotAuthorized => Error::NotAuthorized(key.to_string()),
            Self::ClusterVersionMismatch { drive_version } => Error::ClusterFencingMismatch {
                expected: cluster_version,
                actual: drive_version,
            },
            Self::Corruption(msg) => Error::corruption(format!("{key}: {msg}")),
            Self::Io(msg) => Error::io(msg),
        }
    }
}

pub type DriveResult<T> = std::result::Result<T, DriveError>;

/// A put as sent to every drive of a partition
///
/// The new version is chosen by the client so all replicas of a key end up
/// holding the same version token.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub key: String,
    pub value: Bytes,
    /// Version the writer read; `None` means the key must not exist
    pub expected: Option<Version>,
    pub new_version: Version,
    pub mode: WriteMode,
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl WriteRequest {
    /// Versioned write with a freshly minted version
    pub fn new(key: impl Into<String>, value: Bytes, expected: Option<Version>) -> Self {
        Self {
            key: key.into(),
            value,
            expected,
            new_version: Version::generate(),
            mode: WriteMode::Versioned,
            checksum_algorithm: ChecksumAlgorithm::default(),
        }
    }

    /// Create-only write
    pub fn create(key: impl Into<String>, value: Bytes) -> Self {
        Self::new(key, value, None)
    }

    /// Unconditional write
    #[must_use]
    pub fn force(mut self) -> Self {
        self.mode = WriteMode::Force;
        self
    }
}

/// Storage drive wire protocol
#[async_trait]
pub trait Drive: Send + Sync {
    /// Identity of the drive
    fn id(&self) -> &DriveId;

    /// Read a record
    async fn get(&self, key: &str, cluster_version: i64) -> DriveResult<Record>;

    /// Read only the version of a record
    async fn get_version(&self, key: &str, cluster_version: i64) -> DriveResult<Version>;

    /// Store a record, checking the expected version unless forced
    async fn put(&self, request: &WriteRequest, cluster_version: i64) -> DriveResult<()>;

    /// Remove a record, checking the expected version unless forced
    async fn delete(
        &self,
        key: &str,
        expected: Option<&Version>,
        mode: WriteMode,
        cluster_version: i64,
    ) -> DriveResult<()>;

    /// Keys in `[start, end)` in lexicographic order, at most `limit`
    async fn get_key_range(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        cluster_version: i64,
    ) -> DriveResult<Vec<String>>;

    /// Space report
    async fn capacity(&self, cluster_version: i64) -> DriveResult<Capacity>;

    /// Liveness probe that also validates the fencing token
    async fn noop(&self, cluster_version: i64) -> DriveResult<()>;

    /// Install a new fencing token; `current` must match the drive's token
    async fn set_cluster_version(&self, current: i64, new: i64) -> DriveResult<()>;
}

/// Reject requests tagged with a foreign cluster version
pub(crate) const fn check_fence(drive_version: i64, cluster_version: i64) -> DriveResult<()> {
    if drive_version == cluster_version {
        Ok(())
    } else {
        Err(DriveError::ClusterVersionMismatch { drive_version })
    }
}

/// Optimistic-concurrency check for a put against the stored version
pub(crate) fn check_put(stored: Option<&Version>, request: &WriteRequest) -> DriveResult<()> {
    if request.mode == WriteMode::Force {
        return Ok(());
    }
    match (stored, request.expected.as_ref()) {
        (None, None) => Ok(()),
        (Some(stored), Some(expected)) if stored == expected => Ok(()),
        _ => Err(DriveError::VersionMismatch),
    }
}

/// Optimistic-concurrency check for a delete against the stored version
pub(crate) fn check_delete(
    stored: Option<&Version>,
    expected: Option<&Version>,
    mode: WriteMode,
) -> DriveResult<()> {
    let Some(stored) = stored else {
        return Err(DriveError::NotFound);
    };
    match (mode, expected) {
        (WriteMode::Force, _) => Ok(()),
        (WriteMode::Versioned, Some(expected)) if expected == stored => Ok(()),
        (WriteMode::Versioned, _) => Err(DriveError::VersionMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_put() {
        let v1 = Version::generate();
        let v2 = Version::generate();
        let create = WriteRequest::create("k", Bytes::from_static(b"x"));
        assert!(check_put(None, &create).is_ok());
        assert_eq!(check_put(Some(&v1), &create), Err(DriveError::VersionMismatch));

        let update = WriteRequest::new("k", Bytes::new(), Some(v1.clone()));
        assert!(check_put(Some(&v1), &update).is_ok());
        assert_eq!(check_put(Some(&v2), &update), Err(DriveError::VersionMismatch));
        assert_eq!(check_put(None, &update), Err(DriveError::VersionMismatch));

        assert!(check_put(Some(&v2), &update.force()).is_ok());
    }

    #[test]
    fn test_check_delete() {
        let v1 = Version::generate();
        let v2 = Version::generate();
        assert_eq!(
            check_delete(None, Some(&v1), WriteMode::Force),
            Err(DriveError::NotFound)
        );
        assert!(check_delete(Some(&v1), Some(&v1), WriteMode::Versioned).is_ok());
        assert_eq!(
            check_delete(Some(&v1), Some(&v2), WriteMode::Versioned),
            Err(DriveError::VersionMismatch)
        );
        assert!(check_delete(Some(&v1), None, WriteMode::Force).is_ok());
    }

    #[test]
    fn test_into_error() {
        let err = DriveError::ClusterVersionMismatch { drive_version: 7 }.into_error("k", 5);
        assert!(matches!(
            err,
            Error::ClusterFencingMismatch {
                expected: 5,
                actual: 7
            }
        ));
        assert!(DriveError::VersionMismatch.into_error("k", 0).is_conflict());
        assert!(DriveError::NotFound.into_error("k", 0).is_not_found());
        assert!(DriveError::Io("reset".into()).is_unexpected());
        assert!(!DriveError::VersionMismatch.is_unexpected());
    }
}
