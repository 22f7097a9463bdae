//! Metadata records
//!
//! The helpers only need a record that round-trips through bytes and exposes
//! a few fields; [`InodeRecord`] is the stock implementation.

use bytes::Bytes;
use keyfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Inode identity, unique across the filesystem
pub type InodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// What the file helpers need from a metadata record
pub trait Metadata: Clone + Send + Sync + 'static {
    fn to_bytes(&self) -> Result<Bytes>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
    fn inode(&self) -> InodeId;
    fn kind(&self) -> FileKind;
    fn mode(&self) -> u32;
    fn set_mode(&mut self, mode: u32);
    /// File length in bytes
    fn size(&self) -> u64;
}

/// Inode attributes, path permissions and extended attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub inode: InodeId,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    /// Symlink target, for symlinks
    pub target: Option<String>,
    /// Extra principals allowed on this path, with their mode bits
    pub path_permissions: Vec<(String, u32)>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl InodeRecord {
    /// Fresh record with a random inode id
    pub fn new(kind: FileKind, mode: u32) -> Self {
        Self {
            inode: rand::random(),
            kind,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            mtime: 0,
            target: None,
            path_permissions: Vec::new(),
            xattrs: BTreeMap::new(),
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        let mut record = Self::new(FileKind::Symlink, 0o777);
        record.target = Some(target.into());
        record
    }
}

impl Metadata for InodeRecord {
    fn to_bytes(&self) -> Result<Bytes> {
        encode(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes, "inode record")
    }

    fn inode(&self) -> InodeId {
        self.inode
    }

    fn kind(&self) -> FileKind {
        self.kind
    }

    fn mode(&self) -> u32 {
        self.mode
    }

    fn set_mode(&mut self, mode: u32) {
        self.mode = mode;
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Value stored under a directory entry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: InodeId,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn to_bytes(&self) -> Result<Bytes> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes, "directory entry")
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::corruption(format!("undecodable {what}: {e}")))
}
