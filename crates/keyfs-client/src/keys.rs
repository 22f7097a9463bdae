//! Storage key layout
//!
//! - metadata: the storage key a path resolves to
//! - data blocks: `{inode}_{block}`
//! - directory entries: `{parent inode}|{name}`, so one directory's entries
//!   share a partition and list with a single range scan
//! - recovery markers: `recovery|{inode}`

use crate::metadata::InodeId;

pub const RECOVERY_PREFIX: &str = "recovery|";

pub fn data_block_key(inode: InodeId, block: u64) -> String {
    format!("{inode}_{block}")
}

pub fn dirent_key(parent: InodeId, name: &str) -> String {
    format!("{parent}|{name}")
}

/// Bounds of every entry of one directory
pub fn dirent_range(parent: InodeId) -> (String, String) {
    (format!("{parent}|"), format!("{parent}}}"))
}

pub fn recovery_key(inode: InodeId) -> String {
    format!("{RECOVERY_PREFIX}{inode}")
}

/// Bounds of every recovery marker
pub fn recovery_range() -> (String, String) {
    (RECOVERY_PREFIX.to_string(), "recovery}".to_string())
}
