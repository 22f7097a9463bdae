//! KeyFS file-level helpers
//!
//! What a filesystem front end builds on: typed metadata records cached per
//! client, data blocks, directory entries, and compound operations (create,
//! symlink, unlink, rename) that undo themselves on failure. A compound
//! operation whose undo also fails halts the client with
//! [`keyfs_common::Error::Unsafe`].

mod compound;
pub mod keys;
pub mod metadata;
pub mod ops;
pub mod rename;
pub mod store;
#[cfg(test)]
mod testing;

pub use metadata::{DirEntry, FileKind, InodeId, InodeRecord, Metadata};
pub use rename::{RecoveryReport, RenameIntent};
pub use store::{Cached, FileStore};
