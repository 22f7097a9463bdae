//! Path-level operations: create, symlink, permission change, unlink

use crate::compound::{Compound, Undo, forgive_not_found};
use crate::metadata::{DirEntry, FileKind, InodeId, Metadata};
use crate::store::FileStore;
use keyfs_common::{Error, Result, Version};
use keyfs_pathmap::{Mutation, PathMapDb, Purpose, path};
use tracing::warn;

impl<M: Metadata> FileStore<M> {
    /// Store the root directory's metadata unless it already exists
    pub async fn init_root(&self, root: &M) -> Result<()> {
        if root.kind() != FileKind::Directory {
            return Err(Error::invalid_argument("root must be a directory"));
        }
        match self.create_metadata(path::ROOT, root).await {
            Ok(_) | Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Inode of a path's parent directory, and the path's final name
    pub(crate) async fn parent_of(&self, target: &str) -> Result<(InodeId, String)> {
        let target = path::normalize(target)?;
        let parent = path::parent(&target)
            .ok_or_else(|| Error::invalid_argument("the root has no parent"))?;
        let cached = self.get_metadata(parent).await?;
        if cached.record.kind() != FileKind::Directory {
            return Err(Error::invalid_argument(format!("{parent} is not a directory")));
        }
        Ok((cached.record.inode(), path::file_name(&target).to_string()))
    }

    /// Create a file or directory
    pub async fn create(&self, target: &str, record: &M) -> Result<Version> {
        self.check_halted()?;
        let (parent, name) = self.parent_of(target).await?;
        if self.lookup_dirent(parent, &name).await?.is_some() {
            return Err(Error::AlreadyExists(target.to_string()));
        }
        let key = self.resolve(target, Purpose::Lookup)?.key;

        let mut compound = Compound::new(self, format!("create {target}"));
        let version = match self.create_metadata(target, record).await {
            Ok(version) => version,
            Err(e) => return Err(compound.rollback(e).await),
        };
        compound.done("metadata", Undo::DeleteKey(key));

        let entry = DirEntry {
            inode: record.inode(),
            kind: record.kind(),
        };
        if let Err(e) = self.add_dirent(parent, &name, entry).await {
            return Err(compound.rollback(e).await);
        }
        Ok(version)
    }

    /// Create a symlink at `link` pointing to `target`
    ///
    /// `record` is the link's own metadata.
    pub async fn symlink(&self, link: &str, target: &str, record: &M) -> Result<()> {
        self.check_halted()?;
        if record.kind() != FileKind::Symlink {
            return Err(Error::invalid_argument("symlink metadata must be of kind Symlink"));
        }
        let link = path::normalize(link)?;
        let (parent, name) = self.parent_of(&link).await?;
        if self.lookup_dirent(parent, &name).await?.is_some() {
            return Err(Error::AlreadyExists(link));
        }
        let key = self.resolve(&link, Purpose::Lookup)?.key;

        let mut compound = Compound::new(self, format!("symlink {link} -> {target}"));
        if let Err(e) = self.create_metadata(&link, record).await {
            return Err(compound.rollback(e).await);
        }
        compound.done("link metadata", Undo::DeleteKey(key.clone()));

        let entry = DirEntry {
            inode: record.inode(),
            kind: FileKind::Symlink,
        };
        if let Err(e) = self.add_dirent(parent, &name, entry).await {
            return Err(compound.rollback(e).await);
        }
        compound.done(
            "directory entry",
            Undo::RemoveDirent {
                parent,
                name: name.clone(),
            },
        );

        let recorded = self
            .paths
            .record_mutation(Mutation::symlink(link.as_str(), target), |map| {
                still_names(map, &link, &key)
            })
            .await;
        if let Err(e) = recorded {
            return Err(compound.rollback(e).await);
        }
        Ok(())
    }

    /// Change a path's mode bits and bump its permission epoch so other
    /// clients revalidate their cached copies
    ///
    /// The old mode is put back if the epoch cannot be logged.
    pub async fn set_permissions(&self, target: &str, mode: u32) -> Result<M> {
        let target = path::normalize(target)?;
        let modified = self
            .modify_metadata(&target, |record| {
                record.set_mode(mode);
                Ok(())
            })
            .await?;

        let mut compound = Compound::new(self, format!("chmod {target}"));
        compound.done(
            "mode",
            Undo::RestoreKey {
                key: modified.key,
                value: modified.previous.to_bytes()?,
            },
        );
        let recorded = self
            .paths
            .record_mutation(Mutation::permission_change(target.as_str()), |_| Ok(()))
            .await;
        if let Err(e) = recorded {
            return Err(compound.rollback(e).await);
        }
        Ok(modified.updated)
    }

    /// Remove a file, symlink or empty directory
    pub async fn unlink(&self, target: &str) -> Result<()> {
        self.check_halted()?;
        let target = path::normalize(target)?;
        let (parent, name) = self.parent_of(&target).await?;
        let resolution = self.resolve(&target, Purpose::Lookup)?;
        let cached = self.get_metadata_at(&resolution).await?;
        if cached.record.kind() == FileKind::Directory
            && !self.list_directory(cached.record.inode()).await?.is_empty()
        {
            return Err(Error::invalid_argument(format!("{target} is not empty")));
        }
        let entry = self
            .lookup_dirent(parent, &name)
            .await?
            .ok_or_else(|| Error::not_found(target.clone()))?;

        let mut compound = Compound::new(self, format!("unlink {target}"));
        if let Err(e) = forgive_not_found(self.remove_dirent(parent, &name).await) {
            return Err(compound.rollback(e).await);
        }
        compound.done(
            "directory entry",
            Undo::RestoreDirent {
                parent,
                name: name.clone(),
                entry,
            },
        );

        if let Err(e) = self.delete_metadata(&target, Some(&cached.version)).await {
            return Err(compound.rollback(e).await);
        }
        compound.done(
            "metadata",
            Undo::RestoreKey {
                key: resolution.key.clone(),
                value: cached.record.to_bytes()?,
            },
        );

        // Only paths with a mapping need the log to forget them
        if self.paths.map().entry(&target).is_some() {
            let key = resolution.key;
            let recorded = self
                .paths
                .record_mutation(Mutation::remove(target.as_str()), |map| {
                    still_names(map, &target, &key)
                })
                .await;
            if let Err(e) = recorded {
                return Err(compound.rollback(e).await);
            }
        }

        if cached.record.kind() == FileKind::File {
            self.reclaim_blocks(cached.record.inode(), cached.record.size())
                .await;
        }
        Ok(())
    }

    /// Remove an unlinked file's data blocks. Failures only leak space.
    async fn reclaim_blocks(&self, inode: InodeId, size: u64) {
        let blocks = size.div_ceil(self.config.block_size.max(1));
        for block in 0..blocks {
            if let Err(e) = self.delete_block(inode, block).await {
                warn!("Could not reclaim block {} of inode {}: {}", block, inode, e);
            }
        }
    }
}

/// Verify that `user_path` still resolves to `key` in the current map
pub(crate) fn still_names(map: &PathMapDb, user_path: &str, key: &str) -> Result<()> {
    if map.resolve(user_path, Purpose::Lookup)?.key == key {
        Ok(())
    } else {
        Err(Error::conflict(user_path))
    }
}

#[cfg(test)]
mod tests {
    use crate::metadata::{FileKind, InodeRecord};
    use crate::testing::fixture;
    use bytes::Bytes;
    use keyfs_common::Error;
    use keyfs_pathmap::Purpose;
    use keyfs_pathmap::log::LOG_PREFIX;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_and_list() {
        let (_, store) = fixture().await;
        let dir = InodeRecord::new(FileKind::Directory, 0o755);
        store.create("/docs", &dir).await.unwrap();
        store
            .create("/docs/a.txt", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap();
        store
            .create("/docs/b.txt", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap();

        assert_eq!(store.list_directory(dir.inode).await.unwrap(), vec!["a.txt", "b.txt"]);
        let err = store
            .create("/docs/a.txt", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(store.create("/missing/x", &dir).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_symlink_resolution() {
        let (_, store) = fixture().await;
        store
            .create("/target", &InodeRecord::new(FileKind::Directory, 0o755))
            .await
            .unwrap();
        let link = InodeRecord::symlink("/target");
        store.symlink("/link", "/target", &link).await.unwrap();

        // The link's own metadata, and the target through it
        assert_eq!(store.get_metadata("/link").await.unwrap().record, link);
        assert_eq!(store.resolve("/link", Purpose::Readlink).unwrap().key, "/target");
        assert_eq!(store.resolve("/link/f", Purpose::Lookup).unwrap().key, "/target/f");
    }

    #[tokio::test]
    async fn test_permission_change_invalidates_other_clients() {
        let (ns, store) = fixture().await;
        let other = crate::testing::client(ns);
        store
            .create("/shared", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap();
        assert_eq!(other.get_metadata("/shared").await.unwrap().record.mode, 0o644);

        store.set_permissions("/shared", 0o600).await.unwrap();
        // Still cached until the other client learns the new epoch
        assert_eq!(other.get_metadata("/shared").await.unwrap().record.mode, 0o644);
        other.paths().catch_up().await.unwrap();
        let refreshed = other.get_metadata("/shared").await.unwrap();
        assert_eq!(refreshed.record.mode, 0o600);
        assert_eq!(refreshed.epoch, 1);
    }

    #[tokio::test]
    async fn test_failed_permission_change_keeps_old_mode() {
        let (ns, store) = fixture().await;
        let other = crate::testing::client(Arc::clone(&ns));
        store
            .create("/shared", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap();

        ns.fail_puts(LOG_PREFIX);
        let err = store.set_permissions("/shared", 0o600).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        ns.heal();

        // Neither this client nor a fresh reader sees the mode that was never logged
        assert_eq!(store.get_metadata("/shared").await.unwrap().record.mode, 0o644);
        other.paths().catch_up().await.unwrap();
        let seen = other.get_metadata("/shared").await.unwrap();
        assert_eq!(seen.record.mode, 0o644);
        assert_eq!(seen.epoch, 0);
        assert!(store.fatal_error().is_none());

        // And the change goes through once the log is writable again
        store.set_permissions("/shared", 0o600).await.unwrap();
        other.paths().catch_up().await.unwrap();
        assert_eq!(other.get_metadata("/shared").await.unwrap().record.mode, 0o600);
    }

    #[tokio::test]
    async fn test_unlink_reclaims_data_blocks() {
        let (_, store) = fixture().await;
        let file = InodeRecord::new(FileKind::File, 0o644);
        store.create("/big", &file).await.unwrap();
        for block in 0..3 {
            store
                .write_block(file.inode, block, Bytes::from_static(b"data"))
                .await
                .unwrap();
        }
        store
            .update_metadata("/big", |r| {
                r.size = 2 * 1024 * 1024 + 10;
                Ok(())
            })
            .await
            .unwrap();

        store.unlink("/big").await.unwrap();
        for block in 0..3 {
            assert!(store.read_block(file.inode, block).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_reserved_paths_are_not_addressable() {
        let (_, store) = fixture().await;
        let err = store.get_metadata("/.reuse/3/docs").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        let err = store
            .create("/.reuse/x", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_unlink() {
        let (_, store) = fixture().await;
        let dir = InodeRecord::new(FileKind::Directory, 0o755);
        store.create("/d", &dir).await.unwrap();
        store
            .create("/d/f", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap();

        assert!(store.unlink("/d").await.is_err());
        store.unlink("/d/f").await.unwrap();
        assert!(store.list_directory(dir.inode).await.unwrap().is_empty());
        assert!(store.get_metadata("/d/f").await.unwrap_err().is_not_found());
        store.unlink("/d").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_metadata_gives_up_with_storage_key() {
        let (ns, store) = fixture().await;
        store
            .create("/f", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap();
        store.rename("/f", "/g").await.unwrap();

        ns.conflict_puts("/f");
        let err = store
            .update_metadata("/g", |r| {
                r.uid = 7;
                Ok(())
            })
            .await
            .unwrap_err();
        let Error::VersionConflict { key } = err else {
            panic!("expected a version conflict, got {err}");
        };
        assert_eq!(key, "/f");
    }

    #[tokio::test]
    async fn test_update_metadata_retries_conflicts() {
        let (ns, store) = fixture().await;
        let other = crate::testing::client(ns);
        store
            .create("/f", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap();
        // Prime the cache, then let another client move the version on
        store.get_metadata("/f").await.unwrap();
        other
            .update_metadata("/f", |r| {
                r.size = 10;
                Ok(())
            })
            .await
            .unwrap();

        let updated = store
            .update_metadata("/f", |r| {
                r.uid = 1000;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.size, 10);
        assert_eq!(updated.uid, 1000);
    }
}
