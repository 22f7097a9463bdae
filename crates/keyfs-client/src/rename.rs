//! Rename
//!
//! A rename never copies data. It is four steps:
//!
//! 1. add the destination's directory entry
//! 2. store a recovery marker describing the whole rename
//! 3. remove the origin's directory entry
//! 4. append a `MOVE` to the mutation log
//!
//! A failure in any step undoes the completed ones. A client that dies
//! between steps leaves its marker behind, and
//! [`FileStore::recover_interrupted_renames`] rolls the rename forward.

use crate::compound::{Compound, Undo, forgive_not_found};
use crate::keys::{recovery_key, recovery_range};
use crate::metadata::{self, DirEntry, FileKind, InodeId, Metadata};
use crate::ops::still_names;
use crate::store::FileStore;
use bytes::Bytes;
use keyfs_common::{Error, Result, WriteMode, key_successor};
use keyfs_pathmap::{Mutation, Purpose, path};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Markers fetched per range request during recovery
const RECOVERY_PAGE: usize = 64;

/// Outcome of one recovery pass over the rename markers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Renames rolled forward, markers cleared
    pub recovered: usize,
    /// Markers kept after a transient failure; a later pass retries them
    pub deferred: usize,
    /// Markers that cannot be acted on, such as undecodable ones
    pub failed: usize,
}

/// Everything needed to finish a rename someone else started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameIntent {
    pub origin: String,
    pub destination: String,
    pub inode: InodeId,
    pub kind: FileKind,
    pub old_parent: InodeId,
    pub new_parent: InodeId,
    /// Key the origin resolved to when the rename began
    pub storage_key: String,
}

impl RenameIntent {
    pub fn encode(&self) -> Result<Bytes> {
        metadata::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        metadata::decode(bytes, "rename marker")
    }

    const fn entry(&self) -> DirEntry {
        DirEntry {
            inode: self.inode,
            kind: self.kind,
        }
    }

    fn old_name(&self) -> &str {
        path::file_name(&self.origin)
    }

    fn new_name(&self) -> &str {
        path::file_name(&self.destination)
    }

    fn mutation(&self) -> Mutation {
        Mutation::moved(self.origin.as_str(), self.destination.as_str())
    }
}

impl<M: Metadata> FileStore<M> {
    /// Rename `origin` to `destination`, which must not exist
    pub async fn rename(&self, origin: &str, destination: &str) -> Result<()> {
        self.check_halted()?;
        let intent = self.plan_rename(origin, destination).await?;
        let mut compound = Compound::new(
            self,
            format!("rename {} -> {}", intent.origin, intent.destination),
        );
        if let Err(e) = self.announce_rename(&intent, &mut compound).await {
            return Err(compound.rollback(e).await);
        }
        if let Err(e) = self.complete_rename(&intent, &mut compound).await {
            return Err(compound.rollback(e).await);
        }
        self.clear_marker(&intent).await;
        counter!("keyfs_renames_total").increment(1);
        info!("Renamed {} to {}", intent.origin, intent.destination);
        Ok(())
    }

    pub(crate) async fn plan_rename(&self, origin: &str, destination: &str) -> Result<RenameIntent> {
        let origin = path::normalize(origin)?;
        let destination = path::normalize(destination)?;
        Mutation::moved(origin.as_str(), destination.as_str()).validate()?;
        self.paths.catch_up().await?;

        let resolution = self.resolve(&origin, Purpose::Lookup)?;
        let cached = self.get_metadata_at(&resolution).await?;
        let (old_parent, _) = self.parent_of(&origin).await?;
        let (new_parent, new_name) = self.parent_of(&destination).await?;
        if self.lookup_dirent(new_parent, &new_name).await?.is_some() {
            return Err(Error::AlreadyExists(destination));
        }

        Ok(RenameIntent {
            origin,
            destination,
            inode: cached.record.inode(),
            kind: cached.record.kind(),
            old_parent,
            new_parent,
            storage_key: resolution.key,
        })
    }

    /// Steps 1 and 2: after these the rename is recoverable by anyone
    pub(crate) async fn announce_rename(
        &self,
        intent: &RenameIntent,
        compound: &mut Compound<'_, M>,
    ) -> Result<()> {
        self.add_dirent(intent.new_parent, intent.new_name(), intent.entry())
            .await?;
        compound.done(
            "destination entry",
            Undo::RemoveDirent {
                parent: intent.new_parent,
                name: intent.new_name().to_string(),
            },
        );

        let marker = recovery_key(intent.inode);
        match self
            .ns
            .put(&marker, intent.encode()?, None, WriteMode::Versioned)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                return Err(Error::invalid_argument(format!(
                    "{} is already being renamed",
                    intent.origin
                )));
            }
            Err(e) => return Err(e),
        }
        compound.done("recovery marker", Undo::DeleteKey(marker));
        Ok(())
    }

    /// Steps 3 and 4
    async fn complete_rename(
        &self,
        intent: &RenameIntent,
        compound: &mut Compound<'_, M>,
    ) -> Result<()> {
        forgive_not_found(self.remove_dirent(intent.old_parent, intent.old_name()).await)?;
        compound.done(
            "origin entry",
            Undo::RestoreDirent {
                parent: intent.old_parent,
                name: intent.old_name().to_string(),
                entry: intent.entry(),
            },
        );

        self.paths
            .record_mutation(intent.mutation(), |map| {
                still_names(map, &intent.origin, &intent.storage_key)
            })
            .await?;
        Ok(())
    }

    async fn clear_marker(&self, intent: &RenameIntent) {
        let marker = recovery_key(intent.inode);
        if let Err(e) = forgive_not_found(self.ns.delete(&marker, None, WriteMode::Force).await) {
            // The rename is complete; recovery will find nothing left to do
            warn!("Could not remove rename marker {}: {}", marker, e);
        }
    }

    /// Finish every rename whose client died part way.
    ///
    /// A marker that cannot be handled is reported and skipped so it does not
    /// hold up the others.
    pub async fn recover_interrupted_renames(&self) -> Result<RecoveryReport> {
        self.check_halted()?;
        let (mut cursor, end) = recovery_range();
        let mut report = RecoveryReport::default();
        loop {
            let markers = self.ns.get_key_range(&cursor, &end, RECOVERY_PAGE).await?;
            let Some(last) = markers.last() else {
                break;
            };
            cursor = key_successor(last);
            for marker in &markers {
                match self.recover_marker(marker).await {
                    Ok(true) => report.recovered += 1,
                    Ok(false) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) if e.is_retryable() => {
                        warn!("Rename marker {} left for a later pass: {}", marker, e);
                        report.deferred += 1;
                    }
                    Err(e) => {
                        error!("Rename marker {} needs manual repair: {}", marker, e);
                        counter!("keyfs_rename_recovery_failures_total").increment(1);
                        report.failed += 1;
                    }
                }
            }
            if markers.len() < RECOVERY_PAGE {
                break;
            }
        }
        Ok(report)
    }

    /// Roll one marker's rename forward; false if the marker is already gone
    async fn recover_marker(&self, marker: &str) -> Result<bool> {
        let record = match self.ns.get(marker).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let intent = RenameIntent::decode(&record.value)?;
        self.roll_forward(&intent).await?;
        forgive_not_found(self.ns.delete(marker, None, WriteMode::Force).await)?;
        info!(
            "Recovered interrupted rename {} -> {}",
            intent.origin, intent.destination
        );
        Ok(true)
    }

    async fn roll_forward(&self, intent: &RenameIntent) -> Result<()> {
        self.paths.catch_up().await?;
        let logged =
            self.resolve(&intent.destination, Purpose::Lookup)?.key == intent.storage_key;
        if !logged {
            match self
                .add_dirent(intent.new_parent, intent.new_name(), intent.entry())
                .await
            {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        forgive_not_found(self.remove_dirent(intent.old_parent, intent.old_name()).await)?;
        if !logged {
            self.paths
                .record_mutation(intent.mutation(), |map| {
                    still_names(map, &intent.origin, &intent.storage_key)
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::dirent_key;
    use crate::metadata::InodeRecord;
    use crate::testing::{client, fixture};
    use keyfs_namespace::Namespace;
    use keyfs_pathmap::log::LOG_PREFIX;
    use std::sync::Arc;

    async fn markers(ns: &dyn Namespace) -> Vec<String> {
        let (start, end) = recovery_range();
        ns.get_key_range(&start, &end, 100).await.unwrap()
    }

    async fn root_inode(store: &FileStore<InodeRecord>) -> InodeId {
        store.get_metadata("/").await.unwrap().record.inode
    }

    /// `/docs/a.txt` and an empty `/archive`
    async fn populate(store: &FileStore<InodeRecord>) -> (InodeRecord, InodeRecord, InodeRecord) {
        let docs = InodeRecord::new(FileKind::Directory, 0o755);
        let archive = InodeRecord::new(FileKind::Directory, 0o755);
        let file = InodeRecord::new(FileKind::File, 0o644);
        store.create("/docs", &docs).await.unwrap();
        store.create("/archive", &archive).await.unwrap();
        store.create("/docs/a.txt", &file).await.unwrap();
        store
            .write_block(file.inode, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        (docs, archive, file)
    }

    #[tokio::test]
    async fn test_rename_directory() {
        let (ns, store) = fixture().await;
        let (docs, archive, file) = populate(&store).await;

        store.rename("/docs", "/archive/docs").await.unwrap();

        let root = root_inode(&store).await;
        assert_eq!(store.list_directory(root).await.unwrap(), vec!["archive"]);
        assert_eq!(store.list_directory(archive.inode).await.unwrap(), vec!["docs"]);
        assert_eq!(store.list_directory(docs.inode).await.unwrap(), vec!["a.txt"]);

        // The directory kept its storage key; only the name changed
        assert_eq!(store.resolve("/archive/docs", Purpose::Lookup).unwrap().key, "/docs");
        let moved = store.get_metadata("/archive/docs/a.txt").await.unwrap();
        assert_eq!(moved.record.inode, file.inode);
        assert_eq!(
            store.read_block(file.inode, 0).await.unwrap().unwrap(),
            Bytes::from_static(b"hello")
        );
        assert!(store.get_metadata("/docs").await.unwrap_err().is_not_found());
        assert!(markers(&*ns).await.is_empty());

        // Another client sees the same tree once it catches up
        let other = client(ns);
        other.paths().catch_up().await.unwrap();
        assert_eq!(
            other.get_metadata("/archive/docs").await.unwrap().record.inode,
            docs.inode
        );

        // The old name is free again and gets a key of its own
        let fresh = InodeRecord::new(FileKind::Directory, 0o755);
        store.create("/docs", &fresh).await.unwrap();
        assert_ne!(store.resolve("/docs", Purpose::Lookup).unwrap().key, "/docs");
        assert_eq!(store.get_metadata("/docs").await.unwrap().record.inode, fresh.inode);
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_destination() {
        let (_, store) = fixture().await;
        populate(&store).await;
        let err = store.rename("/docs", "/archive").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        let err = store.rename("/docs", "/docs/inside").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_interrupted_rename_is_rolled_forward() {
        let (ns, store) = fixture().await;
        let (docs, archive, _) = populate(&store).await;

        // The first client announces the rename and dies
        let intent = store.plan_rename("/docs", "/archive/docs").await.unwrap();
        let mut compound = Compound::new(&store, "rename".to_string());
        store.announce_rename(&intent, &mut compound).await.unwrap();
        drop(compound);
        assert_eq!(markers(&*ns).await.len(), 1);

        let survivor = client(Arc::clone(&ns));
        assert_eq!(survivor.recover_interrupted_renames().await.unwrap().recovered, 1);

        let root = root_inode(&survivor).await;
        assert_eq!(survivor.list_directory(root).await.unwrap(), vec!["archive"]);
        assert_eq!(
            survivor.list_directory(archive.inode).await.unwrap(),
            vec!["docs"]
        );
        assert_eq!(
            survivor.get_metadata("/archive/docs").await.unwrap().record.inode,
            docs.inode
        );
        assert!(markers(&*ns).await.is_empty());
        assert_eq!(survivor.recover_interrupted_renames().await.unwrap(), RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_recovery_after_move_was_logged() {
        let (ns, store) = fixture().await;
        let (_, archive, _) = populate(&store).await;
        ns.fail_deletes("recovery|");
        store.rename("/docs", "/archive/docs").await.unwrap();
        assert_eq!(markers(&*ns).await.len(), 1);
        ns.heal();

        let survivor = client(Arc::clone(&ns));
        assert_eq!(survivor.recover_interrupted_renames().await.unwrap().recovered, 1);
        assert_eq!(survivor.paths().map().version(), 1);
        assert_eq!(
            survivor.list_directory(archive.inode).await.unwrap(),
            vec!["docs"]
        );
    }

    #[tokio::test]
    async fn test_bad_marker_does_not_block_recovery() {
        let (ns, store) = fixture().await;
        let (docs, archive, _) = populate(&store).await;

        // Sorts ahead of the real marker below
        ns.put("recovery|0", Bytes::from_static(b"junk"), None, WriteMode::Versioned)
            .await
            .unwrap();
        let intent = store.plan_rename("/docs", "/archive/docs").await.unwrap();
        let mut compound = Compound::new(&store, "rename".to_string());
        store.announce_rename(&intent, &mut compound).await.unwrap();
        drop(compound);

        let survivor = client(Arc::clone(&ns));
        let report = survivor.recover_interrupted_renames().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                recovered: 1,
                deferred: 0,
                failed: 1,
            }
        );
        assert_eq!(
            survivor.get_metadata("/archive/docs").await.unwrap().record.inode,
            docs.inode
        );
        assert_eq!(
            survivor.list_directory(archive.inode).await.unwrap(),
            vec!["docs"]
        );
        // Only the undecodable marker is left for an operator
        assert_eq!(markers(&*ns).await, vec!["recovery|0"]);
    }

    #[tokio::test]
    async fn test_transient_failure_defers_marker() {
        let (ns, store) = fixture().await;
        let (docs, _, _) = populate(&store).await;
        let intent = store.plan_rename("/docs", "/archive/docs").await.unwrap();
        let mut compound = Compound::new(&store, "rename".to_string());
        store.announce_rename(&intent, &mut compound).await.unwrap();
        drop(compound);

        let survivor = client(Arc::clone(&ns));
        ns.fail_puts(LOG_PREFIX);
        let report = survivor.recover_interrupted_renames().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(markers(&*ns).await.len(), 1);

        ns.heal();
        let report = survivor.recover_interrupted_renames().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert!(markers(&*ns).await.is_empty());
        assert_eq!(
            survivor.get_metadata("/archive/docs").await.unwrap().record.inode,
            docs.inode
        );
    }

    #[tokio::test]
    async fn test_failed_rename_is_undone() {
        let (ns, store) = fixture().await;
        let (docs, archive, _) = populate(&store).await;
        ns.fail_puts(LOG_PREFIX);

        let err = store.rename("/docs", "/archive/docs").await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        let root = root_inode(&store).await;
        let mut names = store.list_directory(root).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["archive", "docs"]);
        assert!(store.list_directory(archive.inode).await.unwrap().is_empty());
        assert_eq!(store.get_metadata("/docs").await.unwrap().record.inode, docs.inode);
        assert!(markers(&*ns).await.is_empty());
        assert!(store.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_failed_undo_halts_the_client() {
        let (ns, store) = fixture().await;
        populate(&store).await;
        ns.fail_puts(LOG_PREFIX);
        ns.fail_deletes("recovery|");

        let err = store.rename("/docs", "/archive/docs").await.unwrap_err();
        let Error::Unsafe(fatal) = err else {
            panic!("expected a fatal error, got {err}");
        };
        assert_eq!(fatal.operation, "rename /docs -> /archive/docs");
        assert_eq!(fatal.step, "recovery marker");
        assert_eq!(store.fatal_error(), Some(fatal));

        // Nothing mutates afterwards, even with the faults gone
        ns.heal();
        let root = root_inode(&store).await;
        let err = store
            .create("/new", &InodeRecord::new(FileKind::File, 0o644))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(store.remove_dirent(root, "docs").await.unwrap_err().is_fatal());
        assert!(ns.get(&dirent_key(root, "docs")).await.is_ok());
    }
}
