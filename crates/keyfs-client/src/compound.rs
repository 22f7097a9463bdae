//! Multi-step operations with undo
//!
//! Each completed step registers how to take it back. On failure the steps
//! are undone newest first; if an undo fails the client halts with a
//! [`FatalError`] rather than keep mutating a filesystem in an unknown state.

use crate::keys::dirent_key;
use crate::metadata::{DirEntry, InodeId, Metadata};
use crate::store::FileStore;
use bytes::Bytes;
use keyfs_common::{Error, FatalError, Result, WriteMode};
use tracing::{debug, warn};

pub(crate) enum Undo {
    /// Remove a directory entry we added
    RemoveDirent { parent: InodeId, name: String },
    /// Put back a directory entry we removed
    RestoreDirent {
        parent: InodeId,
        name: String,
        entry: DirEntry,
    },
    /// Delete a key we created
    DeleteKey(String),
    /// Put back the value of a key we overwrote or deleted
    RestoreKey { key: String, value: Bytes },
}

pub(crate) struct Compound<'a, M: Metadata> {
    store: &'a FileStore<M>,
    operation: String,
    done: Vec<(&'static str, Undo)>,
}

impl<'a, M: Metadata> Compound<'a, M> {
    pub(crate) const fn new(store: &'a FileStore<M>, operation: String) -> Self {
        Self {
            store,
            operation,
            done: Vec::new(),
        }
    }

    /// Register a completed step
    pub(crate) fn done(&mut self, step: &'static str, undo: Undo) {
        self.done.push((step, undo));
    }

    /// Undo every completed step and return the error to report
    pub(crate) async fn rollback(self, cause: Error) -> Error {
        warn!("{} failed, undoing {} steps: {}", self.operation, self.done.len(), cause);
        for (step, undo) in self.done.into_iter().rev() {
            if let Err(e) = undo_step(self.store, undo).await {
                return self.store.halt(FatalError {
                    operation: self.operation,
                    step: step.to_string(),
                    cause: e.to_string(),
                });
            }
            debug!("Undid '{}' of {}", step, self.operation);
        }
        cause
    }
}

async fn undo_step<M: Metadata>(store: &FileStore<M>, undo: Undo) -> Result<()> {
    let ns = &store.ns;
    match undo {
        Undo::RemoveDirent { parent, name } => {
            forgive_not_found(ns.delete(&dirent_key(parent, &name), None, WriteMode::Force).await)
        }
        Undo::RestoreDirent {
            parent,
            name,
            entry,
        } => ns
            .put(&dirent_key(parent, &name), entry.to_bytes()?, None, WriteMode::Force)
            .await
            .map(|_| ()),
        Undo::DeleteKey(key) => {
            store.forget(&key);
            forgive_not_found(ns.delete(&key, None, WriteMode::Force).await)
        }
        Undo::RestoreKey { key, value } => {
            store.forget(&key);
            ns.put(&key, value, None, WriteMode::Force).await.map(|_| ())
        }
    }
}

pub(crate) fn forgive_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
