//! Path mutation log entries

use crate::path::{self, ROOT};
use bytes::Bytes;
use keyfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a path mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// `origin` renamed to `target`
    Move,
    /// Symlink created at `origin` pointing to `target`
    Symlink,
    /// Access-control state of `origin` changed
    PermissionChange,
    /// `origin` unlinked
    Remove,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move => write!(f, "MOVE"),
            Self::Symlink => write!(f, "SYMLINK"),
            Self::PermissionChange => write!(f, "PERMISSION_CHANGE"),
            Self::Remove => write!(f, "REMOVE"),
        }
    }
}

/// One entry of the path mutation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Position in the log, assigned on append
    pub sequence: i64,
    pub kind: MutationKind,
    pub origin: String,
    /// Move destination or symlink target
    pub target: Option<String>,
}

impl Mutation {
    /// Rename `origin` to `destination`
    pub fn moved(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(MutationKind::Move, origin.into(), Some(destination.into()))
    }

    /// Symlink at `path` pointing to `target` (absolute or relative)
    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(MutationKind::Symlink, path.into(), Some(target.into()))
    }

    pub fn permission_change(path: impl Into<String>) -> Self {
        Self::new(MutationKind::PermissionChange, path.into(), None)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(MutationKind::Remove, path.into(), None)
    }

    const fn new(kind: MutationKind, origin: String, target: Option<String>) -> Self {
        Self {
            sequence: 0,
            kind,
            origin,
            target,
        }
    }

    /// Same mutation at another log position
    #[must_use]
    pub fn at(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Required target, or an error naming the mutation
    pub fn target(&self) -> Result<&str> {
        self.target
            .as_deref()
            .ok_or_else(|| Error::invalid_argument(format!("{} of {} has no target", self.kind, self.origin)))
    }

    /// Reject mutations no client could have applied.
    ///
    /// Paths must be normalized and outside the reserved reuse area; a move
    /// cannot involve the root or nest a directory inside itself.
    pub fn validate(&self) -> Result<()> {
        check_user_path(&self.origin)?;
        if self.origin == ROOT {
            return Err(Error::invalid_argument(format!("cannot {} the root", self.kind)));
        }
        match self.kind {
            MutationKind::Move => {
                let destination = self.target()?;
                check_user_path(destination)?;
                if destination == ROOT
                    || destination == self.origin
                    || path::is_descendant(destination, &self.origin)
                    || path::is_descendant(&self.origin, destination)
                {
                    return Err(Error::invalid_argument(format!(
                        "cannot move {} to {}",
                        self.origin, destination
                    )));
                }
            }
            MutationKind::Symlink => {
                let target = self.target()?;
                if target.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "symlink {} has an empty target",
                        self.origin
                    )));
                }
                let absolute = if target.starts_with('/') {
                    path::normalize(target)?
                } else {
                    let base = path::parent(&self.origin).unwrap_or(ROOT);
                    path::normalize(&path::join(base, target))?
                };
                if path::is_reserved(&absolute) {
                    return Err(Error::PermissionDenied(format!(
                        "symlink {} points into the reserved area",
                        self.origin
                    )));
                }
            }
            MutationKind::PermissionChange | MutationKind::Remove => {}
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::corruption(format!("undecodable log entry: {e}")))
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "#{} {} {} -> {}", self.sequence, self.kind, self.origin, target),
            None => write!(f, "#{} {} {}", self.sequence, self.kind, self.origin),
        }
    }
}

fn check_user_path(path: &str) -> Result<()> {
    if path::normalize(path)? != path {
        return Err(Error::invalid_argument(format!("path '{path}' is not normalized")));
    }
    if path::is_reserved(path) {
        return Err(Error::PermissionDenied(format!("path '{path}' is reserved")));
    }
    Ok(())
}
