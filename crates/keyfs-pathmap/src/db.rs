//! Path map
//!
//! In-memory projection of the mutation log: which storage key a user path
//! currently names. A path with no mapping on itself or any ancestor is
//! stored under its own name.
//!
//! Mappings:
//! - `Move` at a rename destination names the storage key the renamed inode
//!   already had. The key was resolved when the move was applied, so chains
//!   of renames collapse into one hop.
//! - `Reuse` at a rename origin names a fresh key for whatever is created
//!   there next, because the old key is still held by the moved inode.
//! - `Symlink` carries the link target plus the key of the link's own metadata.
//! - `Permission` only carries an epoch.
//!
//! An entry is "displaced" when the key its path would fall back to is held
//! by some other inode. Removing a displaced entry leaves a `Reuse` behind.

use crate::mutation::{Mutation, MutationKind};
use crate::path::{self, ROOT};
use bytes::Bytes;
use keyfs_common::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Redirection recorded for a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mapping {
    Move { key: String, displaced: bool },
    Reuse { key: String },
    Symlink {
        target: String,
        key: String,
        displaced: bool,
    },
    Permission,
}

impl Mapping {
    const fn displaced(&self) -> bool {
        match self {
            Self::Reuse { .. } => true,
            Self::Move { displaced, .. } | Self::Symlink { displaced, .. } => *displaced,
            Self::Permission => false,
        }
    }
}

/// A mapping plus the last log sequence that changed the path's permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub mapping: Mapping,
    pub epoch: i64,
}

impl MapEntry {
    const fn new(mapping: Mapping, epoch: i64) -> Self {
        Self { mapping, epoch }
    }
}

/// Why a path is being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Purpose {
    /// Open, stat and friends: a trailing symlink names the link itself
    #[default]
    Lookup,
    /// Dereference a trailing symlink
    Readlink,
}

/// Storage key a path resolves to and the epoch a cached copy must have reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: String,
    pub epoch: i64,
}

/// Whole map at a log version
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PathMapSnapshot {
    pub version: i64,
    pub entries: BTreeMap<String, MapEntry>,
}

impl PathMapSnapshot {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::corruption(format!("undecodable path map snapshot: {e}")))
    }
}

#[derive(Default)]
struct MapState {
    entries: BTreeMap<String, MapEntry>,
    version: i64,
}

impl MapState {
    fn resolve(&self, path: &str, follow_terminal: bool, max_hops: usize) -> Result<Resolution> {
        let mut current = path.to_string();
        let mut epoch = 0;
        let mut hops = 0;

        'walk: loop {
            let mut prefix = Some(current.as_str());
            while let Some(at) = prefix {
                if let Some(entry) = self.entries.get(at) {
                    epoch = epoch.max(entry.epoch);
                    let suffix = &current[at.len()..];
                    match &entry.mapping {
                        Mapping::Permission => {}
                        Mapping::Move { key, .. } | Mapping::Reuse { key } => {
                            return Ok(Resolution {
                                key: path::join(key, suffix),
                                epoch: epoch.max(self.ancestor_epoch(at)),
                            });
                        }
                        Mapping::Symlink { key, .. } if suffix.is_empty() && !follow_terminal => {
                            return Ok(Resolution {
                                key: key.clone(),
                                epoch: epoch.max(self.ancestor_epoch(at)),
                            });
                        }
                        Mapping::Symlink { target, .. } => {
                            hops += 1;
                            if hops > max_hops {
                                return Err(Error::SymlinkLoop {
                                    path: path.to_string(),
                                });
                            }
                            let base = if target.starts_with('/') {
                                target.clone()
                            } else {
                                path::join(path::parent(at).unwrap_or(ROOT), target)
                            };
                            let next = path::normalize(&path::join(&base, suffix))?;
                            epoch = epoch.max(self.ancestor_epoch(at));
                            current = next;
                            continue 'walk;
                        }
                    }
                }
                prefix = path::parent(at);
            }
            return Ok(Resolution { key: current, epoch });
        }
    }

    fn ancestor_epoch(&self, path: &str) -> i64 {
        let mut epoch = 0;
        let mut prefix = path::parent(path);
        while let Some(at) = prefix {
            if let Some(entry) = self.entries.get(at) {
                epoch = epoch.max(entry.epoch);
            }
            prefix = path::parent(at);
        }
        epoch
    }

    /// Key `path` would have without an entry of its own
    fn fallback_key(&self, path: &str, max_hops: usize) -> Result<String> {
        match path::parent(path) {
            None => Ok(path.to_string()),
            Some(parent) => {
                let parent_key = self.resolve(parent, true, max_hops)?.key;
                Ok(path::join(&parent_key, path::file_name(path)))
            }
        }
    }

    fn take_descendants(&mut self, ancestor: &str) -> Vec<(String, MapEntry)> {
        let paths: Vec<String> = self
            .entries
            .range::<str, _>((std::ops::Bound::Excluded(ancestor), std::ops::Bound::Unbounded))
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(ancestor))
            .filter(|path| path::is_descendant(path, ancestor))
            .cloned()
            .collect();
        paths
            .into_iter()
            .filter_map(|path| self.entries.remove(&path).map(|entry| (path, entry)))
            .collect()
    }

    fn apply_mutation(&mut self, mutation: &Mutation, max_hops: usize) -> Result<()> {
        let sequence = mutation.sequence;
        let origin = mutation.origin.as_str();
        match mutation.kind {
            MutationKind::Move => self.apply_move(origin, mutation.target()?, sequence, max_hops),
            MutationKind::Symlink => {
                self.apply_symlink(origin, mutation.target()?, sequence, max_hops)
            }
            MutationKind::PermissionChange => {
                self.entries
                    .entry(origin.to_string())
                    .and_modify(|entry| entry.epoch = sequence)
                    .or_insert_with(|| MapEntry::new(Mapping::Permission, sequence));
                Ok(())
            }
            MutationKind::Remove => {
                self.apply_remove(origin, sequence);
                Ok(())
            }
        }
    }

    fn apply_move(
        &mut self,
        origin: &str,
        destination: &str,
        sequence: i64,
        max_hops: usize,
    ) -> Result<()> {
        // Everything fallible happens before the map changes
        let moved_key = self.resolve(origin, false, max_hops)?.key;
        let origin_fallback = self.fallback_key(origin, max_hops)?;
        let destination_fallback = self.fallback_key(destination, max_hops)?;

        let origin_entry = self.entries.remove(origin);
        let carried_epoch = origin_entry.as_ref().map_or(0, |e| e.epoch);
        let origin_displaced = origin_entry.as_ref().is_some_and(|e| e.mapping.displaced());
        let symlink_target = match origin_entry.map(|e| e.mapping) {
            Some(Mapping::Symlink { target, .. }) => Some(target),
            _ => None,
        };

        let beneath = self.take_descendants(origin);
        let replaced = self.take_descendants(destination);
        if !replaced.is_empty() {
            debug!("Dropping {} stale entries beneath {}", replaced.len(), destination);
        }

        // The origin's old key now belongs to the moved inode
        if origin_displaced || origin_fallback == moved_key {
            self.entries.insert(
                origin.to_string(),
                MapEntry::new(
                    Mapping::Reuse {
                        key: path::reuse_key(sequence, origin),
                    },
                    0,
                ),
            );
        }

        let destination_displaced = self
            .entries
            .remove(destination)
            .is_some_and(|e| e.mapping.displaced());
        let mapping = match symlink_target {
            Some(target) => Some(Mapping::Symlink {
                target,
                displaced: destination_displaced && moved_key != destination_fallback,
                key: moved_key.clone(),
            }),
            // Moved back to where its key came from
            None if moved_key == destination_fallback => None,
            None => Some(Mapping::Move {
                key: moved_key.clone(),
                displaced: destination_displaced,
            }),
        };
        match mapping {
            Some(mapping) => {
                self.entries
                    .insert(destination.to_string(), MapEntry::new(mapping, carried_epoch));
            }
            None if carried_epoch > 0 => {
                self.entries.insert(
                    destination.to_string(),
                    MapEntry::new(Mapping::Permission, carried_epoch),
                );
            }
            None => {}
        }

        for (path, entry) in beneath {
            let renamed = format!("{destination}{}", &path[origin.len()..]);
            self.entries.insert(renamed, entry);
        }
        Ok(())
    }

    fn apply_symlink(
        &mut self,
        link: &str,
        target: &str,
        sequence: i64,
        max_hops: usize,
    ) -> Result<()> {
        let fallback = self.fallback_key(link, max_hops)?;
        let existing = self.entries.remove(link);
        let epoch = existing.as_ref().map_or(0, |e| e.epoch);
        let (key, displaced) = match existing.map(|e| e.mapping) {
            Some(Mapping::Reuse { key }) => (key, true),
            Some(mapping) if mapping.displaced() => (path::reuse_key(sequence, link), true),
            _ => (fallback, false),
        };
        self.entries.insert(
            link.to_string(),
            MapEntry::new(
                Mapping::Symlink {
                    target: target.to_string(),
                    key,
                    displaced,
                },
                epoch,
            ),
        );
        Ok(())
    }

    fn apply_remove(&mut self, removed: &str, sequence: i64) {
        let Some(entry) = self.entries.get(removed) else {
            return;
        };
        match &entry.mapping {
            Mapping::Reuse { .. } => {}
            mapping if mapping.displaced() => {
                self.entries.insert(
                    removed.to_string(),
                    MapEntry::new(
                        Mapping::Reuse {
                            key: path::reuse_key(sequence, removed),
                        },
                        0,
                    ),
                );
            }
            _ => {
                self.entries.remove(removed);
            }
        }
    }

    /// Apply one log entry at the next version
    fn apply_next(&mut self, mutation: &Mutation, max_hops: usize) -> Result<bool> {
        let expected = self.version + 1;
        if mutation.sequence < expected {
            return Ok(false);
        }
        if mutation.sequence > expected {
            return Err(Error::LogOutOfOrder {
                expected,
                actual: mutation.sequence,
            });
        }
        // Every client skips the same invalid entries, so the maps still agree
        if let Err(e) = mutation
            .validate()
            .and_then(|()| self.apply_mutation(mutation, max_hops))
        {
            warn!("Skipping log entry {}: {}", mutation, e);
        }
        self.version = mutation.sequence;
        Ok(true)
    }
}

/// Path map shared by every resolver of one client
///
/// Resolutions take the read side of a readers-biased lock and never wait
/// for each other; a mutation waits until no resolution is in flight and
/// then has the map to itself, so a move's paired entries appear together.
pub struct PathMapDb {
    state: RwLock<MapState>,
    max_symlink_hops: usize,
}

impl PathMapDb {
    pub fn new(max_symlink_hops: usize) -> Self {
        Self {
            state: RwLock::new(MapState::default()),
            max_symlink_hops,
        }
    }

    /// Resolve a user path to its storage key
    pub fn resolve(&self, path: &str, purpose: Purpose) -> Result<Resolution> {
        let path = path::normalize(path)?;
        self.state
            .read_recursive()
            .resolve(&path, purpose == Purpose::Readlink, self.max_symlink_hops)
    }

    /// Log version the map reflects
    pub fn version(&self) -> i64 {
        self.state.read_recursive().version
    }

    pub fn len(&self) -> usize {
        self.state.read_recursive().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry recorded for exactly `path`
    pub fn entry(&self, path: &str) -> Option<MapEntry> {
        self.state.read_recursive().entries.get(path).cloned()
    }

    /// Apply a log entry; `Ok(false)` if it was already applied
    pub fn apply(&self, mutation: &Mutation) -> Result<bool> {
        self.state.write().apply_next(mutation, self.max_symlink_hops)
    }

    /// Record a rename at log position `sequence`
    pub fn add_directory_move(&self, origin: &str, destination: &str, sequence: i64) -> Result<bool> {
        self.apply(&Mutation::moved(origin, destination).at(sequence))
    }

    pub fn add_soft_link(&self, link: &str, target: &str, sequence: i64) -> Result<bool> {
        self.apply(&Mutation::symlink(link, target).at(sequence))
    }

    pub fn add_permission_change(&self, path: &str, sequence: i64) -> Result<bool> {
        self.apply(&Mutation::permission_change(path).at(sequence))
    }

    pub fn add_unlink(&self, path: &str, sequence: i64) -> Result<bool> {
        self.apply(&Mutation::remove(path).at(sequence))
    }

    /// Apply the entries of `(from_version, to_version]` in order.
    ///
    /// Entries already reflected are skipped; the map must not be behind
    /// `from_version` and must reach `to_version`.
    pub fn apply_log_range(
        &self,
        entries: &[Mutation],
        from_version: i64,
        to_version: i64,
    ) -> Result<usize> {
        let mut state = self.state.write();
        if from_version > state.version {
            return Err(Error::LogOutOfOrder {
                expected: state.version + 1,
                actual: from_version + 1,
            });
        }
        let mut applied = 0;
        for entry in entries
            .iter()
            .filter(|e| e.sequence > from_version && e.sequence <= to_version)
        {
            if state.apply_next(entry, self.max_symlink_hops)? {
                applied += 1;
            }
        }
        if state.version < to_version {
            return Err(Error::LogOutOfOrder {
                expected: state.version + 1,
                actual: to_version,
            });
        }
        Ok(applied)
    }

    pub fn snapshot(&self) -> PathMapSnapshot {
        let state = self.state.read_recursive();
        PathMapSnapshot {
            version: state.version,
            entries: state.entries.clone(),
        }
    }

    /// Replace the map with a newer snapshot; false if it is not newer
    pub fn load_snapshot(&self, snapshot: PathMapSnapshot) -> bool {
        let mut state = self.state.write();
        if snapshot.version <= state.version {
            return false;
        }
        debug!(
            "Loading path map snapshot at version {} over version {}",
            snapshot.version, state.version
        );
        state.entries = snapshot.entries;
        state.version = snapshot.version;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> PathMapDb {
        PathMapDb::new(40)
    }

    fn key(db: &PathMapDb, path: &str) -> String {
        db.resolve(path, Purpose::Lookup).unwrap().key
    }

    #[test]
    fn test_resolution_idempotence() {
        let db = db();
        let first = db.resolve("/a/b/c", Purpose::Lookup).unwrap();
        let second = db.resolve("/a/b/c", Purpose::Lookup).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.key, "/a/b/c");
        assert_eq!(first.epoch, 0);
    }

    #[test]
    fn test_move_round_trip_empties_table() {
        let db = db();
        db.add_directory_move("/x/a", "/x/b", 1).unwrap();
        assert_eq!(key(&db, "/x/b"), "/x/a");
        assert_eq!(key(&db, "/x/a"), "/.reuse/1/x/a");

        db.add_directory_move("/x/b", "/x/a", 2).unwrap();
        assert!(db.is_empty());
        assert_eq!(key(&db, "/x/a"), "/x/a");
        assert_eq!(key(&db, "/x/b"), "/x/b");
    }

    #[test]
    fn test_move_chaining() {
        let db = db();
        let original = key(&db, "/a");
        db.add_directory_move("/a", "/b", 1).unwrap();
        db.add_directory_move("/b", "/c", 2).unwrap();

        assert_eq!(key(&db, "/c"), original);
        assert_eq!(key(&db, "/c/file"), "/a/file");
        assert_ne!(key(&db, "/a"), original);
        // The intermediate name holds nothing
        assert_eq!(key(&db, "/b"), "/b");
        assert!(db.entry("/b").is_none());
    }

    #[test]
    fn test_move_out_of_reuse_mints_new_token() {
        let db = db();
        db.add_directory_move("/a", "/b", 1).unwrap();
        // Something new was created at /a, then moved away too
        db.add_directory_move("/a", "/c", 2).unwrap();
        assert_eq!(key(&db, "/c"), "/.reuse/1/a");
        assert_eq!(key(&db, "/a"), "/.reuse/2/a");
        assert_eq!(key(&db, "/b"), "/a");
    }

    #[test]
    fn test_symlink_cycle_is_an_error() {
        let db = db();
        db.add_soft_link("/a", "/b", 1).unwrap();
        db.add_soft_link("/b", "/a", 2).unwrap();
        assert!(matches!(
            db.resolve("/a/f", Purpose::Lookup),
            Err(Error::SymlinkLoop { .. })
        ));
        assert!(matches!(
            db.resolve("/a", Purpose::Readlink),
            Err(Error::SymlinkLoop { .. })
        ));
    }

    #[test]
    fn test_symlink_hop_limit() {
        let db = PathMapDb::new(40);
        // /l0 -> /l1 -> ... -> /l40 -> /dir: 41 hops from /l0, 40 from /l1
        for n in 0..=40 {
            let target = if n == 40 { "/dir".to_string() } else { format!("/l{}", n + 1) };
            db.add_soft_link(&format!("/l{n}"), &target, n + 1).unwrap();
        }
        assert_eq!(key(&db, "/l1/f"), "/dir/f");
        assert!(matches!(
            db.resolve("/l0/f", Purpose::Lookup),
            Err(Error::SymlinkLoop { .. })
        ));
    }

    #[test]
    fn test_terminal_symlink_only_followed_for_readlink() {
        let db = db();
        db.add_soft_link("/d/link", "../t", 1).unwrap();
        assert_eq!(key(&db, "/d/link"), "/d/link");
        assert_eq!(db.resolve("/d/link", Purpose::Readlink).unwrap().key, "/t");
        // Intermediate components are always followed
        assert_eq!(key(&db, "/d/link/f"), "/t/f");
    }

    #[test]
    fn test_move_then_parent_move_keeps_reuse() {
        // mv /p/a /q; mv /p /r
        let db = db();
        db.add_directory_move("/p/a", "/q", 1).unwrap();
        db.add_directory_move("/p", "/r", 2).unwrap();

        assert_eq!(key(&db, "/q"), "/p/a");
        assert_eq!(key(&db, "/r/other"), "/p/other");
        // A new /r/a must not land on the key /q holds
        assert_eq!(key(&db, "/r/a"), "/.reuse/1/p/a");
        assert_eq!(key(&db, "/p"), "/.reuse/2/p");
        assert_eq!(key(&db, "/p/a"), "/.reuse/2/p/a");

        // Moving /q back under its old parent is the identity again
        db.add_directory_move("/q", "/r/a", 3).unwrap();
        assert!(db.entry("/r/a").is_none());
        assert_eq!(key(&db, "/r/a"), "/p/a");
    }

    #[test]
    fn test_displaced_destination_leaves_reuse_on_move_out() {
        let db = db();
        db.add_directory_move("/b", "/z", 1).unwrap();
        db.add_directory_move("/a", "/b", 2).unwrap();
        db.add_directory_move("/b", "/c", 3).unwrap();

        assert_eq!(key(&db, "/z"), "/b");
        assert_eq!(key(&db, "/c"), "/a");
        // /b's own key is still held by /z
        assert_eq!(key(&db, "/b"), "/.reuse/3/b");
    }

    #[test]
    fn test_symlink_shadowed_by_rename_of_its_target() {
        let db = db();
        db.add_soft_link("/l", "/t", 1).unwrap();
        db.add_directory_move("/t", "/u", 2).unwrap();

        // The renamed directory keeps its original key
        assert_eq!(key(&db, "/u/f"), "/t/f");
        // The link now dangles into whatever replaces /t, never the moved inode
        assert_eq!(key(&db, "/l/f"), "/.reuse/2/t/f");
        assert_eq!(key(&db, "/t/f"), "/.reuse/2/t/f");

        // A moved directory is never redirected through its old name's reuse
        db.add_directory_move("/u", "/v", 3).unwrap();
        assert_eq!(key(&db, "/v/f"), "/t/f");
    }

    #[test]
    fn test_moving_a_symlink_keeps_it_a_symlink() {
        let db = db();
        db.add_soft_link("/l", "/t", 1).unwrap();
        db.add_directory_move("/l", "/m", 2).unwrap();
        assert_eq!(key(&db, "/m"), "/l");
        assert_eq!(key(&db, "/m/f"), "/t/f");
        assert_eq!(key(&db, "/l"), "/.reuse/2/l");
    }

    #[test]
    fn test_permission_epochs() {
        let db = db();
        db.add_permission_change("/p", 1).unwrap();
        db.add_directory_move("/p/a", "/p/b", 2).unwrap();
        db.add_permission_change("/other", 3).unwrap();

        assert_eq!(db.resolve("/p/b", Purpose::Lookup).unwrap().epoch, 1);
        assert_eq!(db.resolve("/p/c/d", Purpose::Lookup).unwrap().epoch, 1);
        assert_eq!(db.resolve("/q", Purpose::Lookup).unwrap().epoch, 0);

        // The epoch travels with a renamed path
        db.add_permission_change("/p/b", 4).unwrap();
        db.add_directory_move("/p/b", "/moved", 5).unwrap();
        let resolved = db.resolve("/moved", Purpose::Lookup).unwrap();
        assert_eq!(resolved.key, "/p/a");
        assert_eq!(resolved.epoch, 4);
    }

    #[test]
    fn test_unlink() {
        let db = db();
        db.add_directory_move("/a", "/b", 1).unwrap();
        db.add_unlink("/b", 2).unwrap();
        assert!(db.entry("/b").is_none());
        // /a keeps pointing away from the deleted inode's key
        assert_eq!(key(&db, "/a"), "/.reuse/1/a");

        db.add_soft_link("/l", "/t", 3).unwrap();
        db.add_unlink("/l", 4).unwrap();
        assert_eq!(key(&db, "/l"), "/l");

        // A link created over a reuse placeholder is displaced
        db.add_soft_link("/a", "/t", 5).unwrap();
        assert_eq!(key(&db, "/a"), "/.reuse/1/a");
        db.add_unlink("/a", 6).unwrap();
        assert_eq!(key(&db, "/a"), "/.reuse/6/a");
    }

    #[test]
    fn test_apply_order_and_idempotence() {
        let db = db();
        let err = db.apply(&Mutation::remove("/x").at(2)).unwrap_err();
        assert!(matches!(err, Error::LogOutOfOrder { expected: 1, actual: 2 }));

        assert!(db.apply(&Mutation::moved("/a", "/b").at(1)).unwrap());
        assert!(!db.apply(&Mutation::moved("/a", "/b").at(1)).unwrap());
        assert_eq!(db.version(), 1);
        assert_eq!(key(&db, "/b"), "/a");
    }

    #[test]
    fn test_invalid_entry_skipped_but_counted() {
        let db = db();
        assert!(db.apply(&Mutation::moved("/a", "/a/b").at(1)).unwrap());
        assert_eq!(db.version(), 1);
        assert!(db.is_empty());
    }

    #[test]
    fn test_apply_log_range() {
        let db = db();
        let entries = vec![
            Mutation::moved("/a", "/b").at(1),
            Mutation::permission_change("/b").at(2),
            Mutation::moved("/b", "/c").at(3),
        ];
        assert_eq!(db.apply_log_range(&entries[..2], 0, 2).unwrap(), 2);
        // Overlapping range: already-applied entries are skipped
        assert_eq!(db.apply_log_range(&entries, 1, 3).unwrap(), 1);
        assert_eq!(key(&db, "/c"), "/a");

        // Gap in the middle
        let fresh = PathMapDb::new(40);
        let gapped = [entries[0].clone(), entries[2].clone()];
        assert!(fresh.apply_log_range(&gapped, 0, 3).is_err());
        // Range starting past the map
        assert!(fresh.apply_log_range(&entries[2..], 2, 3).is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let db = db();
        db.add_directory_move("/a", "/b", 1).unwrap();
        db.add_soft_link("/l", "/b", 2).unwrap();
        let snapshot = PathMapSnapshot::decode(&db.snapshot().encode().unwrap()).unwrap();

        let restored = PathMapDb::new(40);
        assert!(restored.load_snapshot(snapshot.clone()));
        assert_eq!(restored.version(), 2);
        assert_eq!(key(&restored, "/l/f"), "/a/f");
        // Not newer: ignored
        assert!(!restored.load_snapshot(snapshot));
    }

    #[test]
    fn test_resolution_never_sees_half_a_move() {
        let db = db();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for sequence in 1..=2000 {
                    let entry = if sequence % 2 == 1 {
                        Mutation::moved("/x/a", "/x/b")
                    } else {
                        Mutation::moved("/x/b", "/x/a")
                    };
                    db.apply(&entry.at(sequence)).unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..2000 {
                        let resolved = key(&db, "/x/b");
                        assert!(resolved == "/x/a" || resolved == "/x/b", "torn: {resolved}");
                    }
                });
            }
        });
        assert!(db.is_empty());
    }
}
