//! Mutation log and snapshot store
//!
//! Entries live in the namespace under `pathlog|{sequence}` and are written
//! create-only, so exactly one client wins each sequence number. A tail
//! pointer records how far the log is known to reach; it is only a hint and
//! readers probe past it. Compacted path maps are kept under one snapshot key.

use crate::db::PathMapSnapshot;
use crate::mutation::Mutation;
use bytes::Bytes;
use futures::future::try_join_all;
use keyfs_common::{Error, Result, Version, WriteMode};
use keyfs_namespace::Namespace;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key prefix shared by every log record
pub const LOG_PREFIX: &str = "pathlog|";

const TAIL_KEY: &str = "pathlog|tail";
const SNAPSHOT_KEY: &str = "pathlog|snapshot";

/// Entries fetched concurrently when reading a range
const READ_BATCH: usize = 64;

/// Tail pointer advance attempts before giving up on the hint
const TAIL_RETRIES: usize = 3;

/// Key of the log entry at `sequence`
pub fn entry_key(sequence: i64) -> String {
    format!("{LOG_PREFIX}{sequence:020}")
}

fn decode_sequence(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::corruption(format!("log tail has {} bytes", bytes.len())))?;
    Ok(i64::from_le_bytes(raw))
}

/// Replicated, append-only log of path mutations
pub struct MutationLog {
    ns: Arc<dyn Namespace>,
}

impl MutationLog {
    pub fn new(ns: Arc<dyn Namespace>) -> Self {
        Self { ns }
    }

    /// Append `mutation` at its sequence number.
    ///
    /// Fails with `VersionConflict` if another client already wrote that
    /// sequence.
    pub async fn append(&self, mutation: &Mutation) -> Result<i64> {
        let sequence = mutation.sequence;
        if sequence < 1 {
            return Err(Error::invalid_argument(format!(
                "log sequence {sequence} is not positive"
            )));
        }
        let key = entry_key(sequence);
        if let Err(e) = self
            .ns
            .put(&key, mutation.encode()?, None, WriteMode::Versioned)
            .await
        {
            if e.is_conflict() {
                counter!("keyfs_log_append_conflicts_total").increment(1);
                debug!("Log sequence {} already taken", sequence);
            }
            return Err(e);
        }
        self.advance_tail(sequence).await;
        Ok(sequence)
    }

    async fn read_tail(&self) -> Result<(i64, Option<Version>)> {
        match self.ns.get(TAIL_KEY).await {
            Ok(record) => Ok((decode_sequence(&record.value)?, Some(record.version))),
            Err(e) if e.is_not_found() => Ok((0, None)),
            Err(e) => Err(e),
        }
    }

    /// Move the tail pointer forward to `sequence` unless it is already past
    async fn advance_tail(&self, sequence: i64) {
        for _ in 0..TAIL_RETRIES {
            let (tail, version) = match self.read_tail().await {
                Ok(tail) => tail,
                Err(e) => {
                    warn!("Failed to read log tail: {}", e);
                    return;
                }
            };
            if tail >= sequence {
                return;
            }
            let value = Bytes::copy_from_slice(&sequence.to_le_bytes());
            match self
                .ns
                .put(TAIL_KEY, value, version.as_ref(), WriteMode::Versioned)
                .await
            {
                Ok(_) => return,
                Err(e) if e.is_conflict() => {}
                Err(e) => {
                    warn!("Failed to advance log tail to {}: {}", sequence, e);
                    return;
                }
            }
        }
    }

    /// Highest sequence present in the log, 0 if empty
    pub async fn latest_sequence(&self) -> Result<i64> {
        let (mut sequence, _) = self.read_tail().await?;
        loop {
            match self.ns.get_version(&entry_key(sequence + 1)).await {
                Ok(_) => sequence += 1,
                Err(e) if e.is_not_found() => return Ok(sequence),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn read(&self, sequence: i64) -> Result<Mutation> {
        let record = self.ns.get(&entry_key(sequence)).await?;
        let mutation = Mutation::decode(&record.value)?;
        if mutation.sequence != sequence {
            return Err(Error::corruption(format!(
                "log entry {sequence} claims sequence {}",
                mutation.sequence
            )));
        }
        Ok(mutation)
    }

    /// Entries `(after, through]` in order
    pub async fn read_range(&self, after: i64, through: i64) -> Result<Vec<Mutation>> {
        let sequences: Vec<i64> = (after + 1..=through).collect();
        let mut entries = Vec::with_capacity(sequences.len());
        for batch in sequences.chunks(READ_BATCH) {
            entries.extend(try_join_all(batch.iter().map(|&s| self.read(s))).await?);
        }
        Ok(entries)
    }

    /// Store a snapshot unless a newer one is already stored
    pub async fn write_snapshot(&self, snapshot: &PathMapSnapshot) -> Result<bool> {
        let existing = match self.ns.get(SNAPSHOT_KEY).await {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(record) = &existing {
            let stored = PathMapSnapshot::decode(&record.value)?;
            if stored.version >= snapshot.version {
                return Ok(false);
            }
        }

        let expected = existing.as_ref().map(|r| &r.version);
        match self
            .ns
            .put(SNAPSHOT_KEY, snapshot.encode()?, expected, WriteMode::Versioned)
            .await
        {
            Ok(_) => {
                debug!("Stored path map snapshot at version {}", snapshot.version);
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn read_snapshot(&self) -> Result<Option<PathMapSnapshot>> {
        match self.ns.get(SNAPSHOT_KEY).await {
            Ok(record) => PathMapSnapshot::decode(&record.value).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
