//! Checksum utilities for KeyFS
//!
//! Drives store a digest next to every record value, computed with the
//! algorithm the record was written with, and verify it on every read.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Algorithm used to protect a stored record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    /// CRC32C (fast, hardware accelerated)
    #[default]
    Crc32c,
    /// xxHash64 (fast, wider)
    XxHash64,
    /// SHA256 (slow, cryptographic)
    Sha256,
}

impl ChecksumAlgorithm {
    /// Compute the checksum of `data` with this algorithm
    #[must_use]
    pub fn compute(self, data: &[u8]) -> Checksum {
        let value = match self {
            Self::Crc32c => crc32c::crc32c(data).to_le_bytes().to_vec(),
            Self::XxHash64 => xxhash_rust::xxh64::xxh64(data, 0).to_le_bytes().to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        };
        Checksum {
            algorithm: self,
            value,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Crc32c => "crc32c",
            Self::XxHash64 => "xxhash64",
            Self::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

/// A computed checksum value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: Vec<u8>,
}

impl Checksum {
    /// Verify data against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm.compute(data).value == self.value
    }

    /// Hex rendering of the digest, for error messages
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.value.iter().map(|b| format!("{b:02x}")).collect()
    }
}
