//! KeyFS Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, drive/partition/record types,
//! checksums and configuration used across all KeyFS components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumAlgorithm};
pub use config::Config;
pub use error::{Error, FatalError, Result};
pub use types::*;
