//! KeyFS path virtualization
//!
//! Renames, symlinks and permission changes are recorded as entries of a
//! replicated, append-only log instead of moving keys around. Each client
//! replays the log into a local [`PathMapDb`] and resolves user paths to
//! storage keys without touching the network.

pub mod db;
pub mod log;
pub mod mutation;
pub mod path;
pub mod service;

pub use db::{MapEntry, Mapping, PathMapDb, PathMapSnapshot, Purpose, Resolution};
pub use log::MutationLog;
pub use mutation::{Mutation, MutationKind};
pub use service::PathService;
