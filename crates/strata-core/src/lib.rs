//! # strata-core
//!
//! Core primitives for the Strata query-coordination system.
//!
//! This crate provides the foundational types used across all Strata
//! components:
//!
//! - **Identifiers**: Strongly-typed query ids
//! - **Backing Store**: The key/value storage contract shared state lives in
//! - **Distributed Locks**: Leased mutual exclusion over the backing store
//! - **Error Types**: Shared error definitions and result aliases
//!
//! Strata coordinates work across a fleet of stateless processes with no
//! shared memory; everything here exists to make read-modify-write cycles
//! on remotely stored entities safe.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod storage;

pub use error::{Error, Result};
pub use id::QueryId;
pub use lock::{DistributedLock, LockConfig, LockGuard, LockInfo};
pub use observability::{init_logging, LogFormat};
pub use storage::{KeyValueBackend, MemoryBackend, ObjectMeta, WritePrecondition, WriteResult};
