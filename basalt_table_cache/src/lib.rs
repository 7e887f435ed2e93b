//! Two-tier cache for table metadata and live table handles.
//!
//! The **definition cache** maps table keys to shared, versioned
//! [`TableDescriptor`]s holding the parsed [`TableDefinition`]. The **instance
//! cache** keeps closed-but-reusable [`TableInstance`] handles so workers can
//! skip the storage engine's open path on hot tables.
//!
//! [`TableDefinition`]: crate::opener::TableDefinition
//!
//! Cache actions:
//!
//! - [`DefinitionCache::acquire`] hands a worker a pinned descriptor, and on
//!   request a live instance, recycling a free one when available.
//! - [`DefinitionCache::release`] returns them; free instances are parked for
//!   reuse unless their descriptor went stale.
//! - [`DefinitionCache::remove`] takes a table out of the cache for DDL,
//!   enforcing the per-mode ownership contract.
//! - [`DefinitionCache::invalidate_all`] bumps the global version so every
//!   cached descriptor expires lazily.
//! - [`DefinitionCache::wait_for_fresh`] blocks until no stale descriptor for a
//!   key remains cached.
//!
//! Invariants:
//!
//! - A descriptor's reference count equals its in-use instances plus its
//!   instance-less holders; free instances do not pin a descriptor.
//! - A descriptor is on the unused LRU iff its reference count is zero and it
//!   is still cached.
//! - The last release of a stale descriptor destroys it, closing its free
//!   instances, and wakes all [`wait_for_fresh`](DefinitionCache::wait_for_fresh)
//!   waiters for its key.
//! - Storage close calls never run under a cache lock.

use std::{fmt, sync::Arc};

mod barrier;
pub mod definition_cache;
pub mod descriptor;
pub mod instance;
mod instance_cache;
pub mod opener;
pub mod test_util;
pub mod wait;

pub use definition_cache::{AcquiredTable, DefinitionCache, DescriptorSnapshot, RemoveMode};
pub use descriptor::{DescriptorId, DescriptorState, TableDescriptor};
pub use instance::{InstanceId, TableInstance};
pub use instance_cache::ReleaseOutcome;

use crate::opener::OpenError;

/// Fully qualified name of a table, the key of the definition cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    database: Arc<str>,
    table: Arc<str>,
}

impl TableKey {
    pub fn new(database: impl Into<Arc<str>>, table: impl Into<Arc<str>>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Identity of the worker session performing a cache operation. Used to decide
/// instance ownership during DDL removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Sizing knobs for both cache tiers.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Soft cap on cached definitions; exceeding it evicts unused descriptors.
    pub definition_capacity: usize,
    /// Soft cap on cached instances, used and free together. Zero disables
    /// instance recycling entirely.
    pub instance_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            definition_capacity: 400,
            instance_capacity: 2000,
        }
    }
}

/// Errors surfaced by cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("table `{0}` does not exist")]
    NotFound(TableKey),

    #[error("failed to open table `{key}`: {message}")]
    Open { key: TableKey, message: String },

    #[error("timed out waiting for stale descriptors of `{0}` to drain")]
    WaitTimeout(TableKey),

    #[error("deadlock detected while waiting for stale descriptors of `{0}`")]
    WaitDeadlock(TableKey),

    #[error("killed while waiting for stale descriptors of `{0}`")]
    WaitKilled(TableKey),

    /// A removal's ownership precondition did not hold.
    #[error("cache contract violated: {0}")]
    Contract(&'static str),
}

impl CacheError {
    pub(crate) fn from_open(key: &TableKey, error: OpenError) -> Self {
        match error {
            OpenError::NotFound => Self::NotFound(key.clone()),
            OpenError::Storage(message) => Self::Open {
                key: key.clone(),
                message,
            },
        }
    }
}
