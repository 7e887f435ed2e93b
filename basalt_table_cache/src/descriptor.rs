//! Cached, shareable, versioned table metadata.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{
    TableKey,
    opener::{OpenError, TableDefinition},
    wait::WaitTicket,
};

/// Version sentinel marking a descriptor stale regardless of the global version.
/// The global version counter starts at 1 and never reaches it.
pub(crate) const VERSION_STALE: u64 = 0;

/// Identifier of a descriptor, unique for the lifetime of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub(crate) u64);

/// Lifecycle summary of a descriptor, derived from its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// Held by `holders` acquirers; in-use instances count as holders.
    Active { holders: usize, stale: bool },
    /// Unreferenced, parked on the unused LRU awaiting reuse or eviction.
    Unused { stale: bool },
    /// Taken out of the cache; dropped once the last `Arc` goes away.
    Removed,
}

/// Cached metadata for one table: the immutable [`TableDefinition`] plus the
/// cache bookkeeping behind the descriptor's own metadata lock.
///
/// Descriptors are shared read-only between workers via `Arc`. All mutable
/// state (reference count, version, unused-LRU membership, wait tickets) lives
/// in `DescriptorMeta` and is only touched under its lock.
#[derive(Debug)]
pub struct TableDescriptor {
    id: DescriptorId,
    key: TableKey,
    definition: Option<TableDefinition>,
    meta: Mutex<DescriptorMeta>,
}

#[derive(Debug)]
pub(crate) struct DescriptorMeta {
    /// Active holders: in-use instances plus instance-less acquirers.
    pub(crate) ref_count: usize,
    /// Global version captured at creation; [`VERSION_STALE`] forces reopen.
    pub(crate) version: u64,
    /// Position in the unused-descriptor LRU; `Some` iff `ref_count == 0` and
    /// the descriptor is still cached.
    pub(crate) unused_token: Option<u64>,
    /// Set once the descriptor has been taken out of the hash map.
    pub(crate) removed: bool,
    /// Failure recorded by the opener. Such descriptors never stay cached.
    pub(crate) error: Option<OpenError>,
    /// Tickets of threads blocked in `wait_for_fresh`, fired on destruction.
    pub(crate) flush_waiters: Vec<Arc<WaitTicket>>,
}

impl DescriptorMeta {
    fn new(version: u64, error: Option<OpenError>) -> Self {
        Self {
            ref_count: 1,
            version,
            unused_token: None,
            removed: false,
            error,
            flush_waiters: Vec::new(),
        }
    }
}

impl TableDescriptor {
    /// A successfully opened descriptor. The creator holds the first reference.
    pub(crate) fn open(
        id: DescriptorId,
        key: TableKey,
        definition: TableDefinition,
        version: u64,
    ) -> Self {
        Self {
            id,
            key,
            definition: Some(definition),
            meta: Mutex::new(DescriptorMeta::new(version, None)),
        }
    }

    /// A descriptor whose open failed. Inserted transiently so concurrent
    /// acquirers observe the error, then removed at once.
    pub(crate) fn open_failed(
        id: DescriptorId,
        key: TableKey,
        error: OpenError,
        version: u64,
    ) -> Self {
        Self {
            id,
            key,
            definition: None,
            meta: Mutex::new(DescriptorMeta::new(version, Some(error))),
        }
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    /// The parsed schema.
    ///
    /// # Panics
    ///
    /// Panics for failed-open descriptors, which are removed from the cache
    /// before any caller can hold one.
    pub fn definition(&self) -> &TableDefinition {
        self.definition
            .as_ref()
            .expect("failed descriptors never leave the cache")
    }

    /// The global version captured when this descriptor was opened.
    pub fn version(&self) -> u64 {
        self.meta.lock().version
    }

    /// Number of active holders.
    pub fn ref_count(&self) -> usize {
        self.meta.lock().ref_count
    }

    /// Whether the captured version no longer matches `current_version`.
    pub fn is_stale(&self, current_version: u64) -> bool {
        self.meta.lock().version != current_version
    }

    /// Lifecycle summary given the current global version.
    pub fn state(&self, current_version: u64) -> DescriptorState {
        let meta = self.meta.lock();
        if meta.removed {
            return DescriptorState::Removed;
        }
        let stale = meta.version != current_version;
        if meta.ref_count > 0 {
            DescriptorState::Active {
                holders: meta.ref_count,
                stale,
            }
        } else {
            DescriptorState::Unused { stale }
        }
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, DescriptorMeta> {
        self.meta.lock()
    }
}
