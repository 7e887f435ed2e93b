//! Single-owner table handles bound to a cached descriptor.

use std::sync::Arc;

use crate::{descriptor::TableDescriptor, opener::InstanceHandle};

/// Identifier of an instance, unique for the lifetime of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) u64);

/// A live table handle bound to one [`TableDescriptor`].
///
/// Owned by value by exactly one worker while in use, and by the instance
/// cache while parked on a free list. Never shared between threads. The
/// binding to its descriptor is fixed at creation.
#[derive(Debug)]
pub struct TableInstance {
    id: InstanceId,
    descriptor: Arc<TableDescriptor>,
    handle: Box<dyn InstanceHandle>,
    /// Key into the global free-instance LRU; `Some` only while free.
    pub(crate) lru_seq: Option<u64>,
}

impl TableInstance {
    pub(crate) fn new(
        id: InstanceId,
        descriptor: Arc<TableDescriptor>,
        handle: Box<dyn InstanceHandle>,
    ) -> Self {
        Self {
            id,
            descriptor,
            handle,
            lru_seq: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }

    pub fn handle(&self) -> &dyn InstanceHandle {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> &mut dyn InstanceHandle {
        self.handle.as_mut()
    }

    pub(crate) fn into_handle(self) -> Box<dyn InstanceHandle> {
        self.handle
    }
}
