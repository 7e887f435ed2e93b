//! Bookkeeping for live table instances: per-descriptor used/free lists plus
//! the global free-instance LRU.
//!
//! A single lock guards every descriptor's lists and the LRU so free-list and
//! LRU updates stay atomic together. External close calls happen with the lock
//! dropped, because closing can block on storage I/O; the flush barrier's
//! shared side is entered before the lock is released, so a `wait_idle` caller
//! always sees the close of any instance that is already gone from the lists.

use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    CacheError, WorkerId,
    barrier::{FlushBarrier, FlushGuard},
    descriptor::{DescriptorId, TableDescriptor},
    instance::{InstanceId, TableInstance},
    opener::{OpenError, TableOpener},
};

/// What releasing an instance did with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Parked on its descriptor's free list for reuse.
    Recycled,
    /// Closed immediately: stale descriptor, reopen needed, or caching is off.
    Destroyed,
}

/// Ownership contract checked before a DDL removal touches a table's lists.
#[derive(Debug, Clone, Copy)]
pub(crate) enum UsedCheck {
    Ignore,
    NoneInUse,
    OwnedBy(WorkerId),
}

#[derive(Debug)]
pub(crate) struct InstanceCache {
    capacity: AtomicUsize,
    opener: Arc<dyn TableOpener>,
    barrier: Arc<FlushBarrier>,
    next_id: AtomicU64,
    inner: Mutex<Lists>,
}

/// Everything guarded by the instance-list lock.
#[derive(Debug, Default)]
struct Lists {
    /// Payloads of free instances.
    free: HashMap<InstanceId, TableInstance>,
    /// Global recency order over all free instances, coldest first.
    lru: BTreeMap<u64, InstanceId>,
    next_seq: u64,
    /// Per-descriptor membership.
    tables: HashMap<DescriptorId, TableLists>,
    /// Total cached instances, used and free.
    count: usize,
}

#[derive(Debug, Default)]
struct TableLists {
    /// Free instances of this table, most recently released last.
    free: Vec<InstanceId>,
    /// Owner of every in-use instance.
    used: HashMap<InstanceId, WorkerId>,
}

impl TableLists {
    fn is_empty(&self) -> bool {
        self.free.is_empty() && self.used.is_empty()
    }
}

impl InstanceCache {
    pub(crate) fn new(
        capacity: usize,
        opener: Arc<dyn TableOpener>,
        barrier: Arc<FlushBarrier>,
    ) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            opener,
            barrier,
            next_id: AtomicU64::new(0),
            inner: Mutex::new(Lists::default()),
        }
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Total instances currently cached, used and free.
    pub(crate) fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Pop a free instance of `descriptor`, marking it used by `worker`.
    /// `None` when the free list is empty.
    pub(crate) fn acquire_free(
        &self,
        worker: WorkerId,
        descriptor: &Arc<TableDescriptor>,
    ) -> Option<TableInstance> {
        let mut lists = self.inner.lock();
        let id = {
            let table = lists.tables.get_mut(&descriptor.id())?;
            let id = table.free.pop()?;
            table.used.insert(id, worker);
            id
        };
        let mut instance = lists
            .free
            .remove(&id)
            .expect("free list entry without payload");
        let seq = instance
            .lru_seq
            .take()
            .expect("free instance missing from LRU");
        lists.lru.remove(&seq);
        Some(instance)
    }

    /// Open a fresh instance through the storage layer and admit it as used by
    /// `worker`.
    pub(crate) fn materialize(
        &self,
        worker: WorkerId,
        descriptor: &Arc<TableDescriptor>,
    ) -> Result<TableInstance, OpenError> {
        let handle = self.opener.open_instance(descriptor)?;
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let instance = TableInstance::new(id, Arc::clone(descriptor), handle);
        self.admit(worker, &instance);
        Ok(instance)
    }

    /// Register a freshly opened, in-use instance. When the count crosses the
    /// threshold this evicts the globally coldest free instance, which keeps
    /// the LRU order fair across tables.
    pub(crate) fn admit(&self, worker: WorkerId, instance: &TableInstance) {
        let mut lists = self.inner.lock();
        lists
            .tables
            .entry(instance.descriptor().id())
            .or_default()
            .used
            .insert(instance.id(), worker);
        lists.count += 1;
        let victims = self.evict_over_capacity(&mut lists);
        let closing = self.barrier.enter();
        drop(lists);
        self.close_all(closing, victims);
    }

    /// Return an in-use instance. Destroys it when its descriptor went stale,
    /// the handle wants a reopen, or caching is off; otherwise parks it on the
    /// free lists.
    pub(crate) fn release(&self, mut instance: TableInstance, stale: bool) -> ReleaseOutcome {
        let descriptor = instance.descriptor().id();
        let id = instance.id();
        let mut lists = self.inner.lock();
        if let Some(table) = lists.tables.get_mut(&descriptor) {
            table.used.remove(&id);
        }
        if stale || instance.handle().needs_reopen() || self.capacity.load(Ordering::Relaxed) == 0 {
            if lists
                .tables
                .get(&descriptor)
                .is_some_and(TableLists::is_empty)
            {
                lists.tables.remove(&descriptor);
            }
            lists.count -= 1;
            let closing = self.barrier.enter();
            drop(lists);
            self.close_all(closing, vec![instance]);
            return ReleaseOutcome::Destroyed;
        }
        let seq = lists.next_seq;
        lists.next_seq += 1;
        instance.lru_seq = Some(seq);
        lists.lru.insert(seq, id);
        lists.tables.entry(descriptor).or_default().free.push(id);
        lists.free.insert(id, instance);
        // Evict the least recently released instance, not the one just
        // released, to keep the LRU order.
        let victims = self.evict_over_capacity(&mut lists);
        let closing = self.barrier.enter();
        drop(lists);
        self.close_all(closing, victims);
        ReleaseOutcome::Recycled
    }

    /// Close every free instance of every table.
    pub(crate) fn evict_all(&self) {
        let (closing, victims) = {
            let mut lists = self.inner.lock();
            let ids: Vec<InstanceId> = lists.lru.values().copied().collect();
            lists.lru.clear();
            let victims = ids
                .into_iter()
                .map(|id| Self::unlink_free(&mut lists, id))
                .collect::<Vec<_>>();
            (self.barrier.enter(), victims)
        };
        if !victims.is_empty() {
            debug!(evicted = victims.len(), "evicting all free table instances");
        }
        self.close_all(closing, victims);
    }

    /// Verify the per-mode ownership contract for a DDL removal.
    pub(crate) fn check_contract(
        &self,
        descriptor: DescriptorId,
        check: UsedCheck,
    ) -> Result<(), CacheError> {
        let lists = self.inner.lock();
        let Some(table) = lists.tables.get(&descriptor) else {
            return Ok(());
        };
        match check {
            UsedCheck::Ignore => Ok(()),
            UsedCheck::NoneInUse => {
                if table.used.is_empty() {
                    Ok(())
                } else {
                    Err(CacheError::Contract(
                        "instances still in use during remove-all",
                    ))
                }
            }
            UsedCheck::OwnedBy(worker) => {
                if table.used.values().all(|owner| *owner == worker) {
                    Ok(())
                } else {
                    Err(CacheError::Contract(
                        "foreign instances still in use during remove-not-owned",
                    ))
                }
            }
        }
    }

    /// Drop and close every free instance of `descriptor`. Used instances stay
    /// with their owners. Returns the number of instances closed.
    pub(crate) fn drain_free(&self, descriptor: DescriptorId) -> usize {
        let (closing, victims) = {
            let mut lists = self.inner.lock();
            let ids = match lists.tables.get_mut(&descriptor) {
                Some(table) => mem::take(&mut table.free),
                None => return 0,
            };
            if lists
                .tables
                .get(&descriptor)
                .is_some_and(TableLists::is_empty)
            {
                lists.tables.remove(&descriptor);
            }
            let mut victims = Vec::with_capacity(ids.len());
            for id in ids {
                let mut instance = lists
                    .free
                    .remove(&id)
                    .expect("free list entry without payload");
                if let Some(seq) = instance.lru_seq.take() {
                    lists.lru.remove(&seq);
                }
                lists.count -= 1;
                victims.push(instance);
            }
            (self.barrier.enter(), victims)
        };
        let drained = victims.len();
        self.close_all(closing, victims);
        drained
    }

    fn evict_over_capacity(&self, lists: &mut Lists) -> Vec<TableInstance> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut victims = Vec::new();
        while lists.count > capacity {
            let Some((_, id)) = lists.lru.pop_first() else {
                break;
            };
            victims.push(Self::unlink_free(lists, id));
        }
        victims
    }

    /// Detach a free instance whose LRU entry has already been removed.
    fn unlink_free(lists: &mut Lists, id: InstanceId) -> TableInstance {
        let mut instance = lists.free.remove(&id).expect("LRU entry without payload");
        instance.lru_seq = None;
        let descriptor = instance.descriptor().id();
        if let Some(table) = lists.tables.get_mut(&descriptor) {
            table.free.retain(|other| *other != id);
            if table.is_empty() {
                lists.tables.remove(&descriptor);
            }
        }
        lists.count -= 1;
        instance
    }

    /// Close `victims` through the storage layer, with every lock dropped.
    ///
    /// The guard must have been taken while the list lock was still held:
    /// once an instance has left the lists, `wait_idle` callers must be able
    /// to see its close as in flight.
    fn close_all(&self, _closing: FlushGuard<'_>, victims: Vec<TableInstance>) {
        for victim in victims {
            self.opener.close_instance(victim.into_handle());
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let lists = self.inner.lock();
        let mut free_total = 0;
        for (descriptor, table) in &lists.tables {
            assert!(!table.is_empty(), "empty table entry not cleaned up");
            for id in &table.free {
                let payload = lists.free.get(id).expect("free id without payload");
                assert_eq!(payload.descriptor().id(), *descriptor);
                let seq = payload.lru_seq.expect("free instance not in LRU");
                assert_eq!(lists.lru.get(&seq), Some(id));
            }
            free_total += table.free.len();
        }
        assert_eq!(free_total, lists.lru.len());
        assert_eq!(free_total, lists.free.len());
        let used_total: usize = lists.tables.values().map(|table| table.used.len()).sum();
        assert_eq!(lists.count, free_total + used_total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        TableKey,
        descriptor::TableDescriptor,
        test_util::{MockOpener, test_definition},
    };

    fn descriptor(id: u64, name: &str) -> Arc<TableDescriptor> {
        Arc::new(TableDescriptor::open(
            DescriptorId(id),
            TableKey::new("test", name),
            test_definition(),
            1,
        ))
    }

    fn cache(capacity: usize, opener: &Arc<MockOpener>) -> InstanceCache {
        InstanceCache::new(
            capacity,
            Arc::clone(opener) as Arc<dyn TableOpener>,
            Arc::new(FlushBarrier::default()),
        )
    }

    const WORKER: WorkerId = WorkerId::new(7);

    #[test]
    fn acquire_from_empty_free_list() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(4, &opener);
        let orders = descriptor(1, "orders");
        assert!(cache.acquire_free(WORKER, &orders).is_none());
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn recycled_instance_is_reacquired() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(4, &opener);
        let orders = descriptor(1, "orders");

        let instance = cache.materialize(WORKER, &orders).unwrap();
        let id = instance.id();
        assert_eq!(cache.count(), 1);
        cache.assert_consistent();

        assert_eq!(cache.release(instance, false), ReleaseOutcome::Recycled);
        assert_eq!(cache.count(), 1);
        cache.assert_consistent();

        let again = cache.acquire_free(WORKER, &orders).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(opener.instance_opens(), 1);
        assert_eq!(opener.instance_closes(), 0);
        cache.release(again, false);
        cache.assert_consistent();
    }

    #[test]
    fn eviction_takes_globally_coldest_instance() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(2, &opener);
        let orders = descriptor(1, "orders");
        let lines = descriptor(2, "lines");

        let a = cache.materialize(WORKER, &orders).unwrap();
        cache.release(a, false);
        let b = cache.materialize(WORKER, &lines).unwrap();
        cache.release(b, false);

        // Third admission exceeds the threshold; the coldest free instance
        // belongs to "orders", not to the table being admitted.
        let c = cache.materialize(WORKER, &lines).unwrap();
        assert_eq!(cache.count(), 2);
        assert_eq!(opener.instance_closes(), 1);
        assert!(cache.acquire_free(WORKER, &orders).is_none());
        cache.release(c, false);
        cache.assert_consistent();
    }

    #[test]
    fn stale_release_destroys() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(4, &opener);
        let orders = descriptor(1, "orders");
        let instance = cache.materialize(WORKER, &orders).unwrap();
        assert_eq!(cache.release(instance, true), ReleaseOutcome::Destroyed);
        assert_eq!(cache.count(), 0);
        assert_eq!(opener.instance_closes(), 1);
        cache.assert_consistent();
    }

    #[test]
    fn poisoned_handle_is_not_recycled() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(4, &opener);
        let orders = descriptor(1, "orders");
        let instance = cache.materialize(WORKER, &orders).unwrap();
        opener.poison_instances(orders.key());
        assert_eq!(cache.release(instance, false), ReleaseOutcome::Destroyed);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(0, &opener);
        let orders = descriptor(1, "orders");
        let instance = cache.materialize(WORKER, &orders).unwrap();
        // The in-use instance itself is never evicted.
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.release(instance, false), ReleaseOutcome::Destroyed);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn evict_all_spares_used_instances() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(4, &opener);
        let orders = descriptor(1, "orders");

        let held = cache.materialize(WORKER, &orders).unwrap();
        let freed = cache.materialize(WORKER, &orders).unwrap();
        cache.release(freed, false);

        cache.evict_all();
        assert_eq!(cache.count(), 1);
        assert_eq!(opener.instance_closes(), 1);
        cache.assert_consistent();
        cache.release(held, false);
    }

    #[test]
    fn drain_free_leaves_used_untouched() {
        let opener = Arc::new(MockOpener::default());
        let cache = cache(4, &opener);
        let orders = descriptor(1, "orders");

        let held = cache.materialize(WORKER, &orders).unwrap();
        let freed = cache.materialize(WORKER, &orders).unwrap();
        cache.release(freed, false);

        assert_eq!(cache.drain_free(orders.id()), 1);
        assert_eq!(cache.count(), 1);
        cache.assert_consistent();

        let other = WorkerId::new(8);
        assert!(cache.check_contract(orders.id(), UsedCheck::Ignore).is_ok());
        assert!(
            cache
                .check_contract(orders.id(), UsedCheck::OwnedBy(WORKER))
                .is_ok()
        );
        assert!(
            cache
                .check_contract(orders.id(), UsedCheck::OwnedBy(other))
                .is_err()
        );
        assert!(
            cache
                .check_contract(orders.id(), UsedCheck::NoneInUse)
                .is_err()
        );
        cache.release(held, false);
    }
}
