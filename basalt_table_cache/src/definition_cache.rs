//! The definition cache: shared, versioned table descriptors keyed by name.
//!
//! Lock order, outermost first: the share map, then a descriptor's metadata
//! lock, then the unused-descriptor LRU, then the instance lists. The flush
//! barrier is only ever waited on with none of these held.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::{
    CacheConfig, CacheError, TableKey, WorkerId,
    barrier::FlushBarrier,
    descriptor::{DescriptorId, TableDescriptor, VERSION_STALE},
    instance::TableInstance,
    instance_cache::{InstanceCache, ReleaseOutcome, UsedCheck},
    opener::TableOpener,
    wait::{DeadlockPriority, LocalWaitQueue, WaitOutcome, WaitQueue, WaitTicket},
};

/// What [`DefinitionCache::acquire`] hands out: a pinned descriptor and, when
/// requested, an exclusively owned instance. Must be returned through
/// [`DefinitionCache::release`].
#[derive(Debug)]
pub struct AcquiredTable {
    pub descriptor: Arc<TableDescriptor>,
    pub instance: Option<TableInstance>,
}

/// How a DDL removal treats instances held by other workers, and whether the
/// descriptor itself survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// No worker may hold an instance; the descriptor is expired.
    All,
    /// Only the calling worker may hold instances; the descriptor is expired.
    NotOwned,
    /// Like [`NotOwned`](Self::NotOwned) but the descriptor stays valid; only
    /// free instances are closed.
    NotOwnedKeepDescriptor,
    /// Close free instances regardless of holders; the descriptor is expired.
    Unused,
}

#[derive(Debug, Default)]
struct UnusedLru {
    /// Unreferenced descriptors, oldest first.
    by_age: std::collections::BTreeMap<u64, Arc<TableDescriptor>>,
    next_token: u64,
}

/// The cache itself. One per engine; cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct DefinitionCache {
    shares: RwLock<HashMap<TableKey, Arc<TableDescriptor>>>,
    unused: Mutex<UnusedLru>,
    instances: InstanceCache,
    opener: Arc<dyn TableOpener>,
    wait_queue: Arc<dyn WaitQueue>,
    barrier: Arc<FlushBarrier>,
    /// Bumped by [`invalidate_all`](Self::invalidate_all); descriptors opened
    /// under an older value are stale.
    global_version: AtomicU64,
    definition_capacity: AtomicUsize,
    next_descriptor_id: AtomicU64,
}

impl DefinitionCache {
    pub fn new(config: CacheConfig, opener: Arc<dyn TableOpener>) -> Self {
        Self::with_wait_queue(config, opener, Arc::new(LocalWaitQueue))
    }

    /// Like [`new`](Self::new) but with a caller-supplied wait queue, so the
    /// embedding engine can route stale-descriptor waits through its own
    /// deadlock detector.
    pub fn with_wait_queue(
        config: CacheConfig,
        opener: Arc<dyn TableOpener>,
        wait_queue: Arc<dyn WaitQueue>,
    ) -> Self {
        let barrier = Arc::new(FlushBarrier::default());
        Self {
            shares: RwLock::new(HashMap::new()),
            unused: Mutex::new(UnusedLru::default()),
            instances: InstanceCache::new(
                config.instance_capacity,
                Arc::clone(&opener),
                Arc::clone(&barrier),
            ),
            opener,
            wait_queue,
            barrier,
            global_version: AtomicU64::new(1),
            definition_capacity: AtomicUsize::new(config.definition_capacity),
            next_descriptor_id: AtomicU64::new(0),
        }
    }

    /// Pin the descriptor for `key`, opening its definition on a miss, and
    /// optionally hand out an instance (recycled when one is free, opened
    /// otherwise).
    ///
    /// Every successful call takes one reference on the descriptor, with or
    /// without an instance, and must be paired with [`release`](Self::release).
    pub fn acquire(
        &self,
        worker: WorkerId,
        key: &TableKey,
        want_instance: bool,
    ) -> Result<AcquiredTable, CacheError> {
        let descriptor = self.acquire_descriptor(key)?;
        if !want_instance {
            return Ok(AcquiredTable {
                descriptor,
                instance: None,
            });
        }
        let instance = match self.instances.acquire_free(worker, &descriptor) {
            Some(instance) => instance,
            None => match self.instances.materialize(worker, &descriptor) {
                Ok(instance) => instance,
                Err(error) => {
                    let error = CacheError::from_open(key, error);
                    self.release_share(&descriptor);
                    return Err(error);
                }
            },
        };
        Ok(AcquiredTable {
            descriptor,
            instance: Some(instance),
        })
    }

    /// Return an acquisition. A returned instance is parked for reuse unless
    /// its descriptor went stale; the last release of a stale descriptor
    /// destroys it.
    pub fn release(&self, acquired: AcquiredTable) -> Option<ReleaseOutcome> {
        let AcquiredTable {
            descriptor,
            instance,
        } = acquired;
        let outcome = instance.map(|instance| {
            let stale = descriptor.is_stale(self.current_version());
            self.instances.release(instance, stale)
        });
        self.release_share(&descriptor);
        outcome
    }

    /// Whether `key` names an existing table, without keeping anything pinned.
    pub fn probe(&self, key: &TableKey) -> Result<bool, CacheError> {
        match self.acquire_descriptor(key) {
            Ok(descriptor) => {
                self.release_share(&descriptor);
                Ok(true)
            }
            Err(CacheError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Take `key` out of the cache for DDL. The caller must not hold the table
    /// itself; its in-use instances are checked against `mode`'s ownership
    /// contract. Returns whether a descriptor existed.
    ///
    /// On success all in-flight instance closes have drained, so the storage
    /// engine is free to drop or rename the underlying table.
    pub fn remove(
        &self,
        worker: WorkerId,
        key: &TableKey,
        mode: RemoveMode,
    ) -> Result<bool, CacheError> {
        let descriptor = {
            let shares = self.shares.read();
            let Some(descriptor) = shares.get(key) else {
                return Ok(false);
            };
            let descriptor = Arc::clone(descriptor);
            // Pin while still under the share map so the descriptor cannot be
            // destroyed underneath us. A transient failed-open descriptor
            // must not be pinned at all: its creator is about to tear it
            // down, and a removal reference would park the error on the
            // unused LRU instead.
            if self.pin(&descriptor).is_err() {
                return Ok(false);
            }
            descriptor
        };

        let check = match mode {
            RemoveMode::All => UsedCheck::NoneInUse,
            RemoveMode::NotOwned | RemoveMode::NotOwnedKeepDescriptor => {
                UsedCheck::OwnedBy(worker)
            }
            RemoveMode::Unused => UsedCheck::Ignore,
        };
        if let Err(error) = self.instances.check_contract(descriptor.id(), check) {
            self.release_share(&descriptor);
            return Err(error);
        }

        if mode != RemoveMode::NotOwnedKeepDescriptor {
            // Forces fresh acquisitions to reopen and the last release to
            // destroy the descriptor.
            descriptor.meta().version = VERSION_STALE;
        }
        let drained = self.instances.drain_free(descriptor.id());
        debug!(key = %key, ?mode, drained, "removed table from definition cache");
        self.release_share(&descriptor);
        self.barrier.wait_idle();
        Ok(true)
    }

    /// Expire every cached descriptor by bumping the global version. Existing
    /// holders keep working; each descriptor is destroyed by its last release.
    /// Returns the new version.
    pub fn invalidate_all(&self) -> u64 {
        let version = self.global_version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(version, "invalidated all cached table definitions");
        version
    }

    /// Block until no stale descriptor for `key` remains cached.
    ///
    /// Waits go through the configured [`WaitQueue`] with the caller's
    /// `priority`, so the embedding engine's deadlock detector can abort them.
    pub fn wait_for_fresh(
        &self,
        key: &TableKey,
        timeout: Duration,
        priority: DeadlockPriority,
    ) -> Result<(), CacheError> {
        loop {
            let (descriptor, ticket) = {
                let shares = self.shares.read();
                let Some(descriptor) = shares.get(key) else {
                    return Ok(());
                };
                let mut meta = descriptor.meta();
                if meta.error.is_some() || meta.version == self.current_version() {
                    return Ok(());
                }
                let ticket = WaitTicket::new();
                meta.flush_waiters.push(Arc::clone(&ticket));
                drop(meta);
                (Arc::clone(descriptor), ticket)
            };
            match self.wait_queue.wait(&ticket, timeout, priority) {
                // The stale descriptor was destroyed; re-check, a concurrent
                // acquirer may already have opened another stale one.
                WaitOutcome::Granted => continue,
                outcome => {
                    let mut meta = descriptor.meta();
                    meta.flush_waiters
                        .retain(|other| !Arc::ptr_eq(other, &ticket));
                    drop(meta);
                    return Err(match outcome {
                        WaitOutcome::Timeout => CacheError::WaitTimeout(key.clone()),
                        WaitOutcome::Deadlock => CacheError::WaitDeadlock(key.clone()),
                        _ => CacheError::WaitKilled(key.clone()),
                    });
                }
            }
        }
    }

    /// Read access to every cached descriptor. Holds the share map read-locked
    /// for the snapshot's lifetime; keep it short.
    pub fn snapshot(&self) -> DescriptorSnapshot<'_> {
        DescriptorSnapshot {
            guard: self.shares.read(),
        }
    }

    /// The version new descriptors are opened under.
    pub fn current_version(&self) -> u64 {
        self.global_version.load(Ordering::SeqCst)
    }

    /// Number of cached descriptors.
    pub fn descriptor_count(&self) -> usize {
        self.shares.read().len()
    }

    /// Number of cached instances, used and free together.
    pub fn instance_count(&self) -> usize {
        self.instances.count()
    }

    /// Close every free instance of every table.
    pub fn evict_all_instances(&self) {
        self.instances.evict_all();
    }

    pub fn set_definition_capacity(&self, capacity: usize) {
        self.definition_capacity.store(capacity, Ordering::Relaxed);
        self.purge(false);
    }

    pub fn set_instance_capacity(&self, capacity: usize) {
        self.instances.set_capacity(capacity);
    }

    /// Begin shutdown: stop caching, evict everything evictable and wait for
    /// in-flight closes. Descriptors still held by workers are destroyed by
    /// their last release.
    pub fn start_shutdown(&self) {
        info!("shutting down table caches");
        self.definition_capacity.store(0, Ordering::Relaxed);
        self.instances.set_capacity(0);
        self.instances.evict_all();
        self.purge(true);
        self.barrier.wait_idle();
    }

    /// Look up or open the descriptor for `key` and take one reference on it.
    fn acquire_descriptor(&self, key: &TableKey) -> Result<Arc<TableDescriptor>, CacheError> {
        {
            let shares = self.shares.read();
            if let Some(descriptor) = shares.get(key) {
                let descriptor = Arc::clone(descriptor);
                self.pin(&descriptor)?;
                return Ok(descriptor);
            }
        }

        // Miss: read the durable definition with no cache locks held, then
        // settle the insert race under the write lock.
        let opened = self.opener.open_definition(key);
        let version = self.current_version();
        let id = DescriptorId(self.next_descriptor_id.fetch_add(1, Ordering::Relaxed) + 1);

        let mut shares = self.shares.write();
        if let Some(winner) = shares.get(key) {
            // Another thread opened concurrently; ours is discarded.
            let winner = Arc::clone(winner);
            self.pin(&winner)?;
            return Ok(winner);
        }
        match opened {
            Ok(definition) => {
                let descriptor =
                    Arc::new(TableDescriptor::open(id, key.clone(), definition, version));
                shares.insert(key.clone(), Arc::clone(&descriptor));
                let over = shares.len() > self.definition_capacity.load(Ordering::Relaxed);
                drop(shares);
                debug!(key = %key, descriptor = ?id, version, "opened table definition");
                if over {
                    self.purge(false);
                }
                Ok(descriptor)
            }
            Err(error) => {
                // Inserted transiently so concurrent acquirers observe the
                // failure instead of dog-piling the opener, then destroyed
                // right away. Failures are never cached.
                let descriptor = Arc::new(TableDescriptor::open_failed(
                    id,
                    key.clone(),
                    error.clone(),
                    version,
                ));
                shares.insert(key.clone(), Arc::clone(&descriptor));
                drop(shares);
                self.delete_from_hash(&descriptor);
                Err(CacheError::from_open(key, error))
            }
        }
    }

    /// Take a reference on a cached descriptor, delisting it from the unused
    /// LRU. The caller must hold the share map at least read-locked.
    fn pin(&self, descriptor: &Arc<TableDescriptor>) -> Result<(), CacheError> {
        let mut meta = descriptor.meta();
        if let Some(error) = meta.error.clone() {
            return Err(CacheError::from_open(descriptor.key(), error));
        }
        meta.ref_count += 1;
        if let Some(token) = meta.unused_token.take() {
            self.unused.lock().by_age.remove(&token);
        }
        Ok(())
    }

    /// Drop one reference. The last release parks a fresh descriptor on the
    /// unused LRU and destroys a stale one.
    fn release_share(&self, descriptor: &Arc<TableDescriptor>) {
        let mut meta = descriptor.meta();
        if meta.ref_count > 1 {
            meta.ref_count -= 1;
            return;
        }
        if meta.version != self.current_version() {
            drop(meta);
            self.delete_from_hash(descriptor);
            return;
        }
        meta.ref_count = 0;
        let mut unused = self.unused.lock();
        let token = unused.next_token;
        unused.next_token += 1;
        unused.by_age.insert(token, Arc::clone(descriptor));
        meta.unused_token = Some(token);
        drop(unused);
        drop(meta);
        self.purge(false);
    }

    /// Drop one reference and, if it was the last, destroy the descriptor:
    /// unmap it, close its free instances and wake its flush waiters. Returns
    /// whether destruction happened.
    fn delete_from_hash(&self, descriptor: &Arc<TableDescriptor>) -> bool {
        let mut shares = self.shares.write();
        let mut meta = descriptor.meta();
        meta.ref_count -= 1;
        if meta.ref_count > 0 {
            return false;
        }
        let evicted = shares.remove(descriptor.key());
        debug_assert!(evicted.is_some_and(|entry| Arc::ptr_eq(&entry, descriptor)));
        drop(shares);
        meta.removed = true;
        let waiters = std::mem::take(&mut meta.flush_waiters);
        drop(meta);
        for ticket in waiters {
            self.wait_queue.wake(&ticket);
        }
        let drained = self.instances.drain_free(descriptor.id());
        debug!(key = %descriptor.key(), drained, "destroyed table descriptor");
        true
    }

    /// Evict unused descriptors, oldest first: down to capacity, or all of
    /// them when `force` is set.
    fn purge(&self, force: bool) {
        loop {
            if !force {
                let capacity = self.definition_capacity.load(Ordering::Relaxed);
                if self.shares.read().len() <= capacity {
                    break;
                }
            }
            let Some((_, victim)) = self.unused.lock().by_age.pop_first() else {
                break;
            };
            {
                // Pin so a concurrent acquirer that raced us re-adds cleanly.
                let mut meta = victim.meta();
                meta.ref_count += 1;
                meta.unused_token = None;
            }
            self.delete_from_hash(&victim);
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let unused: Vec<(u64, Arc<TableDescriptor>)> = self
            .unused
            .lock()
            .by_age
            .iter()
            .map(|(token, descriptor)| (*token, Arc::clone(descriptor)))
            .collect();
        let shares = self.shares.read();
        for (token, descriptor) in &unused {
            let meta = descriptor.meta();
            assert_eq!(meta.unused_token, Some(*token));
            assert_eq!(meta.ref_count, 0);
            assert!(
                shares
                    .get(descriptor.key())
                    .is_some_and(|entry| Arc::ptr_eq(entry, descriptor))
            );
        }
        for descriptor in shares.values() {
            let meta = descriptor.meta();
            assert!(!meta.removed);
            match meta.unused_token {
                Some(token) => {
                    assert_eq!(meta.ref_count, 0);
                    assert!(
                        unused
                            .iter()
                            .any(|(t, d)| *t == token && Arc::ptr_eq(d, descriptor))
                    );
                }
                None => assert!(meta.ref_count > 0),
            }
        }
        drop(shares);
        self.instances.assert_consistent();
    }
}

/// Read-locked view over every cached descriptor.
#[derive(Debug)]
pub struct DescriptorSnapshot<'a> {
    guard: RwLockReadGuard<'a, HashMap<TableKey, Arc<TableDescriptor>>>,
}

impl DescriptorSnapshot<'_> {
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    pub fn get(&self, key: &TableKey) -> Option<&Arc<TableDescriptor>> {
        self.guard.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TableDescriptor>> + '_ {
        self.guard.values()
    }
}
