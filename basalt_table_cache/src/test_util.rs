//! Mock storage layer for tests of both cache tiers.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::{Condvar, Mutex};

use crate::{
    TableKey,
    descriptor::TableDescriptor,
    opener::{ColumnDef, ColumnType, InstanceHandle, OpenError, TableDefinition, TableOpener},
};

/// A small two-column definition for tests that only care about identity.
pub fn test_definition() -> TableDefinition {
    TableDefinition::new(
        "basalt",
        vec![
            ColumnDef::new("id", ColumnType::Int64, false),
            ColumnDef::new("name", ColumnType::Utf8, true),
        ],
    )
}

/// A closed gate that opener calls block on, so tests can observe and order
/// the cache's external calls. Created held; arriving threads stack up until
/// [`open`](Self::open).
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    release: Condvar,
}

#[derive(Debug)]
struct GateState {
    held: bool,
    arrivals: usize,
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            held: true,
            arrivals: 0,
        }
    }
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let every blocked and future caller through.
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.held = false;
        self.release.notify_all();
    }

    /// How many callers have reached the gate so far, blocked or not.
    pub fn arrivals(&self) -> usize {
        self.state.lock().arrivals
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.arrivals += 1;
        while state.held {
            self.release.wait(&mut state);
        }
    }
}

/// Scripted [`TableOpener`]: definitions registered up front, counters for
/// every callback, optional failure injection and gates on the blocking paths.
#[derive(Debug, Default)]
pub struct MockOpener {
    definitions: Mutex<HashMap<TableKey, Result<TableDefinition, OpenError>>>,
    instance_failures: Mutex<HashMap<TableKey, String>>,
    /// Tables whose live handles must be reopened rather than recycled.
    poisoned: Arc<Mutex<HashSet<TableKey>>>,
    definition_opens: AtomicUsize,
    instance_opens: AtomicUsize,
    instance_closes: AtomicUsize,
    definition_gate: Mutex<Option<Arc<Gate>>>,
    close_gate: Mutex<Option<Arc<Gate>>>,
}

impl MockOpener {
    /// Register `key` as an existing table with the given definition.
    pub fn mock_table(&self, key: &TableKey, definition: TableDefinition) {
        self.definitions
            .lock()
            .insert(key.clone(), Ok(definition));
    }

    /// Make definition opens for `key` fail with a storage error.
    pub fn mock_open_failure(&self, key: &TableKey, message: impl Into<String>) {
        self.definitions
            .lock()
            .insert(key.clone(), Err(OpenError::Storage(message.into())));
    }

    /// Make instance opens for `key` fail with a storage error.
    pub fn mock_instance_failure(&self, key: &TableKey, message: impl Into<String>) {
        self.instance_failures
            .lock()
            .insert(key.clone(), message.into());
    }

    /// Mark every live handle of `key`, current and future, as needing reopen.
    pub fn poison_instances(&self, key: &TableKey) {
        self.poisoned.lock().insert(key.clone());
    }

    /// Gate all definition opens behind the returned [`Gate`].
    pub fn hold_definition_opens(&self) -> Arc<Gate> {
        let gate = Gate::new();
        *self.definition_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Gate all instance closes behind the returned [`Gate`].
    pub fn hold_closes(&self) -> Arc<Gate> {
        let gate = Gate::new();
        *self.close_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn definition_opens(&self) -> usize {
        self.definition_opens.load(Ordering::SeqCst)
    }

    pub fn instance_opens(&self) -> usize {
        self.instance_opens.load(Ordering::SeqCst)
    }

    pub fn instance_closes(&self) -> usize {
        self.instance_closes.load(Ordering::SeqCst)
    }
}

impl TableOpener for MockOpener {
    fn open_definition(&self, key: &TableKey) -> Result<TableDefinition, OpenError> {
        let gate = self.definition_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        self.definition_opens.fetch_add(1, Ordering::SeqCst);
        self.definitions
            .lock()
            .get(key)
            .cloned()
            .unwrap_or(Err(OpenError::NotFound))
    }

    fn open_instance(
        &self,
        descriptor: &TableDescriptor,
    ) -> Result<Box<dyn InstanceHandle>, OpenError> {
        if let Some(message) = self.instance_failures.lock().get(descriptor.key()) {
            return Err(OpenError::Storage(message.clone()));
        }
        self.instance_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockInstance {
            key: descriptor.key().clone(),
            poisoned: Arc::clone(&self.poisoned),
        }))
    }

    fn close_instance(&self, handle: Box<dyn InstanceHandle>) {
        let gate = self.close_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        self.instance_closes.fetch_add(1, Ordering::SeqCst);
        drop(handle);
    }
}

/// Handle produced by [`MockOpener`].
#[derive(Debug)]
pub struct MockInstance {
    key: TableKey,
    poisoned: Arc<Mutex<HashSet<TableKey>>>,
}

impl InstanceHandle for MockInstance {
    fn needs_reopen(&self) -> bool {
        self.poisoned.lock().contains(&self.key)
    }
}
