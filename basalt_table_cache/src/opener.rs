//! Interface to the storage/metadata layer that materializes cached objects.
//!
//! The cache never touches durable storage itself. Definitions and live table
//! handles are produced and torn down by a [`TableOpener`] supplied by the
//! embedding engine; definition payloads are destroyed by `Drop`.

use std::{fmt::Debug, sync::Arc};

use crate::{TableKey, descriptor::TableDescriptor};

/// Data type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Int64,
    UInt64,
    Float64,
    Utf8,
    Binary,
    Timestamp,
}

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    name: Arc<str>,
    column_type: ColumnType,
    nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<Arc<str>>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

/// Parsed definition of one table: columns, options and storage identity.
///
/// Built once by the opener on a definition cache miss and shared read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    engine: Arc<str>,
    columns: Vec<ColumnDef>,
    options: Vec<(String, String)>,
}

impl TableDefinition {
    pub fn new(engine: impl Into<Arc<str>>, columns: Vec<ColumnDef>) -> Self {
        Self {
            engine: engine.into(),
            columns,
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    /// Name of the storage engine this table lives in.
    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name() == name)
    }
}

/// Failure reported by the storage layer while materializing a cached object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("definition does not exist")]
    NotFound,
    #[error("{0}")]
    Storage(String),
}

/// Live storage-engine handle behind a [`TableInstance`].
///
/// Owned by exactly one worker while in use; never shared between threads.
///
/// [`TableInstance`]: crate::instance::TableInstance
pub trait InstanceHandle: Debug + Send {
    /// True when the handle can no longer be recycled (the underlying object
    /// changed underneath it) and must be closed on release.
    fn needs_reopen(&self) -> bool {
        false
    }
}

/// Storage/metadata layer callbacks consumed by the cache.
pub trait TableOpener: Debug + Send + Sync {
    /// Read and parse the durable definition of `key`. Invoked exactly once per
    /// definition cache miss; the result is never retried internally.
    fn open_definition(&self, key: &TableKey) -> Result<TableDefinition, OpenError>;

    /// Open a live handle for data access against `descriptor`.
    fn open_instance(
        &self,
        descriptor: &TableDescriptor,
    ) -> Result<Box<dyn InstanceHandle>, OpenError>;

    /// Close a handle. May block on storage I/O; the cache only calls this with
    /// all of its locks released, under the flush barrier.
    fn close_instance(&self, handle: Box<dyn InstanceHandle>);
}
