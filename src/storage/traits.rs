//! Abstract backing-store contract.
//!
//! The engine never plans queries itself. It asks a backend to allocate
//! session-scoped relations, run set-producing selects into them, and read
//! them back. Implementations must keep every relation they create visible to
//! all later calls on the same backend until it is dropped or the backend is
//! closed.

use std::fmt;

use thiserror::Error;

/// A single row. Every value crosses the boundary as text; SQL NULL is `None`.
pub type Row = Vec<Option<String>>;

/// Errors that can occur during backend operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Relation already exists.
    #[error("Relation already exists: {0}")]
    RelationExists(String),

    /// Relation not found.
    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    /// Statement failed to prepare or execute.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Backend connection is closed.
    #[error("Backend connection is closed")]
    Closed,
}

/// Column value domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Free text.
    Text,
    /// `'yes'` or `'no'`.
    Flag,
}

/// A named column of a relation schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Value domain.
    pub column_type: ColumnType,
}

/// Ordered column list of a working relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RelationSchema {
    columns: Vec<ColumnDef>,
}

impl RelationSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text column.
    #[must_use]
    pub fn text(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            column_type: ColumnType::Text,
        });
        self
    }

    /// Appends a yes/no flag column.
    #[must_use]
    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            column_type: ColumnType::Flag,
        });
        self
    }

    /// Columns in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Column names in declaration order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns true if a column with this name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if no columns are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl fmt::Display for RelationSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.column_names().join(", "))
    }
}

/// Storage trait for session-scoped relations.
///
/// # Semantics
/// - Relations are ephemeral: closing the backend discards all of them
/// - `key` columns deduplicate rows; inserting a row whose key already
///   exists is silently ignored
/// - Insert methods return the number of rows actually stored
pub trait SessionBackend: Send + Sync {
    /// Allocate a new relation. Returns error if the name is taken.
    fn create_relation(
        &self,
        name: &str,
        schema: &RelationSchema,
        key: &[String],
    ) -> Result<(), StorageError>;

    /// Drop a relation. Returns error if it does not exist.
    fn drop_relation(&self, name: &str) -> Result<(), StorageError>;

    /// Insert literal rows into the given columns.
    fn insert_rows(&self, name: &str, columns: &[&str], rows: &[Row]) -> Result<usize, StorageError>;

    /// Insert the result of a select statement into the given columns.
    fn insert_from_query(&self, name: &str, columns: &[&str], select: &str)
        -> Result<usize, StorageError>;

    /// Read the given columns of every row.
    fn scan(&self, name: &str, columns: &[&str]) -> Result<Vec<Row>, StorageError>;

    /// Count rows of a relation.
    fn count(&self, name: &str) -> Result<u64, StorageError>;

    /// Run an arbitrary select and return its rows with column names.
    fn query(&self, select: &str) -> Result<(Vec<String>, Vec<Row>), StorageError>;

    /// Cheap liveness probe.
    fn ping(&self) -> Result<(), StorageError>;

    /// Close the underlying connection, discarding every relation.
    fn close(&self) -> Result<(), StorageError>;
}
