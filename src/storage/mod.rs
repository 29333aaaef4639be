//! Backing store for working relations.
//!
//! `SessionBackend` is the contract; `SqliteBackend` keeps every working
//! relation as a connection-scoped TEMP table.

mod sqlite;
mod traits;

pub use sqlite::SqliteBackend;
pub use traits::{ColumnDef, ColumnType, RelationSchema, Row, SessionBackend, StorageError};
