//! SQLite storage backend.
//!
//! Working relations are `TEMP` tables, so they are private to the single
//! connection held here and disappear when it closes. Persistent tables of
//! an attached database file stay readable by rule predicates.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::storage::traits::{ColumnType, RelationSchema, Row, SessionBackend, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn query_err(e: &rusqlite::Error) -> StorageError {
    StorageError::QueryFailed(e.to_string())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn value_to_text(value: ValueRef<'_>) -> Result<Option<String>, StorageError> {
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(i) => Ok(Some(i.to_string())),
        ValueRef::Real(r) => Ok(Some(r.to_string())),
        ValueRef::Text(bytes) => Ok(Some(String::from_utf8_lossy(bytes).into_owned())),
        ValueRef::Blob(_) => Err(StorageError::QueryFailed(
            "blob values are not supported in working relations".to_string(),
        )),
    }
}

fn collect_rows(stmt: &mut rusqlite::Statement<'_>) -> Result<Vec<Row>, StorageError> {
    let width = stmt.column_count();
    let mut rows = stmt.query([]).map_err(|e| query_err(&e))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| query_err(&e))? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            let value = row.get_ref(idx).map_err(|e| query_err(&e))?;
            values.push(value_to_text(value)?);
        }
        out.push(values);
    }
    Ok(out)
}

fn create_sql(name: &str, schema: &RelationSchema, key: &[String]) -> String {
    let mut defs: Vec<String> = schema
        .columns()
        .iter()
        .map(|col| {
            let ident = quote_ident(&col.name);
            match col.column_type {
                ColumnType::Text => format!("{ident} TEXT"),
                ColumnType::Flag => format!("{ident} TEXT CHECK ({ident} IN ('yes', 'no'))"),
            }
        })
        .collect();
    if !key.is_empty() {
        let key_cols: Vec<&str> = key.iter().map(String::as_str).collect();
        defs.push(format!("PRIMARY KEY ({})", column_list(&key_cols)));
    }
    format!("CREATE TEMP TABLE {} ({})", quote_ident(name), defs.join(", "))
}

fn temp_relation_exists(conn: &Connection, name: &str) -> Result<bool, StorageError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .map_err(|e| query_err(&e))?;
    Ok(count > 0)
}

/// SQLite-backed session store.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::BackendError(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Opens (or creates) a database file. Working relations still live in
    /// the connection's temp schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn =
            Connection::open(path).map_err(|e| StorageError::BackendError(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an existing connection.
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    /// Runs a batch of statements, typically to seed reference tables.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        self.with_conn("execute_batch", |conn| {
            conn.execute_batch(sql).map_err(|e| query_err(&e))
        })
    }

    fn with_conn<T>(
        &self,
        context: &'static str,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.conn.lock().map_err(|_| lock_err(context))?;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        f(conn)
    }
}

impl SessionBackend for SqliteBackend {
    fn create_relation(
        &self,
        name: &str,
        schema: &RelationSchema,
        key: &[String],
    ) -> Result<(), StorageError> {
        if schema.is_empty() {
            return Err(StorageError::BackendError(format!(
                "relation {name} must declare at least one column"
            )));
        }
        if let Some(missing) = key.iter().find(|k| !schema.contains(k)) {
            return Err(StorageError::BackendError(format!(
                "key column {missing} is not part of relation {name}"
            )));
        }

        self.with_conn("create_relation", |conn| {
            if temp_relation_exists(conn, name)? {
                return Err(StorageError::RelationExists(name.to_string()));
            }
            conn.execute(&create_sql(name, schema, key), [])
                .map_err(|e| query_err(&e))?;
            debug!(relation = name, schema = %schema, "created temp relation");
            Ok(())
        })
    }

    fn drop_relation(&self, name: &str) -> Result<(), StorageError> {
        self.with_conn("drop_relation", |conn| {
            if !temp_relation_exists(conn, name)? {
                return Err(StorageError::RelationNotFound(name.to_string()));
            }
            conn.execute(&format!("DROP TABLE temp.{}", quote_ident(name)), [])
                .map_err(|e| query_err(&e))?;
            debug!(relation = name, "dropped temp relation");
            Ok(())
        })
    }

    fn insert_rows(&self, name: &str, columns: &[&str], rows: &[Row]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO temp.{} ({}) VALUES ({placeholders}) ON CONFLICT DO NOTHING",
            quote_ident(name),
            column_list(columns)
        );

        self.with_conn("insert_rows", |conn| {
            let tx = conn.transaction().map_err(|e| query_err(&e))?;
            let mut inserted = 0usize;
            {
                let mut stmt = tx.prepare(&sql).map_err(|e| query_err(&e))?;
                for row in rows {
                    if row.len() != columns.len() {
                        return Err(StorageError::QueryFailed(format!(
                            "row has {} values for {} columns",
                            row.len(),
                            columns.len()
                        )));
                    }
                    inserted += stmt
                        .execute(params_from_iter(row.iter()))
                        .map_err(|e| query_err(&e))?;
                }
            }
            tx.commit().map_err(|e| query_err(&e))?;
            Ok(inserted)
        })
    }

    fn insert_from_query(
        &self,
        name: &str,
        columns: &[&str],
        select: &str,
    ) -> Result<usize, StorageError> {
        // The trailing WHERE keeps the upsert clause unambiguous.
        let sql = format!(
            "INSERT INTO temp.{} ({}) SELECT * FROM ({select}) WHERE true ON CONFLICT DO NOTHING",
            quote_ident(name),
            column_list(columns)
        );
        self.with_conn("insert_from_query", |conn| {
            conn.execute(&sql, []).map_err(|e| query_err(&e))
        })
    }

    fn scan(&self, name: &str, columns: &[&str]) -> Result<Vec<Row>, StorageError> {
        let sql = format!(
            "SELECT {} FROM temp.{}",
            column_list(columns),
            quote_ident(name)
        );
        self.with_conn("scan", |conn| {
            if !temp_relation_exists(conn, name)? {
                return Err(StorageError::RelationNotFound(name.to_string()));
            }
            let mut stmt = conn.prepare(&sql).map_err(|e| query_err(&e))?;
            collect_rows(&mut stmt)
        })
    }

    fn count(&self, name: &str) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM temp.{}", quote_ident(name));
        self.with_conn("count", |conn| {
            let count: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .map_err(|e| query_err(&e))?;
            u64::try_from(count).map_err(|_| {
                StorageError::BackendError(format!("negative row count for {name}: {count}"))
            })
        })
    }

    fn query(&self, select: &str) -> Result<(Vec<String>, Vec<Row>), StorageError> {
        self.with_conn("query", |conn| {
            let mut stmt = conn.prepare(select).map_err(|e| query_err(&e))?;
            let names: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let rows = collect_rows(&mut stmt)?;
            Ok((names, rows))
        })
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.with_conn("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| query_err(&e))
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().map_err(|_| lock_err("close"))?;
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        conn.close()
            .map_err(|(_, e)| StorageError::BackendError(e.to_string()))
    }
}
