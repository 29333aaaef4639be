//! Working-storage manager.
//!
//! Owns every ephemeral relation a run creates on the shared session. Names
//! are unique for the life of the session and every relation is tracked until
//! it is dropped, so one `drop_all` is enough to leave the session clean.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ResourceError, SuppressResult};
use crate::session::Session;
use crate::storage::{RelationSchema, Row, SessionBackend};

/// Reference to a working relation created by [`WorkingStorage`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationHandle {
    name: String,
    schema: RelationSchema,
    key: Vec<String>,
}

impl RelationHandle {
    /// Backend relation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared schema.
    #[must_use]
    pub fn schema(&self) -> &RelationSchema {
        &self.schema
    }

    /// Deduplication key columns (possibly empty).
    #[must_use]
    pub fn key(&self) -> &[String] {
        &self.key
    }
}

/// Result of dropping every tracked relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Relations dropped successfully.
    pub dropped: Vec<String>,
    /// Relations whose drop failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    /// Returns true if every drop succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of relations attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.dropped.len() + self.failed.len()
    }
}

fn sanitize_hint(hint: &str) -> String {
    let cleaned: String = hint
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "relation".to_string()
    } else {
        cleaned
    }
}

/// Session-scoped owner of working relations.
#[derive(Debug)]
pub struct WorkingStorage {
    session: Arc<Session>,
    sequence: AtomicU64,
    tracked: Mutex<BTreeSet<String>>,
}

impl WorkingStorage {
    /// Creates a manager on the given session.
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            sequence: AtomicU64::new(0),
            tracked: Mutex::new(BTreeSet::new()),
        }
    }

    /// The shared session.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The session backend.
    pub fn backend(&self) -> Result<&dyn SessionBackend, ResourceError> {
        self.session.backend()
    }

    fn lock_tracked(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_name(&self, name_hint: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}_{seq}", sanitize_hint(name_hint), self.session.id())
    }

    /// Allocates a new relation.
    ///
    /// # Errors
    /// - `AllocationFailed`: the backend refused the relation
    /// - `SessionClosed`: the session has been torn down
    pub fn create(
        &self,
        name_hint: &str,
        schema: RelationSchema,
        dedup_key: Option<&[&str]>,
    ) -> Result<RelationHandle, ResourceError> {
        let name = self.next_name(name_hint);
        let key: Vec<String> = dedup_key
            .unwrap_or_default()
            .iter()
            .map(|k| (*k).to_string())
            .collect();

        self.backend()?
            .create_relation(&name, &schema, &key)
            .map_err(|e| ResourceError::AllocationFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        self.lock_tracked().insert(name.clone());
        debug!(relation = %name, schema = %schema, "working relation created");
        Ok(RelationHandle { name, schema, key })
    }

    /// Drops one relation. Failures are logged and the relation stays
    /// tracked so `drop_all` retries it. Returns true on success.
    pub fn drop_relation(&self, handle: &RelationHandle) -> bool {
        self.drop_by_name(handle.name())
    }

    fn drop_by_name(&self, name: &str) -> bool {
        let result = self
            .backend()
            .map_err(|e| e.to_string())
            .and_then(|backend| backend.drop_relation(name).map_err(|e| e.to_string()));
        match result {
            Ok(()) => {
                self.lock_tracked().remove(name);
                debug!(relation = name, "working relation dropped");
                true
            }
            Err(reason) => {
                warn!(relation = name, error = %reason, "failed to drop working relation");
                false
            }
        }
    }

    /// Attempts to drop every tracked relation and clears tracking,
    /// whatever the individual outcomes.
    pub fn drop_all(&self) -> TeardownReport {
        let names: Vec<String> = self.lock_tracked().iter().cloned().collect();
        let mut report = TeardownReport::default();
        if names.is_empty() {
            return report;
        }

        info!(count = names.len(), session = %self.session.id(), "dropping working relations");
        let backend = self.backend();
        for name in names {
            let result = match &backend {
                Ok(b) => b.drop_relation(&name).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => {
                    debug!(relation = %name, "working relation dropped");
                    report.dropped.push(name);
                }
                Err(reason) => {
                    warn!(relation = %name, error = %reason, "failed to drop working relation");
                    report.failed.push((name, reason));
                }
            }
        }

        self.lock_tracked().clear();
        if !report.is_clean() {
            warn!(
                failed = report.failed.len(),
                dropped = report.dropped.len(),
                "working storage teardown was partial"
            );
        }
        report
    }

    /// Names of tracked relations, ascending.
    #[must_use]
    pub fn tracked(&self) -> Vec<String> {
        self.lock_tracked().iter().cloned().collect()
    }

    /// Returns true if the relation is still tracked.
    #[must_use]
    pub fn is_tracked(&self, handle: &RelationHandle) -> bool {
        self.lock_tracked().contains(handle.name())
    }

    /// Inserts rows laid out in the handle's schema order.
    pub fn insert_rows(&self, handle: &RelationHandle, rows: &[Row]) -> Result<usize, ResourceError> {
        let columns = handle.schema().column_names();
        self.backend()?
            .insert_rows(handle.name(), &columns, rows)
            .map_err(|e| ResourceError::WriteFailed {
                name: handle.name().to_string(),
                reason: e.to_string(),
            })
    }

    /// Fills the relation from a select producing its columns in schema
    /// order.
    pub fn insert_from_query(&self, handle: &RelationHandle, select: &str) -> Result<usize, ResourceError> {
        let columns = handle.schema().column_names();
        self.backend()?
            .insert_from_query(handle.name(), &columns, select)
            .map_err(|e| ResourceError::WriteFailed {
                name: handle.name().to_string(),
                reason: e.to_string(),
            })
    }

    /// Runs an aggregate select and returns its rows.
    pub fn query(&self, handle: &RelationHandle, select: &str) -> Result<Vec<Row>, ResourceError> {
        self.backend()?
            .query(select)
            .map(|(_, rows)| rows)
            .map_err(|e| ResourceError::ReadFailed {
                name: handle.name().to_string(),
                reason: e.to_string(),
            })
    }

    /// Reads the given columns of every row.
    pub fn scan(&self, handle: &RelationHandle, columns: &[&str]) -> Result<Vec<Row>, ResourceError> {
        self.backend()?
            .scan(handle.name(), columns)
            .map_err(|e| ResourceError::ReadFailed {
                name: handle.name().to_string(),
                reason: e.to_string(),
            })
    }

    /// Counts rows.
    pub fn count(&self, handle: &RelationHandle) -> Result<u64, ResourceError> {
        self.backend()?
            .count(handle.name())
            .map_err(|e| ResourceError::ReadFailed {
                name: handle.name().to_string(),
                reason: e.to_string(),
            })
    }

    /// Runs `f` against a relation that is dropped afterwards on every path.
    pub fn temporary<T>(
        &self,
        name_hint: &str,
        schema: RelationSchema,
        dedup_key: Option<&[&str]>,
        f: impl FnOnce(&RelationHandle) -> SuppressResult<T>,
    ) -> SuppressResult<T> {
        let handle = self.create(name_hint, schema, dedup_key)?;
        let result = f(&handle);
        self.drop_relation(&handle);
        result
    }
}

impl Drop for WorkingStorage {
    fn drop(&mut self) {
        let pending = self.lock_tracked().len();
        if pending > 0 {
            warn!(pending, "working storage dropped with live relations; cleaning up");
            self.drop_all();
        }
    }
}
