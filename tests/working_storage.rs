use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use suppression_engine::storage::{RelationSchema, Row, SessionBackend, SqliteBackend, StorageError};
use suppression_engine::{
    EngineOptions, PopulationRecord, RawRuleDefinition, RawRuleSet, ResourceError, RuleCatalog,
    Session, SuppressionEngine, WorkingStorage,
};

/// Delegates to SQLite but fails selected operations on demand.
struct FlakyBackend {
    inner: SqliteBackend,
    fail_drop_containing: Mutex<HashSet<String>>,
    fail_create_containing: Mutex<HashSet<String>>,
    drop_attempts: Mutex<Vec<String>>,
}

impl FlakyBackend {
    fn new() -> Self {
        Self {
            inner: SqliteBackend::open_in_memory().unwrap(),
            fail_drop_containing: Mutex::new(HashSet::new()),
            fail_create_containing: Mutex::new(HashSet::new()),
            drop_attempts: Mutex::new(Vec::new()),
        }
    }

    fn fail_drops_of(&self, fragment: &str) {
        self.fail_drop_containing.lock().unwrap().insert(fragment.to_string());
    }

    fn fail_creates_of(&self, fragment: &str) {
        self.fail_create_containing.lock().unwrap().insert(fragment.to_string());
    }

    fn drop_attempts(&self) -> Vec<String> {
        self.drop_attempts.lock().unwrap().clone()
    }
}

fn matches_any(set: &Mutex<HashSet<String>>, name: &str) -> bool {
    set.lock().unwrap().iter().any(|f| name.contains(f.as_str()))
}

impl SessionBackend for FlakyBackend {
    fn create_relation(&self, name: &str, schema: &RelationSchema, key: &[String]) -> Result<(), StorageError> {
        if matches_any(&self.fail_create_containing, name) {
            return Err(StorageError::BackendError(format!("spool space exhausted for {name}")));
        }
        self.inner.create_relation(name, schema, key)
    }

    fn drop_relation(&self, name: &str) -> Result<(), StorageError> {
        self.drop_attempts.lock().unwrap().push(name.to_string());
        if matches_any(&self.fail_drop_containing, name) {
            return Err(StorageError::BackendError(format!("lock timeout dropping {name}")));
        }
        self.inner.drop_relation(name)
    }

    fn insert_rows(&self, name: &str, columns: &[&str], rows: &[Row]) -> Result<usize, StorageError> {
        self.inner.insert_rows(name, columns, rows)
    }

    fn insert_from_query(&self, name: &str, columns: &[&str], select: &str) -> Result<usize, StorageError> {
        self.inner.insert_from_query(name, columns, select)
    }

    fn scan(&self, name: &str, columns: &[&str]) -> Result<Vec<Row>, StorageError> {
        self.inner.scan(name, columns)
    }

    fn count(&self, name: &str) -> Result<u64, StorageError> {
        self.inner.count(name)
    }

    fn query(&self, select: &str) -> Result<(Vec<String>, Vec<Row>), StorageError> {
        self.inner.query(select)
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping()
    }

    fn close(&self) -> Result<(), StorageError> {
        self.inner.close()
    }
}

fn flaky_storage() -> (Arc<FlakyBackend>, WorkingStorage) {
    let backend = Arc::new(FlakyBackend::new());
    let session = Arc::new(Session::new(backend.clone()));
    (backend, WorkingStorage::new(session))
}

fn ids() -> RelationSchema {
    RelationSchema::new().text("entity_id")
}

#[test]
fn drop_all_attempts_every_relation_when_one_fails() {
    let (backend, ws) = flaky_storage();
    let names: Vec<String> = ["alpha", "bravo", "charlie", "delta", "echo"]
        .iter()
        .map(|hint| ws.create(hint, ids(), None).unwrap().name().to_string())
        .collect();
    backend.fail_drops_of("charlie");

    let report = ws.drop_all();

    let mut attempted = backend.drop_attempts();
    attempted.sort();
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(attempted, expected);

    assert_eq!(report.attempted(), 5);
    assert_eq!(report.dropped.len(), 4);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].0.starts_with("charlie_"));
    assert!(report.failed[0].1.contains("lock timeout"));
    assert!(ws.tracked().is_empty());
}

#[test]
fn failed_single_drop_stays_tracked_for_retry() {
    let (backend, ws) = flaky_storage();
    let handle = ws.create("sticky", ids(), None).unwrap();
    backend.fail_drops_of("sticky");

    assert!(!ws.drop_relation(&handle));
    assert!(ws.is_tracked(&handle));

    let report = ws.drop_all();
    assert_eq!(report.failed.len(), 1);
    assert!(ws.tracked().is_empty());
}

#[test]
fn allocation_failure_is_resource_error_and_untracked() {
    let (backend, ws) = flaky_storage();
    backend.fail_creates_of("scratch");

    let err = ws.create("scratch", ids(), None).unwrap_err();
    assert!(matches!(err, ResourceError::AllocationFailed { .. }));
    assert!(err.to_string().contains("spool space"));
    assert!(ws.tracked().is_empty());
}

#[test]
fn rule_allocation_failure_aborts_the_run() {
    let backend = Arc::new(FlakyBackend::new());
    backend.fail_creates_of("rule_r2");
    let session = Arc::new(Session::new(backend.clone()));
    let engine = SuppressionEngine::new(session, EngineOptions::default()).unwrap();

    let raw = RawRuleSet::new()
        .with(
            "r1",
            RawRuleDefinition::new("one", "d", "SELECT entity_id FROM {entity_universe}", "entity"),
        )
        .with(
            "r2",
            RawRuleDefinition::new("two", "d", "SELECT entity_id FROM {entity_universe}", "entity"),
        );
    let catalog = RuleCatalog::load(&raw).unwrap();

    let err = engine
        .run(&catalog, &[PopulationRecord::new("A", "x")])
        .unwrap_err();
    assert!(err.is_resource());

    // Population and the r1 match relation are still cleaned up.
    let report = engine.teardown();
    assert!(report.is_clean());
    assert_eq!(report.dropped.len(), 3);
}

#[test]
fn master_allocation_failure_is_aggregation_error() {
    let backend = Arc::new(FlakyBackend::new());
    backend.fail_creates_of("master_suppression");
    let session = Arc::new(Session::new(backend.clone()));
    let engine = SuppressionEngine::new(session, EngineOptions::default()).unwrap();

    let raw = RawRuleSet::new().with(
        "r1",
        RawRuleDefinition::new("one", "d", "SELECT entity_id FROM {entity_universe}", "entity"),
    );
    let err = engine
        .run(&RuleCatalog::load(&raw).unwrap(), &[PopulationRecord::new("A", "x")])
        .unwrap_err();
    assert!(err.is_aggregation());
    engine.teardown();
}

#[test]
fn dropping_storage_cleans_up_live_relations() {
    let backend = Arc::new(FlakyBackend::new());
    let session = Arc::new(Session::new(backend.clone()));
    {
        let ws = WorkingStorage::new(session.clone());
        ws.create("orphan", ids(), None).unwrap();
        ws.create("orphan", ids(), None).unwrap();
    }
    assert_eq!(backend.drop_attempts().len(), 2);
}

#[test]
fn session_teardown_with_registered_components_still_closes() {
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let session = Arc::new(Session::new(backend));
    let lease = session.lease("report_reader").unwrap();
    session.register("universe_loader").unwrap();

    session.teardown();
    assert!(session.info().closed);
    assert!(session.active_components().is_empty());
    assert!(!session.is_active());

    // Releasing after teardown only logs.
    drop(lease);
    session.teardown();
}
