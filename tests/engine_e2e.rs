use std::sync::Arc;

use suppression_engine::{
    EngineConfig, EngineOptions, PopulationRecord, RawRuleDefinition, RawRuleSet, RuleCatalog,
    RuleId, Session, SqliteBackend, StatisticsCalculator, SuppressionEngine, NO_RULES_SENTINEL,
};

fn session_with_reference_tables() -> Arc<Session> {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend
        .execute_batch(
            "CREATE TABLE exclusions (entity_id TEXT);
             INSERT INTO exclusions VALUES ('A');
             CREATE TABLE retired_specialties (entity_id TEXT, attribute_value TEXT);
             INSERT INTO retired_specialties VALUES ('B', 'x');",
        )
        .unwrap();
    Arc::new(Session::new(Arc::new(backend)))
}

fn population() -> Vec<PopulationRecord> {
    vec![
        PopulationRecord::new("A", "x"),
        PopulationRecord::new("A", "y"),
        PopulationRecord::new("B", "x"),
    ]
}

fn r1() -> RawRuleDefinition {
    RawRuleDefinition::new(
        "Excluded entities",
        "Entity on the exclusion list",
        "SELECT u.entity_id FROM {entity_universe} u JOIN exclusions e ON e.entity_id = u.entity_id",
        "entity",
    )
}

fn r2() -> RawRuleDefinition {
    RawRuleDefinition::new(
        "Retired specialty",
        "Pair on the retired list",
        "SELECT b.entity_id, b.attribute_value FROM {base_combinations} b \
         JOIN retired_specialties r ON r.entity_id = b.entity_id AND r.attribute_value = b.attribute_value",
        "entity_attribute",
    )
}

fn r3_failing() -> RawRuleDefinition {
    RawRuleDefinition::new(
        "Broken",
        "References a table that does not exist",
        "SELECT entity_id FROM missing_reference_table",
        "entity",
    )
}

fn rid(s: &str) -> RuleId {
    RuleId::parse(s).unwrap()
}

#[test]
fn reference_scenario_suppresses_every_record() {
    let session = session_with_reference_tables();
    let engine = SuppressionEngine::new(session.clone(), EngineOptions::default()).unwrap();
    let catalog = RuleCatalog::load(&RawRuleSet::new().with("r1", r1()).with("r2", r2())).unwrap();

    let report = engine.run(&catalog, &population()).unwrap();
    assert!(report.is_complete());

    let records = report.master.records(engine.storage()).unwrap();
    let view: Vec<(&str, Option<bool>, Option<bool>, bool, bool)> = records
        .iter()
        .map(|r| {
            (
                r.composite_key.as_str(),
                r.flag(&rid("r1")),
                r.flag(&rid("r2")),
                r.suppressed,
                r.unsuppressed,
            )
        })
        .collect();
    assert_eq!(
        view,
        vec![
            ("A-x", Some(true), Some(false), true, false),
            ("A-y", Some(true), Some(false), true, false),
            ("B-x", Some(false), Some(true), true, false),
        ]
    );

    let stats = report.statistics;
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.suppressed_records, 3);
    assert_eq!(stats.unsuppressed_records, 0);
    assert_eq!(stats.unique_entities, 2);
    assert_eq!(stats.suppressed_entities, 2);
    assert_eq!(stats.unsuppressed_entities, 0);

    let calculator = StatisticsCalculator::new(engine.storage());
    assert_eq!(calculator.summarize(&report.master).unwrap(), stats);
    let impact = calculator.rule_impact(&report.master, &report.outcomes).unwrap();
    let flagged: Vec<(&str, u64, u64)> = impact
        .iter()
        .map(|i| (i.rule_id.as_str(), i.records_flagged, i.entities_flagged))
        .collect();
    assert_eq!(flagged, vec![("r1", 2, 1), ("r2", 1, 1)]);
    assert_eq!(
        calculator.combination_breakdown(&report.master).unwrap(),
        report.combinations
    );

    let teardown = engine.teardown();
    assert!(teardown.is_clean());
    assert!(session.active_components().is_empty());
    session.teardown();
}

#[test]
fn failed_rule_is_reported_and_excluded() {
    let session = session_with_reference_tables();
    let engine = SuppressionEngine::new(session, EngineOptions::default()).unwrap();
    let catalog = RuleCatalog::load(
        &RawRuleSet::new()
            .with("r1", r1())
            .with("r2", r2())
            .with("r3", r3_failing()),
    )
    .unwrap();

    let report = engine.run(&catalog, &population()).unwrap();

    let failed = report.failed_outcomes();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].rule_id(), &rid("r3"));
    assert_eq!(failed[0].matched_count(), 0);
    assert!(!failed[0].error_message().unwrap().is_empty());

    assert_eq!(report.succeeded_rule_ids(), vec![&rid("r1"), &rid("r2")]);
    assert!(!report.master.column_names().contains(&"rule_r3_flag"));

    // Same flags as without r3.
    let keys: Vec<String> = report
        .master
        .records(engine.storage())
        .unwrap()
        .into_iter()
        .map(|r| r.combination_key)
        .collect();
    assert_eq!(keys, vec!["yes-no", "yes-no", "no-yes"]);
    assert_eq!(report.statistics.suppressed_records, 3);

    let impact = report.rule_impact.iter().find(|i| i.rule_id == "r3").unwrap();
    assert_eq!(impact.records_flagged, 0);
    assert!(impact.error_message.is_some());

    engine.teardown();
}

#[test]
fn empty_rule_set_passes_population_through() {
    let session = session_with_reference_tables();
    let engine = SuppressionEngine::new(session, EngineOptions::default()).unwrap();
    let catalog = RuleCatalog::load(&RawRuleSet::new()).unwrap();

    let report = engine.run(&catalog, &population()).unwrap();
    assert!(report.master.active_rules().is_empty());

    let records = report.master.records(engine.storage()).unwrap();
    assert!(records
        .iter()
        .all(|r| r.combination_key == NO_RULES_SENTINEL && !r.suppressed && r.unsuppressed));
    assert_eq!(report.statistics.unsuppressed_records, 3);
    assert_eq!(report.statistics.unsuppressed_entities, 2);

    engine.teardown();
}

#[test]
fn entity_rule_applies_to_every_attribute_of_the_entity() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend
        .execute_batch("CREATE TABLE exclusions (entity_id TEXT); INSERT INTO exclusions VALUES ('1234567890');")
        .unwrap();
    let session = Arc::new(Session::new(Arc::new(backend)));
    let engine = SuppressionEngine::new(session, EngineOptions::default()).unwrap();
    let catalog = RuleCatalog::load(&RawRuleSet::new().with(
        "r1",
        RawRuleDefinition::new(
            "Excluded",
            "exclusion list",
            "SELECT entity_id FROM exclusions",
            "entity",
        ),
    ))
    .unwrap();

    let report = engine
        .run(
            &catalog,
            &[
                PopulationRecord::new("1234567890", "Cardiology"),
                PopulationRecord::new("1234567890", "Oncology"),
                PopulationRecord::new("1234567890", "Radiology"),
                PopulationRecord::new("9876543210", "Cardiology"),
            ],
        )
        .unwrap();

    for record in report.master.records(engine.storage()).unwrap() {
        let expected = record.entity_id == "1234567890";
        assert_eq!(record.flag(&rid("r1")), Some(expected), "{}", record.composite_key);
    }
    engine.teardown();
}

#[test]
fn combination_key_ignores_declaration_order() {
    let run = |raw: RawRuleSet| {
        let engine =
            SuppressionEngine::new(session_with_reference_tables(), EngineOptions::default()).unwrap();
        let report = engine.run(&RuleCatalog::load(&raw).unwrap(), &population()).unwrap();
        let keys: Vec<(String, String)> = report
            .master
            .records(engine.storage())
            .unwrap()
            .into_iter()
            .map(|r| (r.composite_key, r.combination_key))
            .collect();
        let columns: Vec<String> = report
            .master
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        engine.teardown();
        (keys, columns)
    };

    let forward = run(RawRuleSet::new().with("r1", r1()).with("r2", r2()));
    let reversed = run(RawRuleSet::new().with("r2", r2()).with("r1", r1()));
    assert_eq!(forward, reversed);
}

#[test]
fn disabled_rules_are_not_evaluated() {
    let engine =
        SuppressionEngine::new(session_with_reference_tables(), EngineOptions::default()).unwrap();
    let catalog = RuleCatalog::load(
        &RawRuleSet::new()
            .with("r1", r1())
            .with("r3", r3_failing().enabled(false)),
    )
    .unwrap();

    let report = engine.run(&catalog, &population()).unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.failed_outcomes().is_empty());
    engine.teardown();
}

#[test]
fn config_driven_run_from_population_query() {
    let config = EngineConfig::from_json_str(
        r#"{
            "session_label": "e2e",
            "entity_id_pattern": "^[A-Z]$",
            "rules": {
                "r1": {
                    "name": "Excluded",
                    "description": "exclusion list",
                    "predicate_source": "SELECT entity_id FROM exclusions",
                    "level": "entity"
                }
            }
        }"#,
    )
    .unwrap();

    let backend = SqliteBackend::open_in_memory().unwrap();
    backend
        .execute_batch(
            "CREATE TABLE exclusions (entity_id TEXT);
             INSERT INTO exclusions VALUES ('A');
             CREATE TABLE providers (entity_id TEXT, attribute_value TEXT);
             INSERT INTO providers VALUES ('A', 'x'), ('A', 'y'), ('B', 'x'), ('B', 'x');",
        )
        .unwrap();
    let session = Arc::new(Session::with_label(Arc::new(backend), "e2e"));
    let engine = SuppressionEngine::new(session.clone(), config.engine_options()).unwrap();

    let population = engine
        .load_population_from_query("SELECT entity_id, attribute_value FROM providers")
        .unwrap();
    assert_eq!(population.record_count(), 3);

    let report = engine.run_on(&config.catalog().unwrap(), &population).unwrap();
    assert_eq!(report.statistics.suppressed_records, 2);
    assert_eq!(report.statistics.unsuppressed_records, 1);
    assert_eq!(report.statistics.suppressed_entities, 1);
    assert_eq!(report.statistics.unsuppressed_entities, 1);

    let breakdown: Vec<(&str, bool, u64)> = report
        .combinations
        .iter()
        .map(|c| (c.combination_key.as_str(), c.suppressed, c.records))
        .collect();
    assert_eq!(breakdown, vec![("yes", true, 2), ("no", false, 1)]);

    assert_eq!(session.info().label.as_deref(), Some("e2e"));
    engine.teardown();
    session.teardown();
    assert!(!session.is_active());
}

#[test]
fn run_after_session_teardown_fails_as_resource_error() {
    let session = session_with_reference_tables();
    let engine = SuppressionEngine::new(session.clone(), EngineOptions::default()).unwrap();
    let population = engine.load_population(&population()).unwrap();
    session.teardown();

    let catalog = RuleCatalog::load(&RawRuleSet::new().with("r1", r1())).unwrap();
    let err = engine.run_on(&catalog, &population).unwrap_err();
    assert!(err.is_resource());

    // Teardown still completes; the closed backend makes each drop fail.
    let teardown = engine.teardown();
    assert_eq!(teardown.failed.len(), 2);
}
