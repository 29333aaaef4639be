use std::io::Write;

use suppression_engine::{ConfigurationError, EngineConfig, RuleId, RuleLevel};

const RULES: &str = r#"{
    "retain_match_relations": true,
    "rules": {
        "start_1": {
            "name": "Excluded providers",
            "description": "Providers on the exclusion list",
            "sql_query": "SELECT entity_id FROM exclusions",
            "level": "npi_level_is_not_a_level"
        }
    }
}"#;

fn config_with_rules(rules: &str) -> String {
    format!(r#"{{ "rules": {rules} }}"#)
}

#[test]
fn config_file_roundtrip_through_tempfile() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "{}",
        config_with_rules(
            r#"{
                "end_1": {
                    "name": "Retired",
                    "description": "Retired specialty",
                    "predicate_source": "SELECT entity_id, attribute_value FROM {base_combinations} WHERE attribute_value = 'Retired'",
                    "level": "Entity_Attribute"
                }
            }"#
        )
    )
    .unwrap();

    let config = EngineConfig::from_path(file.path()).unwrap();
    assert!(config.session_label.is_none());
    assert!(!config.engine_options().retain_match_relations);

    let catalog = config.catalog().unwrap();
    let rule = catalog.get(&RuleId::parse("end_1").unwrap()).unwrap();
    assert_eq!(rule.level, RuleLevel::EntityAttribute);
    assert_eq!(rule.predicate.slots().len(), 1);
}

#[test]
fn invalid_level_names_the_rule() {
    let config = EngineConfig::from_json_str(RULES).unwrap();
    assert!(config.engine_options().retain_match_relations);

    let err = config.catalog().unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::InvalidLevel {
            rule_id: "start_1".to_string(),
            value: "npi_level_is_not_a_level".to_string(),
        }
    );
    assert!(err.to_string().contains("start_1"));
}

#[test]
fn duplicate_rule_ids_in_json_are_rejected() {
    let config = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "r1": {"name": "a", "description": "", "predicate_source": "SELECT entity_id FROM t", "level": "entity"},
            "r1": {"name": "b", "description": "", "predicate_source": "SELECT entity_id FROM t", "level": "entity"}
        }"#,
    ))
    .unwrap();
    assert_eq!(config.rules.len(), 2);

    let err = config.catalog().unwrap_err();
    assert_eq!(err, ConfigurationError::DuplicateRuleId { rule_id: "r1".to_string() });
}

#[test]
fn rule_ids_differing_in_case_fail_at_load() {
    let config = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "R1": {"name": "a", "description": "", "predicate_source": "SELECT entity_id FROM t", "level": "entity"},
            "r1": {"name": "b", "description": "", "predicate_source": "SELECT entity_id FROM t", "level": "entity"}
        }"#,
    ))
    .unwrap();

    let err = config.catalog().unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::RuleIdCaseCollision {
            rule_id: "r1".to_string(),
            existing: "R1".to_string(),
        }
    );
    assert!(err.to_string().contains("letter case"));
}

#[test]
fn missing_field_is_reported_per_rule() {
    let config = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "r1": {"name": "a", "description": "d", "level": "entity"}
        }"#,
    ))
    .unwrap();
    let err = config.catalog().unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::MissingField {
            rule_id: "r1".to_string(),
            field: "predicate_source".to_string(),
        }
    );
}

#[test]
fn unknown_placeholder_is_rejected_at_load() {
    let config = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "r1": {"name": "a", "description": "d", "predicate_source": "SELECT npi FROM {npi_universe_table}", "level": "entity"}
        }"#,
    ))
    .unwrap();
    let err = config.catalog().unwrap_err();
    assert!(matches!(err, ConfigurationError::UnknownPlaceholder { ref placeholder, .. } if placeholder == "npi_universe_table"));
}

#[test]
fn rule_id_with_separator_is_rejected() {
    let config = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "r-1": {"name": "a", "description": "d", "predicate_source": "SELECT entity_id FROM t", "level": "entity"}
        }"#,
    ))
    .unwrap();
    assert!(matches!(config.catalog().unwrap_err(), ConfigurationError::InvalidRuleId { .. }));
}

#[test]
fn fingerprint_depends_on_rule_content_not_order() {
    let a = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "r1": {"name": "a", "description": "d", "predicate_source": "SELECT entity_id FROM t1", "level": "entity"},
            "r2": {"name": "b", "description": "d", "predicate_source": "SELECT entity_id FROM t2", "level": "entity"}
        }"#,
    ))
    .unwrap();
    let b = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "r2": {"name": "renamed", "description": "d", "predicate_source": "SELECT entity_id FROM t2", "level": "entity"},
            "r1": {"name": "a", "description": "d", "predicate_source": "SELECT entity_id FROM t1", "level": "entity"}
        }"#,
    ))
    .unwrap();
    let c = EngineConfig::from_json_str(&config_with_rules(
        r#"{
            "r1": {"name": "a", "description": "d", "predicate_source": "SELECT entity_id FROM t9", "level": "entity"}
        }"#,
    ))
    .unwrap();

    let fa = a.catalog().unwrap().fingerprint();
    assert_eq!(fa, b.catalog().unwrap().fingerprint());
    assert_ne!(fa, c.catalog().unwrap().fingerprint());
    assert_eq!(fa.len(), 64);
}

#[test]
fn malformed_json_is_parse_error() {
    let err = EngineConfig::from_json_str("{ rules: ").unwrap_err();
    assert!(matches!(err, ConfigurationError::Parse { .. }));
}
