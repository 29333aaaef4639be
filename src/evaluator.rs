//! Rule evaluation.
//!
//! Each rule's predicate is rendered against the base population and its
//! distinct matches are materialized into a fresh working relation. A rule
//! that fails is recorded as a failed [`RuleOutcome`]; it never stops the
//! rules after it.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::RuleCatalog;
use crate::error::{RuleExecutionError, SuppressResult};
use crate::population::{BasePopulation, COMPOSITE_KEY_SEPARATOR};
use crate::rule::{Rule, RuleId, RuleLevel};
use crate::storage::RelationSchema;
use crate::working::{RelationHandle, WorkingStorage};

/// How one rule evaluation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleResult {
    /// Matches are stored in the relation.
    Matched(RelationHandle),
    /// Evaluation failed; the rule takes no part in aggregation.
    Failed(RuleExecutionError),
}

/// Immutable record of one evaluation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    rule_id: RuleId,
    name: String,
    level: RuleLevel,
    matched_count: u64,
    elapsed: Duration,
    result: RuleResult,
}

/// Reporting view of a [`RuleOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeSummary {
    /// Rule id.
    pub rule_id: String,
    /// Rule name.
    pub name: String,
    /// Rule level.
    pub level: RuleLevel,
    /// Distinct matches stored.
    pub matched_count: u64,
    /// Wall time spent.
    pub elapsed_time_seconds: f64,
    /// Whether the rule takes part in aggregation.
    pub success: bool,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RuleOutcome {
    fn matched(rule: &Rule, relation: RelationHandle, matched_count: u64, elapsed: Duration) -> Self {
        Self {
            rule_id: rule.id.clone(),
            name: rule.name.clone(),
            level: rule.level,
            matched_count,
            elapsed,
            result: RuleResult::Matched(relation),
        }
    }

    fn failed(rule: &Rule, error: RuleExecutionError, elapsed: Duration) -> Self {
        Self {
            rule_id: rule.id.clone(),
            name: rule.name.clone(),
            level: rule.level,
            matched_count: 0,
            elapsed,
            result: RuleResult::Failed(error),
        }
    }

    /// Rule id.
    #[must_use]
    pub fn rule_id(&self) -> &RuleId {
        &self.rule_id
    }

    /// Rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rule level.
    #[must_use]
    pub fn level(&self) -> RuleLevel {
        self.level
    }

    /// Distinct matches stored; zero on failure.
    #[must_use]
    pub fn matched_count(&self) -> u64 {
        self.matched_count
    }

    /// Time spent, up to the failure point on failure.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The evaluation result.
    #[must_use]
    pub fn result(&self) -> &RuleResult {
        &self.result
    }

    /// Returns true if the rule was evaluated successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.result, RuleResult::Matched(_))
    }

    /// Match relation of a successful rule.
    ///
    /// The handle outlives its relation: a run drops match relations after
    /// aggregation unless they are retained, and scanning a dropped handle
    /// fails with a read error.
    #[must_use]
    pub fn relation(&self) -> Option<&RelationHandle> {
        match &self.result {
            RuleResult::Matched(handle) => Some(handle),
            RuleResult::Failed(_) => None,
        }
    }

    /// Failure of an unsuccessful rule.
    #[must_use]
    pub fn error(&self) -> Option<&RuleExecutionError> {
        match &self.result {
            RuleResult::Matched(_) => None,
            RuleResult::Failed(e) => Some(e),
        }
    }

    /// Failure message of an unsuccessful rule.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.error().map(ToString::to_string)
    }

    /// Serializable summary.
    #[must_use]
    pub fn summary(&self) -> OutcomeSummary {
        OutcomeSummary {
            rule_id: self.rule_id.to_string(),
            name: self.name.clone(),
            level: self.level,
            matched_count: self.matched_count,
            elapsed_time_seconds: self.elapsed.as_secs_f64(),
            success: self.is_success(),
            error_message: self.error_message(),
        }
    }
}

fn match_select(level: RuleLevel, fragment: &str) -> String {
    let fragment = fragment.trim().trim_end_matches(';');
    match level {
        RuleLevel::Entity => format!(
            "SELECT DISTINCT TRIM(CAST(m.entity_id AS TEXT)) \
             FROM ({fragment}) AS m \
             WHERE m.entity_id IS NOT NULL"
        ),
        RuleLevel::EntityAttribute => format!(
            "SELECT DISTINCT \
                 TRIM(CAST(m.entity_id AS TEXT)), \
                 TRIM(CAST(m.attribute_value AS TEXT)), \
                 TRIM(CAST(m.entity_id AS TEXT)) || '{COMPOSITE_KEY_SEPARATOR}' || TRIM(CAST(m.attribute_value AS TEXT)) \
             FROM ({fragment}) AS m \
             WHERE m.entity_id IS NOT NULL AND m.attribute_value IS NOT NULL"
        ),
    }
}

fn match_schema(level: RuleLevel) -> (RelationSchema, &'static [&'static str]) {
    match level {
        RuleLevel::Entity => (RelationSchema::new().text("entity_id"), &["entity_id"][..]),
        RuleLevel::EntityAttribute => (
            RelationSchema::new()
                .text("entity_id")
                .text("attribute_value")
                .text("composite_key"),
            &["entity_id", "attribute_value"][..],
        ),
    }
}

/// Evaluates rules against a provisioned base population.
#[derive(Debug, Clone, Copy)]
pub struct RuleEvaluator<'a> {
    storage: &'a WorkingStorage,
}

impl<'a> RuleEvaluator<'a> {
    /// Creates an evaluator on the given storage.
    #[must_use]
    pub fn new(storage: &'a WorkingStorage) -> Self {
        Self { storage }
    }

    /// Evaluates one rule.
    ///
    /// Rendering, materialization and counting failures produce a failed
    /// outcome. Only a failure to allocate the match relation is returned
    /// as an error, since it means the session itself is unusable.
    pub fn evaluate(&self, rule: &Rule, population: &BasePopulation) -> SuppressResult<RuleOutcome> {
        info!(rule_id = %rule.id, name = %rule.name, level = %rule.level, "executing rule");
        let start = Instant::now();

        let (schema, key) = match_schema(rule.level);
        let handle = self
            .storage
            .create(&format!("rule_{}", rule.id), schema, Some(key))?;

        match self.materialize(rule, population, &handle) {
            Ok(count) => {
                let elapsed = start.elapsed();
                info!(
                    rule_id = %rule.id,
                    matched = count,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "rule completed"
                );
                Ok(RuleOutcome::matched(rule, handle, count, elapsed))
            }
            Err(error) => {
                warn!(rule_id = %rule.id, error = %error, "rule failed");
                self.storage.drop_relation(&handle);
                Ok(RuleOutcome::failed(rule, error, start.elapsed()))
            }
        }
    }

    fn materialize(
        &self,
        rule: &Rule,
        population: &BasePopulation,
        handle: &RelationHandle,
    ) -> Result<u64, RuleExecutionError> {
        let fragment = rule
            .predicate
            .render(&population.bindings())
            .map_err(|slot| RuleExecutionError::UnboundSlot {
                slot: slot.name().to_string(),
            })?;

        let backend = self
            .storage
            .backend()
            .map_err(|e| RuleExecutionError::Materialize { reason: e.to_string() })?;
        let columns = handle.schema().column_names();
        backend
            .insert_from_query(handle.name(), &columns, &match_select(rule.level, &fragment))
            .map_err(|e| RuleExecutionError::Materialize { reason: e.to_string() })?;

        self.storage
            .count(handle)
            .map_err(|e| RuleExecutionError::Count { reason: e.to_string() })
    }

    /// Evaluates every catalog rule in ascending id order, one at a time.
    pub fn evaluate_all(
        &self,
        catalog: &RuleCatalog,
        population: &BasePopulation,
    ) -> SuppressResult<Vec<RuleOutcome>> {
        info!(rules = catalog.len(), "executing suppression rules");
        let mut outcomes = Vec::with_capacity(catalog.len());
        for rule in catalog.iter() {
            outcomes.push(self.evaluate(rule, population)?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{RawRuleDefinition, RawRuleSet};
    use crate::population::{PopulationLoader, PopulationRecord};
    use crate::session::Session;
    use crate::storage::SqliteBackend;

    fn storage() -> WorkingStorage {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        WorkingStorage::new(Arc::new(Session::new(backend)))
    }

    fn population(ws: &WorkingStorage) -> BasePopulation {
        PopulationLoader::new(ws)
            .provision(&[
                PopulationRecord::new("A", "x"),
                PopulationRecord::new("A", "y"),
                PopulationRecord::new("B", "x"),
            ])
            .unwrap()
    }

    fn catalog(rules: &[(&str, &str, &str)]) -> RuleCatalog {
        let raw: RawRuleSet = rules
            .iter()
            .map(|(id, level, sql)| {
                ((*id).to_string(), RawRuleDefinition::new(*id, "test rule", *sql, *level))
            })
            .collect();
        RuleCatalog::load(&raw).unwrap()
    }

    #[test]
    fn test_entity_rule_matches() {
        let ws = storage();
        let pop = population(&ws);
        let cat = catalog(&[(
            "r1",
            "entity",
            "SELECT entity_id FROM {entity_universe} WHERE entity_id = 'A';",
        )]);
        let outcome = RuleEvaluator::new(&ws).evaluate(cat.iter().next().unwrap(), &pop).unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.matched_count(), 1);
        let handle = outcome.relation().unwrap();
        assert_eq!(handle.schema().column_names(), vec!["entity_id"]);
        assert_eq!(ws.scan(handle, &["entity_id"]).unwrap(), vec![vec![Some("A".to_string())]]);
    }

    #[test]
    fn test_attribute_rule_builds_composite_key() {
        let ws = storage();
        let pop = population(&ws);
        let cat = catalog(&[(
            "r2",
            "entity_attribute",
            "SELECT entity_id, attribute_value FROM {base_combinations} WHERE entity_id = 'B'",
        )]);
        let outcome = RuleEvaluator::new(&ws).evaluate(cat.iter().next().unwrap(), &pop).unwrap();

        assert_eq!(outcome.matched_count(), 1);
        let rows = ws.scan(outcome.relation().unwrap(), &["composite_key"]).unwrap();
        assert_eq!(rows, vec![vec![Some("B-x".to_string())]]);
    }

    #[test]
    fn test_attribute_rule_skips_null_attributes() {
        let ws = storage();
        let pop = population(&ws);
        let cat = catalog(&[(
            "r2",
            "entity_attribute",
            "SELECT entity_id, NULL AS attribute_value FROM {entity_universe}",
        )]);
        let outcome = RuleEvaluator::new(&ws).evaluate(cat.iter().next().unwrap(), &pop).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.matched_count(), 0);
    }

    #[test]
    fn test_failing_rule_is_recorded_not_raised() {
        let ws = storage();
        let pop = population(&ws);
        let cat = catalog(&[("r3", "entity", "SELECT entity_id FROM no_such_table")]);
        let outcome = RuleEvaluator::new(&ws).evaluate(cat.iter().next().unwrap(), &pop).unwrap();

        assert!(!outcome.is_success());
        assert_eq!(outcome.matched_count(), 0);
        assert!(outcome.relation().is_none());
        let msg = outcome.error_message().unwrap();
        assert!(msg.contains("no_such_table"), "{msg}");

        // The partial relation was released; only the population remains.
        assert_eq!(ws.tracked().len(), 2);
    }

    #[test]
    fn test_evaluate_all_continues_after_failure() {
        let ws = storage();
        let pop = population(&ws);
        let cat = catalog(&[
            ("r1", "entity", "SELECT entity_id FROM {entity_universe} WHERE entity_id = 'A'"),
            ("r2", "entity", "SELECT missing_column FROM {entity_universe}"),
            ("r3", "entity", "SELECT entity_id FROM {entity_universe}"),
        ]);
        let outcomes = RuleEvaluator::new(&ws).evaluate_all(&cat, &pop).unwrap();

        let status: Vec<(&str, bool)> = outcomes
            .iter()
            .map(|o| (o.rule_id().as_str(), o.is_success()))
            .collect();
        assert_eq!(status, vec![("r1", true), ("r2", false), ("r3", true)]);
        assert_eq!(outcomes[2].matched_count(), 2);
    }

    #[test]
    fn test_summary_shape() {
        let ws = storage();
        let pop = population(&ws);
        let cat = catalog(&[("r9", "entity", "SELECT nope FROM nowhere")]);
        let outcome = RuleEvaluator::new(&ws).evaluate(cat.iter().next().unwrap(), &pop).unwrap();

        let summary = outcome.summary();
        assert_eq!(summary.rule_id, "r9");
        assert!(!summary.success);
        assert!(summary.elapsed_time_seconds >= 0.0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["level"], "entity");
        assert!(json["error_message"].is_string());
    }

    #[test]
    fn test_closed_session_is_fatal() {
        let ws = storage();
        let pop = population(&ws);
        let cat = catalog(&[("r1", "entity", "SELECT entity_id FROM {entity_universe}")]);
        ws.session().teardown();

        let err = RuleEvaluator::new(&ws)
            .evaluate(cat.iter().next().unwrap(), &pop)
            .unwrap_err();
        assert!(err.is_resource());
    }
}
