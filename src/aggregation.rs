//! Master relation construction.
//!
//! Joins every composite key of the base population against the match
//! relations of the successfully evaluated rules inside the store. The wide
//! `rule_<id>_flag` layout exists only in the persisted master relation;
//! records read back hold their flags as a map keyed by rule id.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::AggregationError;
use crate::evaluator::RuleOutcome;
use crate::population::BasePopulation;
use crate::rule::{RuleId, RuleLevel};
use crate::storage::RelationSchema;
use crate::working::{RelationHandle, WorkingStorage};

/// Flag value for a set flag.
pub const FLAG_YES: &str = "yes";
/// Flag value for a clear flag.
pub const FLAG_NO: &str = "no";
/// Separator between per-rule flag values in a combination key.
pub const COMBINATION_SEPARATOR: &str = "-";
/// Combination key of every record when no rule succeeded.
pub const NO_RULES_SENTINEL: &str = "no_rules";

/// Textual form of a flag.
#[must_use]
pub const fn flag_text(value: bool) -> &'static str {
    if value {
        FLAG_YES
    } else {
        FLAG_NO
    }
}

pub(crate) fn parse_flag(raw: Option<&str>) -> Option<bool> {
    match raw {
        Some(FLAG_YES) => Some(true),
        Some(FLAG_NO) => Some(false),
        _ => None,
    }
}

/// Builds the combination key from per-rule flags, in ascending rule id
/// order.
#[must_use]
pub fn combination_key(flags: &BTreeMap<RuleId, bool>) -> String {
    if flags.is_empty() {
        return NO_RULES_SENTINEL.to_string();
    }
    flags
        .values()
        .map(|v| flag_text(*v))
        .collect::<Vec<_>>()
        .join(COMBINATION_SEPARATOR)
}

/// One composite key of the base population with its rule flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRecord {
    /// Entity identifier.
    pub entity_id: String,
    /// Attribute value, if the record has one.
    pub attribute_value: Option<String>,
    /// `entity-attribute`, or the entity id alone.
    pub composite_key: String,
    /// Flag values joined in ascending rule id order.
    pub combination_key: String,
    /// Any active rule matched.
    pub suppressed: bool,
    /// No active rule matched.
    pub unsuppressed: bool,
    /// Match flag per active rule.
    pub flags: BTreeMap<RuleId, bool>,
}

impl MasterRecord {
    /// Derives the combination key and both suppression flags from `flags`.
    #[must_use]
    pub fn new(
        entity_id: String,
        attribute_value: Option<String>,
        composite_key: String,
        flags: BTreeMap<RuleId, bool>,
    ) -> Self {
        let suppressed = flags.values().any(|v| *v);
        let unsuppressed = flags.values().all(|v| !*v);
        Self {
            entity_id,
            attribute_value,
            composite_key,
            combination_key: combination_key(&flags),
            suppressed,
            unsuppressed,
            flags,
        }
    }

    /// Flag for one rule, if it was active.
    #[must_use]
    pub fn flag(&self, rule_id: &RuleId) -> Option<bool> {
        self.flags.get(rule_id).copied()
    }
}

/// An active rule as recorded on the master relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRule {
    /// Rule id.
    pub rule_id: RuleId,
    /// Rule level.
    pub level: RuleLevel,
}

/// The persisted master relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRelation {
    handle: RelationHandle,
    active_rules: Vec<ActiveRule>,
    record_count: u64,
}

impl MasterRelation {
    /// Backing working relation.
    #[must_use]
    pub fn handle(&self) -> &RelationHandle {
        &self.handle
    }

    /// Rules with a flag column, ascending by id.
    #[must_use]
    pub fn active_rules(&self) -> &[ActiveRule] {
        &self.active_rules
    }

    /// Ids of the rules with a flag column, ascending.
    #[must_use]
    pub fn active_rule_ids(&self) -> Vec<&RuleId> {
        self.active_rules.iter().map(|r| &r.rule_id).collect()
    }

    /// Rows written.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Column names in persisted order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.handle.schema().column_names()
    }

    /// Reads every record back, ordered by composite key.
    ///
    /// # Errors
    /// `Read` if the relation cannot be scanned, `MalformedRow` if a row does
    /// not fit the master layout.
    pub fn records(&self, storage: &WorkingStorage) -> Result<Vec<MasterRecord>, AggregationError> {
        let columns = self.column_names();
        let rows = storage
            .scan(&self.handle, &columns)
            .map_err(|e| AggregationError::Read {
                relation: self.handle.name().to_string(),
                reason: e.to_string(),
            })?;

        let malformed = |reason: String| AggregationError::MalformedRow {
            relation: self.handle.name().to_string(),
            reason,
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != columns.len() {
                return Err(malformed(format!("expected {} columns, got {}", columns.len(), row.len())));
            }
            let mut cells = row.into_iter();
            let mut next = || cells.next().flatten();
            let entity_id = next().ok_or_else(|| malformed("missing entity_id".to_string()))?;
            let attribute_value = next();
            let composite_key = next().ok_or_else(|| malformed("missing composite_key".to_string()))?;
            let combination_key = next().ok_or_else(|| malformed("missing combination_key".to_string()))?;
            let suppressed = parse_flag(next().as_deref())
                .ok_or_else(|| malformed("bad suppression_flag".to_string()))?;
            let unsuppressed = parse_flag(next().as_deref())
                .ok_or_else(|| malformed("bad unsuppression_flag".to_string()))?;

            let mut flags = BTreeMap::new();
            for rule in &self.active_rules {
                let value = parse_flag(next().as_deref())
                    .ok_or_else(|| malformed(format!("bad {}", rule.rule_id.flag_column())))?;
                flags.insert(rule.rule_id.clone(), value);
            }

            records.push(MasterRecord {
                entity_id,
                attribute_value,
                composite_key,
                combination_key,
                suppressed,
                unsuppressed,
                flags,
            });
        }
        records.sort_by(|a, b| a.composite_key.cmp(&b.composite_key));
        Ok(records)
    }
}

fn hit_flag(hit: &str) -> String {
    format!("CASE WHEN {hit} THEN '{FLAG_YES}' ELSE '{FLAG_NO}' END")
}

fn join_condition(alias: &str, level: RuleLevel) -> String {
    match level {
        RuleLevel::Entity => format!("{alias}.entity_id = b.entity_id"),
        RuleLevel::EntityAttribute => format!(
            "{alias}.entity_id = b.entity_id AND {alias}.attribute_value = b.attribute_value"
        ),
    }
}

/// Select producing master rows in [`master_schema`] column order.
///
/// Every match relation is keyed on its join columns, so each left join
/// contributes at most one row per composite key. A NULL base attribute
/// never equals anything and so never matches an entity-attribute rule.
fn master_select(base: &RelationHandle, active: &BTreeMap<RuleId, (RuleLevel, &RelationHandle)>) -> String {
    let mut joins = Vec::with_capacity(active.len());
    let mut hits = Vec::with_capacity(active.len());
    for (idx, (level, handle)) in active.values().enumerate() {
        let alias = format!("m{idx}");
        joins.push(format!(
            "LEFT JOIN {} AS {alias} ON {}",
            handle.name(),
            join_condition(&alias, *level)
        ));
        hits.push(format!("{alias}.entity_id IS NOT NULL"));
    }

    let (combination, suppressed, unsuppressed) = if hits.is_empty() {
        (
            format!("'{NO_RULES_SENTINEL}'"),
            format!("'{FLAG_NO}'"),
            format!("'{FLAG_YES}'"),
        )
    } else {
        let any = hits.join(" OR ");
        (
            hits.iter()
                .map(|hit| hit_flag(hit))
                .collect::<Vec<_>>()
                .join(&format!(" || '{COMBINATION_SEPARATOR}' || ")),
            hit_flag(&any),
            hit_flag(&format!("NOT ({any})")),
        )
    };

    let mut columns = vec![
        "b.entity_id AS entity_id".to_string(),
        "b.attribute_value AS attribute_value".to_string(),
        "b.composite_key AS composite_key".to_string(),
        format!("{combination} AS combination_key"),
        format!("{suppressed} AS suppression_flag"),
        format!("{unsuppressed} AS unsuppression_flag"),
    ];
    for (rule_id, hit) in active.keys().zip(&hits) {
        columns.push(format!("{} AS {}", hit_flag(hit), rule_id.flag_column()));
    }

    let mut sql = format!("SELECT {} FROM {} AS b", columns.join(", "), base.name());
    for join in joins {
        sql.push(' ');
        sql.push_str(&join);
    }
    sql
}

fn master_schema(active_rules: &[ActiveRule]) -> RelationSchema {
    let mut schema = RelationSchema::new()
        .text("entity_id")
        .text("attribute_value")
        .text("composite_key")
        .text("combination_key")
        .flag("suppression_flag")
        .flag("unsuppression_flag");
    for rule in active_rules {
        schema = schema.flag(rule.rule_id.flag_column());
    }
    schema
}

/// Builds master relations.
#[derive(Debug, Clone, Copy)]
pub struct AggregationEngine<'a> {
    storage: &'a WorkingStorage,
}

impl<'a> AggregationEngine<'a> {
    /// Creates an aggregation engine on the given storage.
    #[must_use]
    pub fn new(storage: &'a WorkingStorage) -> Self {
        Self { storage }
    }

    /// Builds and persists the master relation with one insert-select that
    /// left joins the base combinations against every active match relation.
    ///
    /// Failed outcomes are ignored. Successful outcomes are applied in
    /// ascending rule id order whatever order they arrive in.
    ///
    /// # Errors
    /// Any failure. A partially written master relation is dropped first.
    pub fn build_master(
        &self,
        population: &BasePopulation,
        outcomes: &[RuleOutcome],
    ) -> Result<MasterRelation, AggregationError> {
        let active = active_outcomes(outcomes)?;
        info!(
            active_rules = active.len(),
            failed_rules = outcomes.len() - active.len(),
            "building master relation"
        );

        let active_rules: Vec<ActiveRule> = active
            .iter()
            .map(|(rule_id, (level, _))| ActiveRule {
                rule_id: rule_id.clone(),
                level: *level,
            })
            .collect();

        let handle = self
            .storage
            .create(
                "master_suppression",
                master_schema(&active_rules),
                Some(&["entity_id", "attribute_value"]),
            )
            .map_err(|e| AggregationError::Persist { reason: e.to_string() })?;

        let select = master_select(population.combinations(), &active);
        let written = self
            .storage
            .insert_from_query(&handle, &select)
            .and_then(|_| self.storage.count(&handle));
        match written {
            Ok(record_count) => {
                debug!(relation = handle.name(), records = record_count, "master relation persisted");
                Ok(MasterRelation {
                    handle,
                    active_rules,
                    record_count,
                })
            }
            Err(e) => {
                warn!(relation = handle.name(), error = %e, "discarding partial master relation");
                self.storage.drop_relation(&handle);
                Err(AggregationError::Persist { reason: e.to_string() })
            }
        }
    }
}

/// Successful outcomes keyed (and so sorted) by rule id.
fn active_outcomes(
    outcomes: &[RuleOutcome],
) -> Result<BTreeMap<RuleId, (RuleLevel, &RelationHandle)>, AggregationError> {
    let mut active = BTreeMap::new();
    for outcome in outcomes {
        let Some(handle) = outcome.relation() else {
            continue;
        };
        if active
            .insert(outcome.rule_id().clone(), (outcome.level(), handle))
            .is_some()
        {
            return Err(AggregationError::DuplicateOutcome {
                rule_id: outcome.rule_id().to_string(),
            });
        }
    }
    Ok(active)
}
