//! Run statistics and reports over the master relation.

use std::collections::{BTreeMap, BTreeSet};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::aggregation::{parse_flag, ActiveRule, MasterRecord, MasterRelation, FLAG_YES};
use crate::error::AggregationError;
use crate::evaluator::RuleOutcome;
use crate::rule::{RuleId, RuleLevel};
use crate::storage::Row;
use crate::working::WorkingStorage;

fn percentage(count: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let rate = count as f64 / denominator as f64 * 100.0;
    rate
}

/// Record and entity counts of a master relation.
///
/// Entity counts are per-flag set membership: an entity with one suppressed
/// and one unsuppressed record counts towards both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Composite keys in the master relation.
    pub total_records: u64,
    /// Records with `suppression_flag = yes`.
    pub suppressed_records: u64,
    /// Records with `unsuppression_flag = yes`.
    pub unsuppressed_records: u64,
    /// Distinct entities.
    pub unique_entities: u64,
    /// Entities with at least one suppressed record.
    pub suppressed_entities: u64,
    /// Entities with at least one unsuppressed record.
    pub unsuppressed_entities: u64,
}

impl Statistics {
    /// Computes statistics from master records.
    #[must_use]
    pub fn from_records(records: &[MasterRecord]) -> Self {
        let mut entities = BTreeSet::new();
        let mut suppressed_entities = BTreeSet::new();
        let mut unsuppressed_entities = BTreeSet::new();
        let mut stats = Self::default();

        for record in records {
            stats.total_records += 1;
            entities.insert(record.entity_id.as_str());
            if record.suppressed {
                stats.suppressed_records += 1;
                suppressed_entities.insert(record.entity_id.as_str());
            }
            if record.unsuppressed {
                stats.unsuppressed_records += 1;
                unsuppressed_entities.insert(record.entity_id.as_str());
            }
        }

        stats.unique_entities = entities.len() as u64;
        stats.suppressed_entities = suppressed_entities.len() as u64;
        stats.unsuppressed_entities = unsuppressed_entities.len() as u64;
        stats
    }

    /// Percentage of records suppressed.
    #[must_use]
    pub fn record_suppression_rate(&self) -> f64 {
        percentage(self.suppressed_records, self.total_records)
    }

    /// Percentage of records unsuppressed.
    #[must_use]
    pub fn record_unsuppression_rate(&self) -> f64 {
        percentage(self.unsuppressed_records, self.total_records)
    }

    /// Percentage of entities with a suppressed record.
    #[must_use]
    pub fn entity_suppression_rate(&self) -> f64 {
        percentage(self.suppressed_entities, self.unique_entities)
    }

    /// Percentage of entities with an unsuppressed record.
    #[must_use]
    pub fn entity_unsuppression_rate(&self) -> f64 {
        percentage(self.unsuppressed_entities, self.unique_entities)
    }
}

impl Serialize for Statistics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Statistics", 10)?;
        s.serialize_field("total_records", &self.total_records)?;
        s.serialize_field("suppressed_records", &self.suppressed_records)?;
        s.serialize_field("unsuppressed_records", &self.unsuppressed_records)?;
        s.serialize_field("unique_entities", &self.unique_entities)?;
        s.serialize_field("suppressed_entities", &self.suppressed_entities)?;
        s.serialize_field("unsuppressed_entities", &self.unsuppressed_entities)?;
        s.serialize_field("record_suppression_rate", &self.record_suppression_rate())?;
        s.serialize_field("record_unsuppression_rate", &self.record_unsuppression_rate())?;
        s.serialize_field("entity_suppression_rate", &self.entity_suppression_rate())?;
        s.serialize_field("entity_unsuppression_rate", &self.entity_unsuppression_rate())?;
        s.end()
    }
}

/// Evaluation status in a rule impact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    /// The rule has a flag column.
    Success,
    /// The rule failed and was left out.
    Failed,
}

/// Per-rule effect on the master relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleImpact {
    /// Rule id.
    pub rule_id: String,
    /// Rule name.
    pub name: String,
    /// Rule level.
    pub level: RuleLevel,
    /// Master records with this rule's flag set.
    pub records_flagged: u64,
    /// Distinct entities among those records.
    pub entities_flagged: u64,
    /// Rows in the rule's match relation.
    pub matched_count: u64,
    /// Evaluation wall time.
    pub elapsed_time_seconds: f64,
    /// Evaluation status.
    pub status: RuleStatus,
    /// Failure message of a failed rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Records sharing one combination key and suppression flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombinationCount {
    /// Combination key.
    pub combination_key: String,
    /// Suppression flag of the group.
    pub suppressed: bool,
    /// Records in the group.
    pub records: u64,
    /// Distinct entities in the group.
    pub unique_entities: u64,
}

fn yes(column: &str) -> String {
    format!("{column} = '{FLAG_YES}'")
}

fn summary_select(master: &str) -> String {
    let suppressed = yes("suppression_flag");
    let unsuppressed = yes("unsuppression_flag");
    format!(
        "SELECT COUNT(*), \
                SUM(CASE WHEN {suppressed} THEN 1 ELSE 0 END), \
                SUM(CASE WHEN {unsuppressed} THEN 1 ELSE 0 END), \
                COUNT(DISTINCT entity_id), \
                COUNT(DISTINCT CASE WHEN {suppressed} THEN entity_id END), \
                COUNT(DISTINCT CASE WHEN {unsuppressed} THEN entity_id END) \
         FROM {master}"
    )
}

fn impact_select(master: &str, rules: &[ActiveRule]) -> String {
    let columns: Vec<String> = rules
        .iter()
        .map(|rule| {
            let hit = yes(&rule.rule_id.flag_column());
            format!(
                "SUM(CASE WHEN {hit} THEN 1 ELSE 0 END), \
                 COUNT(DISTINCT CASE WHEN {hit} THEN entity_id END)"
            )
        })
        .collect();
    format!("SELECT {} FROM {master}", columns.join(", "))
}

fn breakdown_select(master: &str) -> String {
    format!(
        "SELECT combination_key, suppression_flag, COUNT(*), COUNT(DISTINCT entity_id) \
         FROM {master} \
         GROUP BY combination_key, suppression_flag \
         ORDER BY COUNT(*) DESC, combination_key, suppression_flag"
    )
}

/// Computes statistics and reports for a master relation.
///
/// Every count is an aggregate query against the master relation; no
/// records are read into memory.
#[derive(Debug, Clone, Copy)]
pub struct StatisticsCalculator<'a> {
    storage: &'a WorkingStorage,
}

impl<'a> StatisticsCalculator<'a> {
    /// Creates a calculator on the given storage.
    #[must_use]
    pub fn new(storage: &'a WorkingStorage) -> Self {
        Self { storage }
    }

    fn query(&self, master: &MasterRelation, select: &str) -> Result<Vec<Row>, AggregationError> {
        self.storage
            .query(master.handle(), select)
            .map_err(|e| AggregationError::Read {
                relation: master.handle().name().to_string(),
                reason: e.to_string(),
            })
    }

    /// Summarizes the master relation.
    pub fn summarize(&self, master: &MasterRelation) -> Result<Statistics, AggregationError> {
        let rows = self.query(master, &summary_select(master.handle().name()))?;
        let mut cells = Cells::single(master, rows)?;
        Ok(Statistics {
            total_records: cells.count()?,
            suppressed_records: cells.count()?,
            unsuppressed_records: cells.count()?,
            unique_entities: cells.count()?,
            suppressed_entities: cells.count()?,
            unsuppressed_entities: cells.count()?,
        })
    }

    /// Effect of each evaluated rule, in outcome order.
    pub fn rule_impact(
        &self,
        master: &MasterRelation,
        outcomes: &[RuleOutcome],
    ) -> Result<Vec<RuleImpact>, AggregationError> {
        let mut flagged: BTreeMap<&RuleId, (u64, u64)> = BTreeMap::new();
        let active = master.active_rules();
        if !active.is_empty() {
            let rows = self.query(master, &impact_select(master.handle().name(), active))?;
            let mut cells = Cells::single(master, rows)?;
            for rule in active {
                flagged.insert(&rule.rule_id, (cells.count()?, cells.count()?));
            }
        }

        Ok(outcomes
            .iter()
            .map(|outcome| {
                let (records, entities) = if outcome.is_success() {
                    flagged.get(outcome.rule_id()).copied().unwrap_or_default()
                } else {
                    (0, 0)
                };
                RuleImpact {
                    rule_id: outcome.rule_id().to_string(),
                    name: outcome.name().to_string(),
                    level: outcome.level(),
                    records_flagged: records,
                    entities_flagged: entities,
                    matched_count: outcome.matched_count(),
                    elapsed_time_seconds: outcome.elapsed().as_secs_f64(),
                    status: if outcome.is_success() {
                        RuleStatus::Success
                    } else {
                        RuleStatus::Failed
                    },
                    error_message: outcome.error_message(),
                }
            })
            .collect())
    }

    /// Record counts per combination key and suppression flag, ordered by
    /// record count descending, then combination key.
    pub fn combination_breakdown(
        &self,
        master: &MasterRelation,
    ) -> Result<Vec<CombinationCount>, AggregationError> {
        let rows = self.query(master, &breakdown_select(master.handle().name()))?;
        rows.into_iter()
            .map(|row| -> Result<CombinationCount, AggregationError> {
                let mut cells = Cells::new(master, row);
                let combination_key = cells.text("combination_key")?;
                let suppressed = parse_flag(Some(cells.text("suppression_flag")?.as_str()))
                    .ok_or_else(|| cells.malformed("bad suppression_flag"))?;
                Ok(CombinationCount {
                    combination_key,
                    suppressed,
                    records: cells.count()?,
                    unique_entities: cells.count()?,
                })
            })
            .collect()
    }
}

/// Cursor over the cells of one aggregate row.
struct Cells<'m> {
    master: &'m MasterRelation,
    cells: std::vec::IntoIter<Option<String>>,
}

impl<'m> Cells<'m> {
    fn new(master: &'m MasterRelation, row: Row) -> Self {
        Self {
            master,
            cells: row.into_iter(),
        }
    }

    fn single(master: &'m MasterRelation, rows: Vec<Row>) -> Result<Self, AggregationError> {
        let mut rows = rows.into_iter();
        match (rows.next(), rows.next()) {
            (Some(row), None) => Ok(Self::new(master, row)),
            _ => Err(AggregationError::MalformedRow {
                relation: master.handle().name().to_string(),
                reason: "aggregate query must return exactly one row".to_string(),
            }),
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> AggregationError {
        AggregationError::MalformedRow {
            relation: self.master.handle().name().to_string(),
            reason: reason.into(),
        }
    }

    /// Next cell as a count. `SUM` over no rows is NULL, read as zero.
    fn count(&mut self) -> Result<u64, AggregationError> {
        match self.cells.next() {
            Some(None) => Ok(0),
            Some(Some(text)) => text
                .parse()
                .map_err(|_| self.malformed(format!("non-numeric count '{text}'"))),
            None => Err(self.malformed("aggregate row is too short")),
        }
    }

    fn text(&mut self, column: &str) -> Result<String, AggregationError> {
        self.cells
            .next()
            .flatten()
            .ok_or_else(|| self.malformed(format!("missing {column}")))
    }
}
