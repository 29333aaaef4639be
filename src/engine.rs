//! Run orchestration.
//!
//! A [`SuppressionEngine`] owns the working storage of one run on a shared
//! session. A run provisions the base population, evaluates every rule,
//! builds the master relation and computes statistics. Teardown is a
//! separate, explicit step so callers can read relations in between.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregation::{AggregationEngine, MasterRelation};
use crate::catalog::RuleCatalog;
use crate::error::{ConfigurationError, SuppressResult};
use crate::evaluator::{OutcomeSummary, RuleEvaluator, RuleOutcome};
use crate::population::{BasePopulation, PopulationLoader, PopulationRecord};
use crate::rule::RuleId;
use crate::session::{ComponentLease, Session};
use crate::statistics::{CombinationCount, RuleImpact, Statistics, StatisticsCalculator};
use crate::working::{TeardownReport, WorkingStorage};

/// Component name the engine registers on its session.
pub const ENGINE_COMPONENT: &str = "suppression_engine";

/// Engine behavior switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Regex every entity id must match.
    pub entity_id_pattern: Option<String>,
    /// Keep rule match relations after aggregation.
    pub retain_match_relations: bool,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Unique run id.
    pub run_id: Uuid,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Fingerprint of the enabled rule set.
    pub rule_set_fingerprint: String,
    /// One outcome per evaluated rule, in evaluation order.
    ///
    /// Match relation handles stay readable only when
    /// `match_relations_retained` is set; otherwise they were dropped after
    /// aggregation.
    pub outcomes: Vec<RuleOutcome>,
    /// Whether the match relations outlived the run.
    pub match_relations_retained: bool,
    /// The master relation.
    pub master: MasterRelation,
    /// Master relation statistics.
    pub statistics: Statistics,
    /// Per-rule impact.
    pub rule_impact: Vec<RuleImpact>,
    /// Combination breakdown.
    pub combinations: Vec<CombinationCount>,
}

/// Serializable view of a [`RunReport`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique run id.
    pub run_id: Uuid,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Fingerprint of the enabled rule set.
    pub rule_set_fingerprint: String,
    /// Master relation name.
    pub master_relation: String,
    /// Per-rule outcomes.
    pub outcomes: Vec<OutcomeSummary>,
    /// Master relation statistics.
    pub statistics: Statistics,
    /// Per-rule impact.
    pub rule_impact: Vec<RuleImpact>,
    /// Combination breakdown.
    pub combinations: Vec<CombinationCount>,
}

impl RunReport {
    /// Outcomes of rules that failed.
    #[must_use]
    pub fn failed_outcomes(&self) -> Vec<&RuleOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success()).collect()
    }

    /// Ids of rules that took part in aggregation.
    #[must_use]
    pub fn succeeded_rule_ids(&self) -> Vec<&RuleId> {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(RuleOutcome::rule_id)
            .collect()
    }

    /// Returns true if every rule succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(RuleOutcome::is_success)
    }

    /// Wall time of the run in seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let millis = (self.finished_at - self.started_at).num_milliseconds() as f64;
        millis / 1000.0
    }

    /// Serializable summary.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            rule_set_fingerprint: self.rule_set_fingerprint.clone(),
            master_relation: self.master.handle().name().to_string(),
            outcomes: self.outcomes.iter().map(RuleOutcome::summary).collect(),
            statistics: self.statistics,
            rule_impact: self.rule_impact.clone(),
            combinations: self.combinations.clone(),
        }
    }
}

/// Runs suppression rule sets against base populations.
#[derive(Debug)]
pub struct SuppressionEngine {
    storage: WorkingStorage,
    options: EngineOptions,
    _lease: ComponentLease,
}

impl SuppressionEngine {
    /// Creates an engine and registers it on the session.
    ///
    /// # Errors
    /// `InvalidEntityPattern` if the configured pattern does not compile.
    pub fn new(session: Arc<Session>, options: EngineOptions) -> SuppressResult<Self> {
        if let Some(pattern) = &options.entity_id_pattern {
            regex::Regex::new(pattern).map_err(|e| ConfigurationError::InvalidEntityPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        let lease = session.lease(ENGINE_COMPONENT)?;
        info!(session = %session.id(), "suppression engine registered");
        Ok(Self {
            storage: WorkingStorage::new(session),
            options,
            _lease: lease,
        })
    }

    /// The engine's working storage.
    #[must_use]
    pub fn storage(&self) -> &WorkingStorage {
        &self.storage
    }

    /// The engine's options.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn loader(&self) -> SuppressResult<PopulationLoader<'_>> {
        let loader = PopulationLoader::new(&self.storage);
        Ok(match &self.options.entity_id_pattern {
            Some(pattern) => loader.with_entity_pattern(pattern)?,
            None => loader,
        })
    }

    /// Validates and provisions a base population from records.
    pub fn load_population(&self, records: &[PopulationRecord]) -> SuppressResult<BasePopulation> {
        self.loader()?.provision(records)
    }

    /// Provisions a base population from a select over the backend.
    pub fn load_population_from_query(&self, select: &str) -> SuppressResult<BasePopulation> {
        self.loader()?.provision_from_query(select)
    }

    /// Provisions `records` and runs `catalog` against them.
    pub fn run(&self, catalog: &RuleCatalog, records: &[PopulationRecord]) -> SuppressResult<RunReport> {
        let population = self.load_population(records)?;
        self.run_on(catalog, &population)
    }

    /// Runs `catalog` against an already provisioned population.
    ///
    /// Rule failures are reported in the outcomes. Allocation and
    /// aggregation failures end the run; call [`Self::teardown`] either way.
    pub fn run_on(&self, catalog: &RuleCatalog, population: &BasePopulation) -> SuppressResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let rule_set_fingerprint = catalog.fingerprint();
        info!(
            run_id = %run_id,
            rules = catalog.len(),
            disabled = catalog.disabled().len(),
            records = population.record_count(),
            "starting suppression run"
        );

        let outcomes = RuleEvaluator::new(&self.storage).evaluate_all(catalog, population)?;
        for failed in outcomes.iter().filter(|o| !o.is_success()) {
            warn!(
                rule_id = %failed.rule_id(),
                error = %failed.error_message().unwrap_or_default(),
                "rule excluded from aggregation"
            );
        }

        let master = AggregationEngine::new(&self.storage)
            .build_master(population, &outcomes)
            .inspect_err(|e| error!(run_id = %run_id, error = %e, "aggregation failed"))?;
        let calculator = StatisticsCalculator::new(&self.storage);
        let stats = calculator.summarize(&master)?;
        let rule_impact = calculator.rule_impact(&master, &outcomes)?;
        let combinations = calculator.combination_breakdown(&master)?;

        let match_relations_retained = self.options.retain_match_relations;
        if !match_relations_retained {
            for handle in outcomes.iter().filter_map(RuleOutcome::relation) {
                self.storage.drop_relation(handle);
            }
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            rule_set_fingerprint,
            outcomes,
            match_relations_retained,
            master,
            statistics: stats,
            rule_impact,
            combinations,
        };
        info!(
            run_id = %run_id,
            succeeded = report.succeeded_rule_ids().len(),
            failed = report.failed_outcomes().len(),
            total_records = stats.total_records,
            suppressed_records = stats.suppressed_records,
            unsuppressed_records = stats.unsuppressed_records,
            "suppression run completed"
        );
        Ok(report)
    }

    /// Drops every working relation and unregisters from the session.
    pub fn teardown(self) -> TeardownReport {
        let report = self.storage.drop_all();
        if report.is_clean() {
            info!(dropped = report.dropped.len(), "suppression engine torn down");
        } else {
            warn!(
                dropped = report.dropped.len(),
                failed = report.failed.len(),
                "suppression engine teardown left relations behind"
            );
        }
        report
    }
}
