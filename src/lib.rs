//! # Suppression Engine - Rule Execution and Aggregation
//!
//! Evaluates a catalog of membership rules against a population of
//! `(entity, attribute)` records and combines the per-rule matches into one
//! master relation with a suppression flag per record.
//!
//! ## Core Concepts
//!
//! - **Session**: A backend connection shared by the components of a run
//! - **WorkingStorage**: Owner of every ephemeral relation a run creates
//! - **Rule**: A predicate over the base population at entity or entity-attribute level
//! - **RuleOutcome**: The result of evaluating one rule, success or failure
//! - **MasterRelation**: One record per composite key with per-rule flags and a combination key
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use suppression_engine::{EngineConfig, Session, SqliteBackend, SuppressionEngine, PopulationRecord};
//!
//! let config = EngineConfig::from_path("rules.json")?;
//! let session = Arc::new(Session::new(Arc::new(SqliteBackend::open("warehouse.db")?)));
//! let engine = SuppressionEngine::new(session.clone(), config.engine_options())?;
//!
//! let report = engine.run(&config.catalog()?, &[PopulationRecord::new("1234567890", "Cardiology")])?;
//! for failed in report.failed_outcomes() {
//!     eprintln!("{}: {}", failed.rule_id(), failed.error_message().unwrap_or_default());
//! }
//! println!("{} of {} records suppressed", report.statistics.suppressed_records, report.statistics.total_records);
//!
//! engine.teardown();
//! session.teardown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Storage and session
pub mod error;
pub mod session;
pub mod storage;
pub mod working;

// Rules and population
pub mod catalog;
pub mod config;
pub mod population;
pub mod rule;

// Run stages
pub mod aggregation;
pub mod engine;
pub mod evaluator;
pub mod statistics;

pub use aggregation::{AggregationEngine, MasterRecord, MasterRelation, NO_RULES_SENTINEL};
pub use catalog::{RawRuleDefinition, RawRuleSet, RuleCatalog};
pub use config::EngineConfig;
pub use engine::{EngineOptions, RunReport, RunSummary, SuppressionEngine};
pub use error::{
	AggregationError, ConfigurationError, ResourceError, RuleExecutionError, SuppressError,
	SuppressResult, ValidationError,
};
pub use evaluator::{OutcomeSummary, RuleEvaluator, RuleOutcome, RuleResult};
pub use population::{BasePopulation, PopulationLoader, PopulationRecord};
pub use rule::{PredicateTemplate, Rule, RuleId, RuleLevel};
pub use session::{ComponentLease, Session, SessionInfo};
pub use statistics::{CombinationCount, RuleImpact, Statistics, StatisticsCalculator};
pub use storage::{RelationSchema, SessionBackend, SqliteBackend, StorageError};
pub use working::{RelationHandle, TeardownReport, WorkingStorage};
