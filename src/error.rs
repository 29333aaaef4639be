//! Error types for the suppression engine.
//!
//! Every failure class of a run is a distinct thiserror enum so callers can
//! match on the stage that failed. `SuppressError` wraps them for propagation.
//!
//! Only [`RuleExecutionError`] is recoverable: it is recorded inside a
//! `RuleOutcome` and the run continues with the remaining rules.

use thiserror::Error;

/// Malformed rule definitions or engine configuration.
///
/// Detected before any working relation is created; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Rule '{rule_id}' is missing required field '{field}'")]
    MissingField {
        rule_id: String,
        field: String,
    },

    #[error("Rule '{rule_id}' has invalid field '{field}': {reason}")]
    InvalidField {
        rule_id: String,
        field: String,
        reason: String,
    },

    #[error("Rule '{rule_id}' has invalid level '{value}' (expected 'entity' or 'entity_attribute')")]
    InvalidLevel {
        rule_id: String,
        value: String,
    },

    #[error("Rule id '{rule_id}' is defined more than once")]
    DuplicateRuleId {
        rule_id: String,
    },

    #[error("Rule id '{rule_id}' differs from '{existing}' only by letter case")]
    RuleIdCaseCollision {
        rule_id: String,
        existing: String,
    },

    #[error("Rule id '{rule_id}' must be non-empty and contain only ASCII letters, digits and '_'")]
    InvalidRuleId {
        rule_id: String,
    },

    #[error("Rule '{rule_id}' references unknown placeholder '{{{placeholder}}}'")]
    UnknownPlaceholder {
        rule_id: String,
        placeholder: String,
    },

    #[error("Invalid entity id pattern '{pattern}': {reason}")]
    InvalidEntityPattern {
        pattern: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse {
        reason: String,
    },

    #[error("Failed to read configuration from {path}: {reason}")]
    Io {
        path: String,
        reason: String,
    },
}

/// Malformed or empty base population, or invalid session usage.
///
/// Fatal before any rule evaluation begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Base population is empty")]
    EmptyPopulation,

    #[error("Population record {row} has an empty entity id")]
    MissingEntityId {
        row: usize,
    },

    #[error("Population record {row} has malformed entity id '{value}'")]
    MalformedEntityId {
        row: usize,
        value: String,
    },

    #[error("Population query must return columns {expected:?}, got {actual} column(s)")]
    PopulationShape {
        expected: Vec<String>,
        actual: usize,
    },

    #[error("Population query failed: {reason}")]
    PopulationQuery {
        reason: String,
    },

    #[error("Component name cannot be empty")]
    InvalidComponentName,
}

/// Failure while evaluating a single rule.
///
/// Never propagated out of a run: it is stored in the rule's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleExecutionError {
    #[error("Placeholder '{{{slot}}}' has no bound relation")]
    UnboundSlot {
        slot: String,
    },

    #[error("Failed to materialize matches: {reason}")]
    Materialize {
        reason: String,
    },

    #[error("Failed to count matches: {reason}")]
    Count {
        reason: String,
    },
}

/// Working-storage allocation and access failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Failed to allocate working relation '{name}': {reason}")]
    AllocationFailed {
        name: String,
        reason: String,
    },

    #[error("Failed to populate working relation '{name}': {reason}")]
    WriteFailed {
        name: String,
        reason: String,
    },

    #[error("Failed to read working relation '{name}': {reason}")]
    ReadFailed {
        name: String,
        reason: String,
    },

    #[error("Session has been torn down")]
    SessionClosed,
}

/// Failure while building the master relation.
///
/// No partial master relation is valid once this is raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("Rule '{rule_id}' appears in more than one successful outcome")]
    DuplicateOutcome {
        rule_id: String,
    },

    #[error("Failed to read relation '{relation}': {reason}")]
    Read {
        relation: String,
        reason: String,
    },

    #[error("Relation '{relation}' contains a malformed row: {reason}")]
    MalformedRow {
        relation: String,
        reason: String,
    },

    #[error("Failed to persist master relation: {reason}")]
    Persist {
        reason: String,
    },
}

/// Top-level error type for a suppression run.
#[derive(Debug, Error)]
pub enum SuppressError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SuppressError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a resource error.
    #[must_use]
    pub const fn is_resource(&self) -> bool {
        matches!(self, Self::Resource(_))
    }

    /// Returns true if this is an aggregation error.
    #[must_use]
    pub const fn is_aggregation(&self) -> bool {
        matches!(self, Self::Aggregation(_))
    }

    /// Returns true if this error was raised before any working relation
    /// could have been created.
    #[must_use]
    pub const fn is_pre_execution(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Validation(_))
    }
}

/// Result type alias for engine operations.
pub type SuppressResult<T> = Result<T, SuppressError>;
