//! Base population provisioning.
//!
//! Validates the population before anything is written, then materializes
//! the two relations rule predicates can reference: the distinct entity
//! universe and the full set of composite keys.

use std::collections::BTreeSet;

use regex::Regex;
use tracing::info;

use crate::error::{ConfigurationError, SuppressResult, ValidationError};
use crate::rule::SlotBindings;
use crate::storage::RelationSchema;
use crate::working::{RelationHandle, WorkingStorage};

/// Separator between entity id and attribute value in a composite key.
pub const COMPOSITE_KEY_SEPARATOR: &str = "-";

/// Builds the composite key string of a record.
#[must_use]
pub fn composite_key(entity_id: &str, attribute_value: Option<&str>) -> String {
    match attribute_value {
        Some(attr) => format!("{entity_id}{COMPOSITE_KEY_SEPARATOR}{attr}"),
        None => entity_id.to_string(),
    }
}

/// One input record of the base population.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PopulationRecord {
    /// Entity identifier.
    pub entity_id: String,
    /// Optional secondary dimension.
    pub attribute_value: Option<String>,
}

impl PopulationRecord {
    /// Record keyed by entity and attribute.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, attribute_value: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute_value: Some(attribute_value.into()),
        }
    }

    /// Record without an attribute value.
    #[must_use]
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute_value: None,
        }
    }
}

/// The provisioned base population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasePopulation {
    universe: RelationHandle,
    combinations: RelationHandle,
    entity_count: u64,
    record_count: u64,
}

impl BasePopulation {
    /// Relation of distinct entity ids.
    #[must_use]
    pub fn universe(&self) -> &RelationHandle {
        &self.universe
    }

    /// Relation of composite keys.
    #[must_use]
    pub fn combinations(&self) -> &RelationHandle {
        &self.combinations
    }

    /// Distinct entities.
    #[must_use]
    pub fn entity_count(&self) -> u64 {
        self.entity_count
    }

    /// Distinct composite keys.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Slot bindings for predicate rendering.
    #[must_use]
    pub fn bindings(&self) -> SlotBindings {
        SlotBindings {
            entity_universe: Some(self.universe.name().to_string()),
            base_combinations: Some(self.combinations.name().to_string()),
        }
    }
}

/// Validates and provisions base populations.
#[derive(Debug)]
pub struct PopulationLoader<'a> {
    storage: &'a WorkingStorage,
    entity_pattern: Option<Regex>,
}

impl<'a> PopulationLoader<'a> {
    /// Loader without entity id format checks.
    #[must_use]
    pub fn new(storage: &'a WorkingStorage) -> Self {
        Self {
            storage,
            entity_pattern: None,
        }
    }

    /// Requires every entity id to match `pattern`.
    ///
    /// # Errors
    /// `InvalidEntityPattern` if the pattern does not compile.
    pub fn with_entity_pattern(mut self, pattern: &str) -> Result<Self, ConfigurationError> {
        let re = Regex::new(pattern).map_err(|e| ConfigurationError::InvalidEntityPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.entity_pattern = Some(re);
        Ok(self)
    }

    /// Cleans and validates records: ids and attributes are trimmed, blank
    /// attributes become `None`, exact duplicates collapse.
    ///
    /// # Errors
    /// The first invalid record, or `EmptyPopulation`.
    pub fn validate(&self, records: &[PopulationRecord]) -> Result<BTreeSet<PopulationRecord>, ValidationError> {
        if records.is_empty() {
            return Err(ValidationError::EmptyPopulation);
        }

        let mut cleaned = BTreeSet::new();
        for (row, record) in records.iter().enumerate() {
            let entity_id = record.entity_id.trim();
            if entity_id.is_empty() {
                return Err(ValidationError::MissingEntityId { row });
            }
            if let Some(re) = &self.entity_pattern {
                if !re.is_match(entity_id) {
                    return Err(ValidationError::MalformedEntityId {
                        row,
                        value: entity_id.to_string(),
                    });
                }
            }
            let attribute_value = record
                .attribute_value
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string);
            cleaned.insert(PopulationRecord {
                entity_id: entity_id.to_string(),
                attribute_value,
            });
        }
        Ok(cleaned)
    }

    /// Validates records and creates the universe and combination relations.
    pub fn provision(&self, records: &[PopulationRecord]) -> SuppressResult<BasePopulation> {
        let cleaned = self.validate(records)?;

        let universe = self.storage.create(
            "entity_universe",
            RelationSchema::new().text("entity_id"),
            Some(&["entity_id"]),
        )?;
        let combinations = self.storage.create(
            "base_combinations",
            RelationSchema::new()
                .text("entity_id")
                .text("attribute_value")
                .text("composite_key"),
            Some(&["entity_id", "attribute_value"]),
        )?;

        let entities: BTreeSet<&str> = cleaned.iter().map(|r| r.entity_id.as_str()).collect();
        let universe_rows: Vec<_> = entities.iter().map(|e| vec![Some((*e).to_string())]).collect();
        let combination_rows: Vec<_> = cleaned
            .iter()
            .map(|r| {
                vec![
                    Some(r.entity_id.clone()),
                    r.attribute_value.clone(),
                    Some(composite_key(&r.entity_id, r.attribute_value.as_deref())),
                ]
            })
            .collect();

        self.storage.insert_rows(&universe, &universe_rows)?;
        self.storage.insert_rows(&combinations, &combination_rows)?;

        let population = BasePopulation {
            entity_count: self.storage.count(&universe)?,
            record_count: self.storage.count(&combinations)?,
            universe,
            combinations,
        };
        info!(
            entities = population.entity_count,
            combinations = population.record_count,
            "base population provisioned"
        );
        Ok(population)
    }

    /// Provisions from a select returning `entity_id` and `attribute_value`
    /// (or `entity_id` alone).
    pub fn provision_from_query(&self, select: &str) -> SuppressResult<BasePopulation> {
        let backend = self.storage.backend()?;
        let (columns, rows) = backend
            .query(select)
            .map_err(|e| ValidationError::PopulationQuery { reason: e.to_string() })?;

        let expected = vec!["entity_id".to_string(), "attribute_value".to_string()];
        let entity_idx = columns.iter().position(|c| c.eq_ignore_ascii_case("entity_id"));
        let attr_idx = columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case("attribute_value"));
        let Some(entity_idx) = entity_idx else {
            return Err(ValidationError::PopulationShape {
                expected,
                actual: columns.len(),
            }
            .into());
        };

        let records: Vec<PopulationRecord> = rows
            .into_iter()
            .map(|row| PopulationRecord {
                entity_id: row.get(entity_idx).cloned().flatten().unwrap_or_default(),
                attribute_value: attr_idx.and_then(|i| row.get(i).cloned().flatten()),
            })
            .collect();
        self.provision(&records)
    }
}
