//! Rule catalog.
//!
//! Turns raw rule definitions from configuration into validated [`Rule`]s.
//! Every problem is a [`ConfigurationError`] naming the rule and the field,
//! raised before anything touches the backing store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::error::ConfigurationError;
use crate::rule::{PredicateTemplate, Rule, RuleId, RuleLevel};

/// One rule entry as written in configuration.
///
/// Every field is optional here so that a missing field can be reported
/// with the rule's id instead of as a generic parse error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawRuleDefinition {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Predicate source with `{entity_universe}` / `{base_combinations}` slots.
    /// Braces inside single-quoted literals are kept as written.
    #[serde(default, alias = "sql_query")]
    pub predicate_source: Option<String>,
    /// `"entity"` or `"entity_attribute"`, any case.
    #[serde(default)]
    pub level: Option<String>,
    /// Defaults to true.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl RawRuleDefinition {
    /// Creates an enabled definition with every required field set.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        predicate_source: impl Into<String>,
        level: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            description: Some(description.into()),
            predicate_source: Some(predicate_source.into()),
            level: Some(level.into()),
            enabled: None,
        }
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }
}

/// Ordered rule definitions keyed by rule id.
///
/// Unlike a map, repeated ids survive deserialization so the catalog can
/// reject them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRuleSet {
    entries: Vec<(String, RawRuleDefinition)>,
}

impl RawRuleSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&mut self, rule_id: impl Into<String>, definition: RawRuleDefinition) {
        self.entries.push((rule_id.into(), definition));
    }

    /// Appends an entry, builder style.
    #[must_use]
    pub fn with(mut self, rule_id: impl Into<String>, definition: RawRuleDefinition) -> Self {
        self.push(rule_id, definition);
        self
    }

    /// Entries in declaration order.
    #[must_use]
    pub fn entries(&self) -> &[(String, RawRuleDefinition)] {
        &self.entries
    }

    /// Number of entries, disabled ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, RawRuleDefinition)> for RawRuleSet {
    fn from_iter<I: IntoIterator<Item = (String, RawRuleDefinition)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

struct RawRuleSetVisitor;

impl<'de> Visitor<'de> for RawRuleSetVisitor {
    type Value = RawRuleSet;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of rule id to rule definition")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((id, def)) = map.next_entry::<String, RawRuleDefinition>()? {
            entries.push((id, def));
        }
        Ok(RawRuleSet { entries })
    }
}

impl<'de> Deserialize<'de> for RawRuleSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RawRuleSetVisitor)
    }
}

fn required<'a>(
    rule_id: &str,
    field: &'static str,
    value: Option<&'a String>,
) -> Result<&'a String, ConfigurationError> {
    value.ok_or_else(|| ConfigurationError::MissingField {
        rule_id: rule_id.to_string(),
        field: field.to_string(),
    })
}

fn non_blank(rule_id: &str, field: &'static str, value: &str) -> Result<(), ConfigurationError> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::InvalidField {
            rule_id: rule_id.to_string(),
            field: field.to_string(),
            reason: "must not be blank".to_string(),
        });
    }
    Ok(())
}

fn parse_rule(raw_id: &str, raw: &RawRuleDefinition) -> Result<Rule, ConfigurationError> {
    let id = RuleId::parse(raw_id).ok_or_else(|| ConfigurationError::InvalidRuleId {
        rule_id: raw_id.to_string(),
    })?;

    let name = required(raw_id, "name", raw.name.as_ref())?;
    let description = required(raw_id, "description", raw.description.as_ref())?;
    let source = required(raw_id, "predicate_source", raw.predicate_source.as_ref())?;
    let level = required(raw_id, "level", raw.level.as_ref())?;

    non_blank(raw_id, "name", name)?;
    non_blank(raw_id, "predicate_source", source)?;

    let level = level
        .parse::<RuleLevel>()
        .map_err(|value| ConfigurationError::InvalidLevel {
            rule_id: raw_id.to_string(),
            value,
        })?;

    let predicate =
        PredicateTemplate::parse(source).map_err(|placeholder| ConfigurationError::UnknownPlaceholder {
            rule_id: raw_id.to_string(),
            placeholder,
        })?;

    Ok(Rule {
        id,
        name: name.trim().to_string(),
        description: description.clone(),
        predicate,
        level,
        enabled: raw.enabled.unwrap_or(true),
    })
}

/// Validated, enabled rules keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleCatalog {
    rules: BTreeMap<RuleId, Rule>,
    disabled: Vec<RuleId>,
}

impl RuleCatalog {
    /// Parses and validates every definition.
    ///
    /// Disabled rules are validated too but left out of the catalog.
    ///
    /// Ids are compared without regard to letter case, since the store
    /// folds case in the flag column names built from them.
    ///
    /// # Errors
    /// The first malformed entry, or a repeated rule id.
    pub fn load(raw: &RawRuleSet) -> Result<Self, ConfigurationError> {
        let mut rules = BTreeMap::new();
        let mut disabled = Vec::new();
        let mut seen: HashMap<String, &str> = HashMap::new();

        for (raw_id, definition) in raw.entries() {
            if let Some(existing) = seen.insert(raw_id.to_ascii_lowercase(), raw_id.as_str()) {
                return Err(if existing == raw_id {
                    ConfigurationError::DuplicateRuleId {
                        rule_id: raw_id.clone(),
                    }
                } else {
                    ConfigurationError::RuleIdCaseCollision {
                        rule_id: raw_id.clone(),
                        existing: existing.to_string(),
                    }
                });
            }

            let rule = parse_rule(raw_id, definition)?;
            if rule.enabled {
                debug!(rule_id = %rule.id, name = %rule.name, level = %rule.level, "loaded rule");
                rules.insert(rule.id.clone(), rule);
            } else {
                debug!(rule_id = %rule.id, "skipped disabled rule");
                disabled.push(rule.id);
            }
        }

        info!(enabled = rules.len(), disabled = disabled.len(), "loaded suppression rules");
        Ok(Self { rules, disabled })
    }

    /// Looks up an enabled rule.
    #[must_use]
    pub fn get(&self, id: &RuleId) -> Option<&Rule> {
        self.rules.get(id)
    }

    /// Enabled rules in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Enabled rule ids, ascending.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<&RuleId> {
        self.rules.keys().collect()
    }

    /// Ids of rules that were parsed but disabled.
    #[must_use]
    pub fn disabled(&self) -> &[RuleId] {
        &self.disabled
    }

    /// Number of enabled rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rule is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Stable fingerprint of the enabled rule set.
    ///
    /// Hashes id, level and predicate source of every enabled rule in
    /// ascending id order; declaration order does not matter.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for rule in self.rules.values() {
            for part in [rule.id.as_str(), rule.level.as_str(), rule.predicate.source()] {
                hasher.update(&(part.len() as u64).to_le_bytes());
                hasher.update(part.as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}
