//! Rule model.
//!
//! A rule is a membership predicate over the base population. Its source is
//! parsed once into a [`PredicateTemplate`] of literal text and named slots,
//! so an unknown placeholder is rejected at load time rather than when the
//! predicate runs.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SLOT_RE: OnceLock<Regex> = OnceLock::new();
static RULE_ID_RE: OnceLock<Regex> = OnceLock::new();

fn slot_regex() -> &'static Regex {
    SLOT_RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static slot pattern"))
}

fn rule_id_regex() -> &'static Regex {
    RULE_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static rule id pattern"))
}

/// Unique rule identifier.
///
/// Restricted to ASCII letters, digits and `_` because it is embedded in
/// relation and column names. Ordering is plain string ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Validates and wraps an identifier. Returns `None` if it is malformed.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        rule_id_regex().is_match(raw).then(|| Self(raw.to_string()))
    }

    /// The identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Master relation column holding this rule's flag.
    #[must_use]
    pub fn flag_column(&self) -> String {
        format!("rule_{}_flag", self.0)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Granularity at which a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleLevel {
    /// Matches entity ids; applies to every composite key of the entity.
    Entity,
    /// Matches exact `(entity_id, attribute_value)` pairs.
    EntityAttribute,
}

impl RuleLevel {
    /// Configuration spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::EntityAttribute => "entity_attribute",
        }
    }
}

impl fmt::Display for RuleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entity" => Ok(Self::Entity),
            "entity_attribute" => Ok(Self::EntityAttribute),
            other => Err(other.to_string()),
        }
    }
}

/// Named relation a predicate may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Distinct entity ids of the base population.
    EntityUniverse,
    /// Every composite key of the base population.
    BaseCombinations,
}

impl Slot {
    /// Placeholder name without braces.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EntityUniverse => "entity_universe",
            Self::BaseCombinations => "base_combinations",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "entity_universe" => Some(Self::EntityUniverse),
            "base_combinations" => Some(Self::BaseCombinations),
            _ => None,
        }
    }
}

/// Relation names bound to slots for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotBindings {
    /// Relation bound to `{entity_universe}`.
    pub entity_universe: Option<String>,
    /// Relation bound to `{base_combinations}`.
    pub base_combinations: Option<String>,
}

impl SlotBindings {
    fn get(&self, slot: Slot) -> Option<&str> {
        match slot {
            Slot::EntityUniverse => self.entity_universe.as_deref(),
            Slot::BaseCombinations => self.base_combinations.as_deref(),
        }
    }
}

/// Byte ranges of single-quoted SQL string literals, quotes included.
/// `''` is an escaped quote; an unterminated literal runs to the end.
fn quoted_spans(source: &str) -> Vec<(usize, usize)> {
    let bytes = source.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\'' {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        loop {
            match bytes.get(i) {
                None => break,
                Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => i += 2,
                Some(b'\'') => {
                    i += 1;
                    break;
                }
                Some(_) => i += 1,
            }
        }
        spans.push((start, i));
    }
    spans
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Slot),
}

/// Predicate source split into literal text and named slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PredicateTemplate {
    /// Parses a predicate source.
    ///
    /// Braces inside single-quoted string literals are literal text, not
    /// placeholders.
    ///
    /// # Errors
    /// Returns the first unknown placeholder name.
    pub fn parse(source: &str) -> Result<Self, String> {
        let quoted = quoted_spans(source);
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in slot_regex().captures_iter(source) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if quoted.iter().any(|&(start, end)| (start..end).contains(&whole.start())) {
                continue;
            }
            let slot = Slot::from_name(name.as_str()).ok_or_else(|| name.as_str().to_string())?;
            if whole.start() > last {
                segments.push(Segment::Literal(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Slot(slot));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Literal(source[last..].to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Source text as configured.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct slots referenced, in first-use order.
    #[must_use]
    pub fn slots(&self) -> Vec<Slot> {
        let mut out = Vec::new();
        for seg in &self.segments {
            if let Segment::Slot(slot) = seg {
                if !out.contains(slot) {
                    out.push(*slot);
                }
            }
        }
        out
    }

    /// Substitutes bound relation names.
    ///
    /// # Errors
    /// Returns the first referenced slot with no binding.
    pub fn render(&self, bindings: &SlotBindings) -> Result<String, Slot> {
        let mut out = String::with_capacity(self.source.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(slot) => out.push_str(bindings.get(*slot).ok_or(*slot)?),
            }
        }
        Ok(out)
    }
}

/// A validated suppression rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Unique identifier.
    pub id: RuleId,
    /// Short display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Parsed predicate.
    pub predicate: PredicateTemplate,
    /// Match granularity.
    pub level: RuleLevel,
    /// Whether the rule takes part in evaluation.
    pub enabled: bool,
}

impl Rule {
    /// Returns true for entity-level rules.
    #[must_use]
    pub fn is_entity_level(&self) -> bool {
        self.level == RuleLevel::Entity
    }

    /// Returns true for entity-attribute-level rules.
    #[must_use]
    pub fn is_attribute_level(&self) -> bool {
        self.level == RuleLevel::EntityAttribute
    }
}
