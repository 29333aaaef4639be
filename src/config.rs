//! Engine configuration.
//!
//! A configuration file is JSON:
//!
//! ```json
//! {
//!   "session_label": "monthly",
//!   "entity_id_pattern": "^\\d{10}$",
//!   "retain_match_relations": false,
//!   "rules": {
//!     "r1": {
//!       "name": "Excluded entities",
//!       "description": "Entities on the exclusion list",
//!       "predicate_source": "SELECT entity_id FROM exclusions",
//!       "level": "entity"
//!     }
//!   }
//! }
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::catalog::{RawRuleSet, RuleCatalog};
use crate::engine::EngineOptions;
use crate::error::ConfigurationError;

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Human label attached to the session.
    #[serde(default)]
    pub session_label: Option<String>,
    /// Regex every entity id must match.
    #[serde(default)]
    pub entity_id_pattern: Option<String>,
    /// Keep rule match relations after aggregation.
    #[serde(default)]
    pub retain_match_relations: bool,
    /// Raw rule definitions keyed by rule id.
    pub rules: RawRuleSet,
}

impl EngineConfig {
    /// Parses configuration text.
    ///
    /// # Errors
    /// `Parse` for malformed JSON or a missing `rules` table.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(text).map_err(|e| ConfigurationError::Parse { reason: e.to_string() })
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, otherwise as [`Self::from_json_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Engine options carried by this configuration.
    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            entity_id_pattern: self.entity_id_pattern.clone(),
            retain_match_relations: self.retain_match_relations,
        }
    }

    /// Validates the rule definitions into a catalog.
    ///
    /// # Errors
    /// The first invalid rule definition.
    pub fn catalog(&self) -> Result<RuleCatalog, ConfigurationError> {
        RuleCatalog::load(&self.rules)
    }
}
