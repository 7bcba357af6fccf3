//! Cascade definitions
//!
//! The raw, file-facing definition (`CascadeDefinition`) is deliberately loose
//! (signed support, optional names) so that bad input can be reported as a
//! `MalformedCascadeDefinition` instead of an opaque parse failure. Validation
//! against a record schema yields the strongly-typed `TierSpec` list every
//! other component consumes.

use crate::error::{BuildError, CascadeError, Result};
use crate::record::{CompositeKey, Record, RecordSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One tier as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub minimum_support: i64,
}

/// Ordered tier list, most specific first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeDefinition {
    pub tiers: Vec<TierDefinition>,
}

impl CascadeDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tier with a generated name.
    pub fn tier<S: AsRef<str>>(mut self, key_fields: &[S], minimum_support: i64) -> Self {
        self.tiers.push(TierDefinition {
            name: None,
            key_fields: key_fields.iter().map(|f| f.as_ref().to_string()).collect(),
            minimum_support,
        });
        self
    }

    /// Append a named tier.
    pub fn named_tier<S: AsRef<str>>(
        mut self,
        name: impl Into<String>,
        key_fields: &[S],
        minimum_support: i64,
    ) -> Self {
        self.tiers.push(TierDefinition {
            name: Some(name.into()),
            key_fields: key_fields.iter().map(|f| f.as_ref().to_string()).collect(),
            minimum_support,
        });
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CascadeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Check the definition against a record schema and the target field.
    ///
    /// Rejects: no tiers, unknown key fields, negative support, a field
    /// repeated within one tier, the target used as a key field, and
    /// duplicate tier names.
    pub fn validate(
        &self,
        schema: &RecordSchema,
        target_field: &str,
    ) -> std::result::Result<Vec<TierSpec>, BuildError> {
        if self.tiers.is_empty() {
            return Err(BuildError::MalformedCascadeDefinition(
                "definition has no tiers".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut specs = Vec::with_capacity(self.tiers.len());

        for (priority, tier) in self.tiers.iter().enumerate() {
            let name = tier
                .name
                .clone()
                .unwrap_or_else(|| default_tier_name(priority, &tier.key_fields));

            if tier.minimum_support < 0 {
                return Err(BuildError::MalformedCascadeDefinition(format!(
                    "tier '{}' has negative minimum_support {}",
                    name, tier.minimum_support
                )));
            }

            let mut seen_fields = HashSet::new();
            for field in &tier.key_fields {
                if !schema.contains(field) {
                    return Err(BuildError::MalformedCascadeDefinition(format!(
                        "tier '{}' references unknown field '{}'",
                        name, field
                    )));
                }
                if field == target_field {
                    return Err(BuildError::MalformedCascadeDefinition(format!(
                        "tier '{}' uses the target field '{}' as a key",
                        name, field
                    )));
                }
                if !seen_fields.insert(field.as_str()) {
                    return Err(BuildError::MalformedCascadeDefinition(format!(
                        "tier '{}' lists field '{}' more than once",
                        name, field
                    )));
                }
            }

            if !names.insert(name.clone()) {
                return Err(BuildError::MalformedCascadeDefinition(format!(
                    "duplicate tier name '{}'",
                    name
                )));
            }

            specs.push(TierSpec {
                name,
                key_fields: tier.key_fields.clone(),
                minimum_support: tier.minimum_support as u64,
            });
        }

        Ok(specs)
    }
}

/// `L{priority}_{FIELD+FIELD}`, matching the level naming used in mapping files.
pub fn default_tier_name(priority: usize, key_fields: &[String]) -> String {
    if key_fields.is_empty() {
        format!("L{}_ALL", priority)
    } else {
        format!("L{}_{}", priority, key_fields.join("+"))
    }
}

/// A validated tier specification. Priority is the position in the cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub name: String,
    pub key_fields: Vec<String>,
    pub minimum_support: u64,
}

impl TierSpec {
    pub fn new<S: AsRef<str>>(name: impl Into<String>, key_fields: &[S], minimum_support: u64) -> Self {
        Self {
            name: name.into(),
            key_fields: key_fields.iter().map(|f| f.as_ref().to_string()).collect(),
            minimum_support,
        }
    }

    pub fn arity(&self) -> usize {
        self.key_fields.len()
    }

    pub fn key_of(&self, record: &Record) -> CompositeKey {
        record.key_for(&self.key_fields)
    }
}
