use crate::builder::BuildOptions;
use crate::definition::{CascadeDefinition, TierDefinition};
use crate::error::{CascadeError, Result};
use crate::resolver::{BackfillPolicy, CascadeResolver};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    pub backfill: BackfillPolicy,
}

/// One cascade to build: which field to predict, through which tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetJob {
    /// Output directory name; defaults to the lowercased target field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub target_field: String,
    pub tiers: Vec<TierDefinition>,
    /// Overrides the config-wide build options for this target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildOptions>,
}

impl TargetJob {
    pub fn definition(&self) -> CascadeDefinition {
        CascadeDefinition {
            tiers: self.tiers.clone(),
        }
    }

    pub fn options(&self, defaults: &BuildOptions) -> BuildOptions {
        self.build.clone().unwrap_or_else(|| defaults.clone())
    }

    /// Directory the job's table is written to, relative to the output root.
    pub fn dir_name(&self) -> String {
        let raw = match &self.name {
            Some(name) => name.clone(),
            None => self.target_field.to_lowercase(),
        };
        raw.trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') { c } else { '_' })
            .collect()
    }
}

/// File form: either a single `target_field` + `tiers`, or a `targets` list.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    target_field: Option<String>,
    #[serde(default)]
    tiers: Option<Vec<TierDefinition>>,
    #[serde(default)]
    targets: Vec<TargetJob>,
    #[serde(default)]
    build: BuildOptions,
    #[serde(default)]
    resolve: ResolveOptions,
}

/// A build job over one training file: one or more target cascades sharing
/// the same load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct CascadeConfig {
    pub targets: Vec<TargetJob>,
    pub build: BuildOptions,
    pub resolve: ResolveOptions,
}

impl TryFrom<RawConfig> for CascadeConfig {
    type Error = String;

    fn try_from(raw: RawConfig) -> std::result::Result<Self, String> {
        let mut targets = raw.targets;
        match (raw.target_field, raw.tiers) {
            (Some(target_field), Some(tiers)) => {
                if !targets.is_empty() {
                    return Err("use either target_field/tiers or targets, not both".to_string());
                }
                targets.push(TargetJob {
                    name: None,
                    target_field,
                    tiers,
                    build: None,
                });
            }
            (None, None) => {}
            _ => return Err("target_field and tiers must be given together".to_string()),
        }

        if targets.is_empty() {
            return Err("no target configured".to_string());
        }
        let mut dirs = HashSet::new();
        for job in &targets {
            if job.target_field.trim().is_empty() {
                return Err("target_field must not be empty".to_string());
            }
            let dir = job.dir_name();
            if dir.is_empty() {
                return Err(format!("target '{}' has an empty output name", job.target_field));
            }
            if !dirs.insert(dir.clone()) {
                return Err(format!("two targets write to the same directory '{}'", dir));
            }
        }

        Ok(Self {
            targets,
            build: raw.build,
            resolve: raw.resolve,
        })
    }
}

impl CascadeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CascadeError::Config(format!("invalid cascade config: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn resolver(&self) -> CascadeResolver {
        CascadeResolver::with_policy(self.resolve.backfill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_target_config() {
        let config = CascadeConfig::from_json(
            r#"{
                "target_field": "PLANT",
                "tiers": [
                    {"key_fields": ["SOLDTOPARTY", "SALESDOCUMENTTYPE"], "minimum_support": 3},
                    {"name": "org", "key_fields": ["SALESORGANIZATION"], "minimum_support": 1}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.targets.len(), 1);
        let job = &config.targets[0];
        assert_eq!(job.target_field, "PLANT");
        assert_eq!(job.dir_name(), "plant");
        assert_eq!(job.definition().len(), 2);
        assert_eq!(job.tiers[1].name.as_deref(), Some("org"));
        assert_eq!(job.options(&config.build), BuildOptions::default());
        assert_eq!(config.resolver().policy(), BackfillPolicy::None);
    }

    #[test]
    fn test_multi_target_config() {
        let config = CascadeConfig::from_json(
            r#"{
                "targets": [
                    {"target_field": "CUSTOMERPAYMENTTERMS",
                     "tiers": [{"key_fields": ["SOLDTOPARTY"], "minimum_support": 1}]},
                    {"target_field": "HEADERINCOTERMSCLASSIFICATION", "name": "header_incoterms",
                     "tiers": [{"key_fields": ["SOLDTOPARTY"], "minimum_support": 2}],
                     "build": {"max_candidates": 3}}
                ],
                "build": {"max_candidates": 5, "max_keys_per_tier": 100000, "tier_time_budget_ms": 2000},
                "resolve": {"backfill": "lower_tiers"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].dir_name(), "customerpaymentterms");
        assert_eq!(config.targets[0].options(&config.build).max_candidates, Some(5));
        assert_eq!(config.targets[1].dir_name(), "header_incoterms");
        assert_eq!(config.targets[1].options(&config.build).max_candidates, Some(3));
        assert_eq!(config.build.tier_time_budget_ms, Some(2000));
        assert_eq!(config.resolve.backfill, BackfillPolicy::LowerTiers);
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = CascadeConfig::from_json(
            r#"{"target_field": "PLANT", "tiers": [{"key_fields": ["F"], "minimum_support": 1}]}"#,
        )
        .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(CascadeConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_bad_config() {
        let bad = [
            r#"{"tiers": []}"#,
            r#"{"target_field": " ", "tiers": []}"#,
            r#"{"targets": []}"#,
            r#"{"target_field": "T", "tiers": [], "resolve": {"backfill": "sideways"}}"#,
            r#"{"target_field": "T", "tiers": [], "targets": [{"target_field": "U", "tiers": []}]}"#,
            r#"{"targets": [{"target_field": "T", "tiers": []}, {"target_field": "t", "tiers": []}]}"#,
        ];
        for json in bad {
            assert!(
                matches!(CascadeConfig::from_json(json), Err(CascadeError::Config(_))),
                "accepted {}",
                json
            );
        }
    }
}
