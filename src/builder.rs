//! Cascade building
//!
//! Per tier, independently: drop keys below the tier's minimum support, rank
//! each key's values by count (descending) with ties broken by ascending value,
//! and optionally truncate the ranking. The global default is the same ranking
//! over all labelled rows with no support filter.

use crate::aggregate::{PerTierCounts, TierCounts, TrainingAggregator};
use crate::definition::{CascadeDefinition, TierSpec};
use crate::error::BuildError;
use crate::record::{Record, RecordSchema};
use crate::table::{Candidate, CascadeTable, MappingEntry, Tier};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often (in keys) the tier time budget is checked.
const BUDGET_CHECK_INTERVAL: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Keep at most this many candidates per key. Does not change top-1.
    pub max_candidates: Option<usize>,
    /// Fail a tier whose observed key space is larger than this.
    pub max_keys_per_tier: Option<usize>,
    /// Fail a tier whose construction takes longer than this.
    pub tier_time_budget_ms: Option<u64>,
}

/// Rank observed values: count descending, then value ascending.
pub fn rank_candidates(values: &HashMap<String, u64>) -> Vec<Candidate> {
    values
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(value, &count)| Candidate::new(value.clone(), count))
        .sorted_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct CascadeBuilder {
    options: BuildOptions,
}

impl CascadeBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Validate, aggregate and build in one step.
    pub fn build_from_records(
        &self,
        records: &[Record],
        definition: &CascadeDefinition,
        target_field: &str,
    ) -> Result<CascadeTable, BuildError> {
        if records.is_empty() {
            return Err(BuildError::EmptyTrainingSet);
        }
        let schema = RecordSchema::from_records(records);
        if !schema.contains(target_field) {
            return Err(BuildError::EmptySchema {
                target: target_field.to_string(),
            });
        }
        let tiers = definition.validate(&schema, target_field)?;
        let counts = TrainingAggregator::new().aggregate(records, &tiers, target_field)?;
        self.build(&counts, &tiers, target_field)
    }

    /// Turn aggregated counts into a table.
    pub fn build(
        &self,
        counts: &PerTierCounts,
        tiers: &[TierSpec],
        target_field: &str,
    ) -> Result<CascadeTable, BuildError> {
        if counts.tiers.len() != tiers.len() {
            return Err(BuildError::MalformedCascadeDefinition(format!(
                "{} tiers configured but {} aggregated",
                tiers.len(),
                counts.tiers.len()
            )));
        }

        let global_default = self.truncate(rank_candidates(counts.global.values()));
        if global_default.is_empty() {
            return Err(BuildError::EmptyTarget {
                target: target_field.to_string(),
            });
        }

        let mut built = Vec::with_capacity(tiers.len());
        for (priority, (spec, tier_counts)) in tiers.iter().zip(&counts.tiers).enumerate() {
            built.push(self.build_tier(priority, spec, tier_counts)?);
        }

        let table = CascadeTable::new(target_field, built, global_default, counts.rows)
            .map_err(|e| BuildError::MalformedCascadeDefinition(e.to_string()))?;

        info!(
            "Built cascade for {}: {} tiers, {} keys, mode '{}'",
            target_field,
            table.tier_count(),
            table.tiers().map(|t| t.len()).sum::<usize>(),
            table.global_default()
        );
        Ok(table)
    }

    /// Build a single tier. A budget failure here affects only this tier.
    pub fn build_tier(
        &self,
        priority: usize,
        spec: &TierSpec,
        counts: &TierCounts,
    ) -> Result<Tier, BuildError> {
        if let Some(max_keys) = self.options.max_keys_per_tier {
            if counts.len() > max_keys {
                warn!("Tier '{}' has {} keys, budget is {}", spec.name, counts.len(), max_keys);
                return Err(BuildError::TierBudgetExceeded {
                    tier: spec.name.clone(),
                    reason: format!("{} distinct keys exceeds limit of {}", counts.len(), max_keys),
                });
            }
        }

        let deadline = self
            .options
            .tier_time_budget_ms
            .map(|ms| (Instant::now(), Duration::from_millis(ms)));

        let mut entries = HashMap::new();
        let mut dropped = 0usize;

        for (i, (key, value_counts)) in counts.iter().enumerate() {
            if let Some((started, budget)) = deadline {
                if i % BUDGET_CHECK_INTERVAL == 0 && started.elapsed() > budget {
                    return Err(BuildError::TierBudgetExceeded {
                        tier: spec.name.clone(),
                        reason: format!("exceeded {} ms after {} keys", budget.as_millis(), i),
                    });
                }
            }

            if value_counts.total() < spec.minimum_support {
                dropped += 1;
                continue;
            }
            let candidates = self.truncate(rank_candidates(value_counts.values()));
            if candidates.is_empty() {
                dropped += 1;
                continue;
            }
            entries.insert(
                key.canonical(),
                MappingEntry {
                    support: value_counts.total(),
                    candidates,
                },
            );
        }

        debug!(
            "  {}: {} keys retained, {} below min_support={}",
            spec.name,
            entries.len(),
            dropped,
            spec.minimum_support
        );
        if entries.is_empty() {
            warn!("Tier '{}' retained no keys", spec.name);
        }

        Tier::new(priority, spec.clone(), entries)
            .map_err(|e| BuildError::MalformedCascadeDefinition(e.to_string()))
    }

    fn truncate(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        if let Some(width) = self.options.max_candidates {
            candidates.truncate(width.max(1));
        }
        candidates
    }
}

/// Build a table from records with default options.
pub fn build(
    records: &[Record],
    definition: &CascadeDefinition,
    target_field: &str,
) -> Result<CascadeTable, BuildError> {
    CascadeBuilder::default().build_from_records(records, definition, target_field)
}
