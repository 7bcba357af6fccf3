//! Training aggregation
//!
//! Turns labelled training records into per-tier `key → value → count`
//! tables. Counts over disjoint row partitions combine by plain addition,
//! so the record set is split into chunks, aggregated in parallel and merged.

use crate::definition::TierSpec;
use crate::error::BuildError;
use crate::record::{CompositeKey, Record};
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::debug;

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Observed target values for one key (or for the whole training set).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueCounts {
    total: u64,
    values: HashMap<String, u64>,
}

impl ValueCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, value: &str) {
        self.observe_n(value, 1);
    }

    pub fn observe_n(&mut self, value: &str, n: u64) {
        if n == 0 {
            return;
        }
        self.total += n;
        match self.values.get_mut(value) {
            Some(count) => *count += n,
            None => {
                self.values.insert(value.to_string(), n);
            }
        }
    }

    pub fn merge(&mut self, other: ValueCounts) {
        self.total += other.total;
        for (value, n) in other.values {
            *self.values.entry(value).or_insert(0) += n;
        }
    }

    /// Total supporting rows.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn count(&self, value: &str) -> u64 {
        self.values.get(value).copied().unwrap_or(0)
    }

    pub fn values(&self) -> &HashMap<String, u64> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Per-key value counts for one tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierCounts {
    keys: HashMap<CompositeKey, ValueCounts>,
}

impl TierCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, key: CompositeKey, value: &str) {
        self.keys.entry(key).or_default().observe(value);
    }

    pub fn observe_n(&mut self, key: CompositeKey, value: &str, n: u64) {
        self.keys.entry(key).or_default().observe_n(value, n);
    }

    pub fn merge(&mut self, other: TierCounts) {
        // fold the smaller map into the larger one
        let other = if other.keys.len() > self.keys.len() {
            std::mem::replace(self, other)
        } else {
            other
        };
        for (key, counts) in other.keys {
            self.keys.entry(key).or_default().merge(counts);
        }
    }

    pub fn get(&self, key: &CompositeKey) -> Option<&ValueCounts> {
        self.keys.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CompositeKey, &ValueCounts)> {
        self.keys.iter()
    }

    /// Number of distinct keys observed.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Aggregation output: one `TierCounts` per tier plus the global counts
/// (the degenerate zero-field tier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerTierCounts {
    pub tiers: Vec<TierCounts>,
    pub global: ValueCounts,
    /// Labelled rows that contributed.
    pub rows: u64,
}

impl PerTierCounts {
    pub fn empty(tier_count: usize) -> Self {
        Self {
            tiers: vec![TierCounts::new(); tier_count],
            global: ValueCounts::new(),
            rows: 0,
        }
    }

    /// Combine two partial aggregates over disjoint row sets.
    pub fn merge(mut self, other: PerTierCounts) -> PerTierCounts {
        debug_assert_eq!(self.tiers.len(), other.tiers.len());
        for (mine, theirs) in self.tiers.iter_mut().zip(other.tiers) {
            mine.merge(theirs);
        }
        self.global.merge(other.global);
        self.rows += other.rows;
        self
    }

    /// Count one labelled row under every tier.
    pub fn observe(&mut self, record: &Record, tiers: &[TierSpec], target: &str) {
        for (counts, spec) in self.tiers.iter_mut().zip(tiers) {
            counts.observe(spec.key_of(record), target);
        }
        self.global.observe(target);
        self.rows += 1;
    }
}

/// Computes per-tier frequency tables from a training record set.
#[derive(Debug, Clone)]
pub struct TrainingAggregator {
    chunk_size: usize,
}

impl Default for TrainingAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingAggregator {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Aggregate `records` for every tier.
    ///
    /// Rows with a null target carry no label and are skipped. Fails with
    /// `EmptyTarget` when no row carries a non-null target.
    pub fn aggregate(
        &self,
        records: &[Record],
        tiers: &[TierSpec],
        target_field: &str,
    ) -> std::result::Result<PerTierCounts, BuildError> {
        let counts = records
            .par_chunks(self.chunk_size)
            .map(|chunk| Self::aggregate_partition(chunk, tiers, target_field))
            .reduce(|| PerTierCounts::empty(tiers.len()), PerTierCounts::merge);

        if counts.rows == 0 {
            return Err(BuildError::EmptyTarget {
                target: target_field.to_string(),
            });
        }

        debug!(
            "Aggregated {} labelled rows of {} into {} tiers",
            counts.rows,
            records.len(),
            tiers.len()
        );
        Ok(counts)
    }

    /// Sequential aggregation of one partition. Never fails; an unlabelled
    /// partition simply yields empty counts.
    pub fn aggregate_partition(
        records: &[Record],
        tiers: &[TierSpec],
        target_field: &str,
    ) -> PerTierCounts {
        let mut counts = PerTierCounts::empty(tiers.len());
        for record in records {
            if let Some(target) = record.get(target_field) {
                counts.observe(record, tiers, target);
            }
        }
        counts
    }
}

/// Aggregate with the default chunking.
pub fn aggregate(
    records: &[Record],
    tiers: &[TierSpec],
    target_field: &str,
) -> std::result::Result<PerTierCounts, BuildError> {
    TrainingAggregator::new().aggregate(records, tiers, target_field)
}
