//! Cascade resolution
//!
//! Walks tiers in priority order and answers with the first tier whose
//! composite key is present. That tier's ranking is final: under the default
//! policy nothing from a lower-priority tier is mixed in, even when the
//! matched ranking is shorter than `k`. A record no tier matches gets exactly
//! one candidate, the global default.
//!
//! Resolution only reads the table. It does no I/O, cannot fail, and visits
//! at most `tier_count` tiers with one hash lookup each.

use crate::record::Record;
use crate::table::{CascadeTable, MappingEntry};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// What to do when the matched tier lists fewer than `k` candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillPolicy {
    /// Return the matched tier's ranking as is.
    #[default]
    None,
    /// Fill remaining slots from lower-priority matching tiers, then from the
    /// global ranking, skipping values already listed.
    LowerTiers,
}

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Tier { index: usize, name: String },
    GlobalDefault,
}

impl Origin {
    pub fn is_global_default(&self) -> bool {
        matches!(self, Origin::GlobalDefault)
    }

    pub fn tier_index(&self) -> Option<usize> {
        match self {
            Origin::Tier { index, .. } => Some(*index),
            Origin::GlobalDefault => None,
        }
    }

    /// Stable label used for reporting segments.
    pub fn label(&self) -> String {
        match self {
            Origin::Tier { name, .. } => name.clone(),
            Origin::GlobalDefault => "global_default".to_string(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Tier { index, name } => write!(f, "tier {} ({})", index, name),
            Origin::GlobalDefault => f.write_str("global default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedValue {
    pub value: String,
    pub origin: Origin,
}

/// Non-empty ranked list of at most `k` candidate values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedCandidates {
    candidates: Vec<RankedValue>,
}

/// Resolver output for one record.
pub type PredictionResult = RankedCandidates;

impl RankedCandidates {
    /// Top-1 candidate. Always present.
    pub fn top(&self) -> &RankedValue {
        &self.candidates[0]
    }

    /// Origin of the top candidate: the tier that answered, or the default.
    pub fn origin(&self) -> &Origin {
        &self.top().origin
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(|c| c.value.as_str())
    }

    /// 1-based rank of `value`, if listed.
    pub fn rank_of(&self, value: &str) -> Option<usize> {
        self.candidates
            .iter()
            .position(|c| c.value == value)
            .map(|i| i + 1)
    }

    pub fn as_slice(&self) -> &[RankedValue] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn into_vec(self) -> Vec<RankedValue> {
        self.candidates
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CascadeResolver {
    policy: BackfillPolicy,
}

impl CascadeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: BackfillPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BackfillPolicy {
        self.policy
    }

    /// First matching tier for `record`, with its entry.
    pub fn find_match<'t>(
        &self,
        table: &'t CascadeTable,
        record: &Record,
    ) -> Option<(usize, &'t MappingEntry)> {
        table.tiers().enumerate().find_map(|(index, tier)| {
            let key = tier.spec().key_of(record).canonical();
            tier.get(&key)
                .filter(|entry| !entry.candidates.is_empty())
                .map(|entry| (index, entry))
        })
    }

    /// Top-1 value for `record`.
    pub fn predict<'t>(&self, table: &'t CascadeTable, record: &Record) -> &'t str {
        match self.find_match(table, record) {
            Some((_, entry)) => entry
                .top()
                .map(|c| c.value.as_str())
                .unwrap_or_else(|| table.global_default()),
            None => table.global_default(),
        }
    }

    /// Ranked list of up to `k` candidates. `k = 0` is treated as 1.
    pub fn resolve(&self, table: &CascadeTable, record: &Record, k: usize) -> RankedCandidates {
        let k = k.max(1);
        let mut out: Vec<RankedValue> = Vec::new();
        let mut listed: HashSet<&str> = HashSet::new();

        for (index, tier) in table.tiers().enumerate() {
            let key = tier.spec().key_of(record).canonical();
            let Some(entry) = tier.get(&key).filter(|e| !e.candidates.is_empty()) else {
                continue;
            };

            for candidate in &entry.candidates {
                if out.len() == k {
                    break;
                }
                if listed.insert(candidate.value.as_str()) {
                    out.push(RankedValue {
                        value: candidate.value.clone(),
                        origin: Origin::Tier {
                            index,
                            name: tier.name().to_string(),
                        },
                    });
                }
            }

            if self.policy == BackfillPolicy::None || out.len() == k {
                return RankedCandidates { candidates: out };
            }
        }

        match self.policy {
            BackfillPolicy::None => {
                out.push(RankedValue {
                    value: table.global_default().to_string(),
                    origin: Origin::GlobalDefault,
                });
            }
            BackfillPolicy::LowerTiers => {
                for candidate in table.global_ranking() {
                    if out.len() == k {
                        break;
                    }
                    if listed.insert(candidate.value.as_str()) {
                        out.push(RankedValue {
                            value: candidate.value.clone(),
                            origin: Origin::GlobalDefault,
                        });
                    }
                }
            }
        }

        RankedCandidates { candidates: out }
    }

    /// Resolve many records in parallel; output order matches input order.
    pub fn resolve_batch(
        &self,
        table: &CascadeTable,
        records: &[Record],
        k: usize,
    ) -> Vec<RankedCandidates> {
        records
            .par_iter()
            .map(|record| self.resolve(table, record, k))
            .collect()
    }
}

/// Resolve with the default (no backfill) policy.
pub fn resolve(table: &CascadeTable, record: &Record, k: usize) -> RankedCandidates {
    CascadeResolver::new().resolve(table, record, k)
}
