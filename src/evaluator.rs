//! Offline evaluation against held-out records
//!
//! Metrics are accumulated as integer hit-at-rank counts and only turned into
//! floats at the end, so parallel evaluation gives identical numbers on every
//! run regardless of how rayon splits the work.

use crate::definition::TierSpec;
use crate::record::{CompositeKey, Record, NULL_TOKEN};
use crate::resolver::{CascadeResolver, Origin, RankedCandidates};
use crate::table::CascadeTable;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Partitioning applied on top of the aggregate metrics.
#[derive(Debug, Clone)]
pub enum GroupBy {
    /// `seen` / `unseen`: whether the record's key over `fields` occurred in training.
    KeySeen {
        fields: Vec<String>,
        seen: HashSet<CompositeKey>,
    },
    /// Partition by the value of a field (null → `\N`).
    Field(String),
    /// Partition by the tier (or default) that answered.
    Origin,
}

impl GroupBy {
    /// Collect the training keys over `fields` for a seen/unseen split.
    pub fn key_seen(training: &[Record], fields: &[String]) -> Self {
        let seen = training.iter().map(|r| r.key_for(fields)).collect();
        GroupBy::KeySeen {
            fields: fields.to_vec(),
            seen,
        }
    }

    /// Seen/unseen split over a tier's key fields.
    pub fn key_seen_for_tier(training: &[Record], tier: &TierSpec) -> Self {
        Self::key_seen(training, &tier.key_fields)
    }

    fn segment_of(&self, record: &Record, origin: &Origin) -> String {
        match self {
            GroupBy::KeySeen { fields, seen } => {
                if seen.contains(&record.key_for(fields)) {
                    "seen".to_string()
                } else {
                    "unseen".to_string()
                }
            }
            GroupBy::Field(field) => record.get(field).unwrap_or(NULL_TOKEN).to_string(),
            GroupBy::Origin => origin.label(),
        }
    }
}

/// Metrics for one slice of the test set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentMetrics {
    pub records: u64,
    pub hits_at_1: u64,
    pub hits_within_k: u64,
    pub accuracy_at_1: f64,
    pub mrr_at_k: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub k: usize,
    pub overall: SegmentMetrics,
    /// Present only when a `GroupBy` was supplied.
    pub segments: BTreeMap<String, SegmentMetrics>,
    /// Rows answered by each tier (or by the global default).
    pub by_origin: BTreeMap<String, SegmentMetrics>,
}

/// Hits per rank, grown only as far as the deepest rank actually hit.
#[derive(Debug, Clone, Default)]
struct Tally {
    records: u64,
    hits_at_rank: Vec<u64>,
}

impl Tally {
    fn observe(&mut self, rank: Option<usize>) {
        self.records += 1;
        if let Some(rank) = rank.filter(|&r| r >= 1) {
            if self.hits_at_rank.len() < rank {
                self.hits_at_rank.resize(rank, 0);
            }
            self.hits_at_rank[rank - 1] += 1;
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.records += other.records;
        if self.hits_at_rank.len() < other.hits_at_rank.len() {
            self.hits_at_rank.resize(other.hits_at_rank.len(), 0);
        }
        for (mine, theirs) in self.hits_at_rank.iter_mut().zip(&other.hits_at_rank) {
            *mine += theirs;
        }
    }

    fn finish(&self) -> SegmentMetrics {
        let hits_at_1 = self.hits_at_rank.first().copied().unwrap_or(0);
        let hits_within_k = self.hits_at_rank.iter().sum();
        if self.records == 0 {
            return SegmentMetrics::default();
        }
        let n = self.records as f64;
        let reciprocal: f64 = self
            .hits_at_rank
            .iter()
            .enumerate()
            .map(|(i, &hits)| hits as f64 / (i + 1) as f64)
            .sum();
        SegmentMetrics {
            records: self.records,
            hits_at_1,
            hits_within_k,
            accuracy_at_1: hits_at_1 as f64 / n,
            mrr_at_k: reciprocal / n,
        }
    }
}

#[derive(Debug, Clone)]
struct EvalTally {
    k: usize,
    overall: Tally,
    segments: BTreeMap<String, Tally>,
    by_origin: BTreeMap<String, Tally>,
}

impl EvalTally {
    fn new(k: usize) -> Self {
        Self {
            k,
            overall: Tally::default(),
            segments: BTreeMap::new(),
            by_origin: BTreeMap::new(),
        }
    }

    fn observe(&mut self, rank: Option<usize>, origin: String, segment: Option<String>) {
        self.overall.observe(rank);
        self.by_origin
            .entry(origin)
            .or_default()
            .observe(rank);
        if let Some(segment) = segment {
            self.segments
                .entry(segment)
                .or_default()
                .observe(rank);
        }
    }

    fn merge(mut self, other: EvalTally) -> EvalTally {
        self.overall.merge(&other.overall);
        for (name, tally) in &other.segments {
            self.segments
                .entry(name.clone())
                .or_default()
                .merge(tally);
        }
        for (name, tally) in &other.by_origin {
            self.by_origin
                .entry(name.clone())
                .or_default()
                .merge(tally);
        }
        self
    }

    fn finish(self) -> Metrics {
        Metrics {
            k: self.k,
            overall: self.overall.finish(),
            segments: self.segments.iter().map(|(n, t)| (n.clone(), t.finish())).collect(),
            by_origin: self.by_origin.iter().map(|(n, t)| (n.clone(), t.finish())).collect(),
        }
    }
}

/// Scores a table against records with known target values.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    resolver: CascadeResolver,
}

impl Evaluator {
    pub fn new(resolver: CascadeResolver) -> Self {
        Self { resolver }
    }

    /// accuracy@1 and MRR@k over `test`, optionally segmented by `group_by`.
    ///
    /// A record whose truth is null counts as a miss. An empty test set gives
    /// all-zero metrics.
    pub fn evaluate(
        &self,
        table: &CascadeTable,
        test: &[Record],
        k: usize,
        group_by: Option<&GroupBy>,
    ) -> Metrics {
        let k = k.max(1);
        let target = table.target_field();

        test.par_iter()
            .fold(
                || EvalTally::new(k),
                |mut tally, record| {
                    let ranked = self.resolver.resolve(table, record, k);
                    let rank = rank_of_truth(&ranked, record.get(target));
                    let origin = ranked.origin();
                    let segment = group_by.map(|g| g.segment_of(record, origin));
                    tally.observe(rank, origin.label(), segment);
                    tally
                },
            )
            .reduce(|| EvalTally::new(k), EvalTally::merge)
            .finish()
    }
}

fn rank_of_truth(ranked: &RankedCandidates, truth: Option<&str>) -> Option<usize> {
    truth.and_then(|t| ranked.rank_of(t))
}

/// Evaluate with the default resolver.
pub fn evaluate(
    table: &CascadeTable,
    test: &[Record],
    k: usize,
    group_by: Option<&GroupBy>,
) -> Metrics {
    Evaluator::default().evaluate(table, test, k, group_by)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::definition::CascadeDefinition;

    fn row(f1: &str, f2: &str, target: &str) -> Record {
        Record::new()
            .with("field1", f1)
            .with("field2", f2)
            .with("target", target)
    }

    fn training() -> Vec<Record> {
        vec![
            row("A", "X", "P1"),
            row("A", "X", "P1"),
            row("A", "X", "P2"),
            row("B", "Y", "P3"),
        ]
    }

    fn table() -> CascadeTable {
        let definition = CascadeDefinition::new()
            .tier(&["field1", "field2"], 2)
            .tier(&["field1"], 1);
        build(&training(), &definition, "target").unwrap()
    }

    #[test]
    fn test_accuracy_and_mrr() {
        let t = table();
        let test = vec![
            row("A", "X", "P1"), // rank 1
            row("A", "X", "P2"), // rank 2
            row("B", "Z", "P9"), // miss
            row("C", "Q", "P1"), // global default hit
        ];
        let metrics = evaluate(&t, &test, 3, None);
        assert_eq!(metrics.overall.records, 4);
        assert_eq!(metrics.overall.hits_at_1, 2);
        assert_eq!(metrics.overall.hits_within_k, 3);
        assert!((metrics.overall.accuracy_at_1 - 0.5).abs() < 1e-12);
        assert!((metrics.overall.mrr_at_k - (1.0 + 0.5 + 0.0 + 1.0) / 4.0).abs() < 1e-12);
        assert!(metrics.segments.is_empty());
    }

    #[test]
    fn test_mrr_at_1_ignores_lower_ranks() {
        let t = table();
        let test = vec![row("A", "X", "P2")];
        let metrics = evaluate(&t, &test, 1, None);
        assert_eq!(metrics.overall.mrr_at_k, 0.0);
    }

    #[test]
    fn test_huge_k_evaluates() {
        let t = table();
        let test = vec![row("A", "X", "P2"), row("C", "Q", "P1")];
        let metrics = evaluate(&t, &test, usize::MAX, Some(&GroupBy::Origin));
        assert_eq!(metrics.k, usize::MAX);
        assert_eq!(metrics.overall.hits_within_k, 2);
        assert!((metrics.overall.mrr_at_k - (0.5 + 1.0) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_null_truth_is_a_miss() {
        let t = table();
        let test = vec![Record::new().with("field1", "A").with("field2", "X")];
        let metrics = evaluate(&t, &test, 3, None);
        assert_eq!(metrics.overall.records, 1);
        assert_eq!(metrics.overall.hits_within_k, 0);
    }

    #[test]
    fn test_empty_test_set_is_zero() {
        let metrics = evaluate(&table(), &[], 3, None);
        assert_eq!(metrics.overall, SegmentMetrics::default());
    }

    #[test]
    fn test_seen_unseen_segments() {
        let t = table();
        let group = GroupBy::key_seen(&training(), &["field1".to_string()]);
        let test = vec![row("A", "X", "P1"), row("B", "Z", "P3"), row("C", "Q", "P2")];
        let metrics = evaluate(&t, &test, 1, Some(&group));

        let seen = &metrics.segments["seen"];
        let unseen = &metrics.segments["unseen"];
        assert_eq!(seen.records, 2);
        assert_eq!(seen.accuracy_at_1, 1.0);
        assert_eq!(unseen.records, 1);
        assert_eq!(unseen.accuracy_at_1, 0.0);
    }

    #[test]
    fn test_origin_breakdown() {
        let t = table();
        let test = vec![row("A", "X", "P1"), row("B", "Z", "P3"), row("C", "Q", "P1")];
        let metrics = evaluate(&t, &test, 1, Some(&GroupBy::Origin));
        assert_eq!(metrics.by_origin["L0_field1+field2"].records, 1);
        assert_eq!(metrics.by_origin["L1_field1"].records, 1);
        assert_eq!(metrics.by_origin["global_default"].records, 1);
        assert_eq!(metrics.segments, metrics.by_origin);
    }

    #[test]
    fn test_field_segments_use_null_token() {
        let t = table();
        let test = vec![
            row("A", "X", "P1"),
            Record::new().with("field2", "X").with("target", "P1"),
        ];
        let metrics = evaluate(&t, &test, 1, Some(&GroupBy::Field("field1".to_string())));
        assert_eq!(metrics.segments["A"].records, 1);
        assert_eq!(metrics.segments[NULL_TOKEN].records, 1);
    }
}
