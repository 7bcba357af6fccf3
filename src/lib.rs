pub mod aggregate;
pub mod builder;
pub mod config;
pub mod definition;
pub mod error;
pub mod evaluator;
pub mod frame;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod table;

pub use aggregate::{aggregate, PerTierCounts, TierCounts, TrainingAggregator, ValueCounts};
pub use builder::{build, rank_candidates, BuildOptions, CascadeBuilder};
pub use config::{CascadeConfig, ResolveOptions, TargetJob};
pub use definition::{CascadeDefinition, TierDefinition, TierSpec};
pub use error::{BuildError, CascadeError, Result};
pub use evaluator::{evaluate, Evaluator, GroupBy, Metrics, SegmentMetrics};
pub use record::{CompositeKey, Record, RecordSchema, NULL_TOKEN};
pub use registry::{RegistryRef, Snapshot, TableRegistry};
pub use resolver::{
    resolve, BackfillPolicy, CascadeResolver, Origin, PredictionResult, RankedCandidates, RankedValue,
};
pub use table::{Candidate, CascadeTable, MappingEntry, TableSummary, Tier, TierSummary};
