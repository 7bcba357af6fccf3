//! Polars adapters for training data
//!
//! Training files are read with every column as a string, since keys are
//! categorical and `007` must not become `7`. A frame can either be turned
//! into records or aggregated directly with a polars `group_by`, which gives
//! the same counts as the in-memory aggregator.

use crate::aggregate::PerTierCounts;
use crate::builder::{BuildOptions, CascadeBuilder};
use crate::config::CascadeConfig;
use crate::definition::{CascadeDefinition, TierSpec};
use crate::error::{BuildError, CascadeError, Result};
use crate::record::{normalize_value, CompositeKey, Record, RecordSchema};
use crate::table::CascadeTable;
use polars::prelude::*;
use std::path::Path;
use tracing::{debug, info};

const TARGET_COLUMN: &str = "__target";
const ONE_COLUMN: &str = "__one";
const COUNT_COLUMN: &str = "__count";

fn key_alias(i: usize) -> String {
    format!("k{}", i)
}

/// Read a CSV or Parquet training file.
pub fn read_frame(path: &Path) -> Result<DataFrame> {
    let df = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => LazyCsvReader::new(path)
            .with_infer_schema_length(Some(0))
            .finish()
            .map_err(|e| CascadeError::Polars(format!("Failed to read CSV {}: {}", path.display(), e)))?
            .collect()?,
        Some("parquet") => LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .map_err(|e| {
                CascadeError::Polars(format!("Failed to scan parquet {}: {}", path.display(), e))
            })?
            .collect()?,
        _ => {
            return Err(CascadeError::Config(format!(
                "unsupported training file (expected .csv or .parquet): {}",
                path.display()
            )))
        }
    };
    info!("Loaded {} rows x {} columns from {}", df.height(), df.width(), path.display());
    Ok(df)
}

pub fn schema_of(df: &DataFrame) -> RecordSchema {
    RecordSchema::from_fields(df.get_column_names())
}

/// Convert every row of `df` into a `Record`. Non-string columns are cast.
pub fn records_from_frame(df: &DataFrame) -> Result<Vec<Record>> {
    let mut records = vec![Record::new(); df.height()];
    for name in df.get_column_names() {
        let series = df.column(name)?.cast(&DataType::String)?;
        let values = series.str()?;
        for (record, value) in records.iter_mut().zip(values.into_iter()) {
            record.set(name, value);
        }
    }
    Ok(records)
}

/// Aggregate `df` for every tier through polars `group_by`.
pub fn aggregate_frame(df: &DataFrame, tiers: &[TierSpec], target_field: &str) -> Result<PerTierCounts> {
    if df.height() == 0 {
        return Err(BuildError::EmptyTrainingSet.into());
    }

    let mut counts = PerTierCounts::empty(tiers.len());
    for (tier_counts, spec) in counts.tiers.iter_mut().zip(tiers) {
        let groups = grouped_counts(df, &spec.key_fields, target_field)?;
        debug!("  {}: {} groups", spec.name, groups.len());
        for (key, target, n) in groups {
            tier_counts.observe_n(CompositeKey::new(key), &target, n);
        }
    }
    for (_, target, n) in grouped_counts(df, &[], target_field)? {
        counts.global.observe_n(&target, n);
        counts.rows += n;
    }

    if counts.rows == 0 {
        return Err(BuildError::EmptyTarget {
            target: target_field.to_string(),
        }
        .into());
    }
    Ok(counts)
}

/// `(key components, target, count)` per group. Values are normalised after
/// grouping, so groups that differ only in whitespace are summed by the caller.
fn grouped_counts(
    df: &DataFrame,
    key_fields: &[String],
    target_field: &str,
) -> Result<Vec<(Vec<Option<String>>, String, u64)>> {
    let mut projection: Vec<Expr> = key_fields
        .iter()
        .enumerate()
        .map(|(i, field)| col(field).cast(DataType::String).alias(&key_alias(i)))
        .collect();
    projection.push(col(target_field).cast(DataType::String).alias(TARGET_COLUMN));

    let mut by: Vec<Expr> = (0..key_fields.len()).map(|i| col(&key_alias(i))).collect();
    by.push(col(TARGET_COLUMN));

    let grouped = df
        .clone()
        .lazy()
        .select(projection)
        .filter(col(TARGET_COLUMN).is_not_null())
        .with_column(lit(1u64).alias(ONE_COLUMN))
        .group_by(by)
        .agg([col(ONE_COLUMN).sum().alias(COUNT_COLUMN)])
        .collect()?;

    let key_columns = (0..key_fields.len())
        .map(|i| grouped.column(&key_alias(i)).cloned())
        .collect::<PolarsResult<Vec<Series>>>()?;
    let keys = key_columns
        .iter()
        .map(|s| s.str())
        .collect::<PolarsResult<Vec<_>>>()?;
    let targets = grouped.column(TARGET_COLUMN)?.str()?;
    let count_series = grouped.column(COUNT_COLUMN)?.cast(&DataType::UInt64)?;
    let group_counts = count_series.u64()?;

    let mut out = Vec::with_capacity(grouped.height());
    for i in 0..grouped.height() {
        let Some(target) = targets.get(i).and_then(normalize_value) else {
            continue;
        };
        let n = group_counts.get(i).unwrap_or(0);
        let key = keys.iter().map(|ca| ca.get(i).and_then(normalize_value)).collect();
        out.push((key, target, n));
    }
    Ok(out)
}

/// Validate, aggregate through polars and build.
pub fn build_from_frame(
    df: &DataFrame,
    definition: &CascadeDefinition,
    target_field: &str,
    options: &BuildOptions,
) -> Result<CascadeTable> {
    if df.height() == 0 {
        return Err(BuildError::EmptyTrainingSet.into());
    }
    let schema = schema_of(df);
    if !schema.contains(target_field) {
        return Err(BuildError::EmptySchema {
            target: target_field.to_string(),
        }
        .into());
    }
    let tiers = definition.validate(&schema, target_field)?;
    let counts = aggregate_frame(df, &tiers, target_field)?;
    Ok(CascadeBuilder::new(options.clone()).build(&counts, &tiers, target_field)?)
}

/// Build every target of `config` from one loaded frame. Returns each
/// table with its output directory name, in config order.
pub fn build_targets(df: &DataFrame, config: &CascadeConfig) -> Result<Vec<(String, CascadeTable)>> {
    let mut built = Vec::with_capacity(config.targets.len());
    for job in &config.targets {
        info!("🔨 Building cascade for '{}' ({} tiers)", job.target_field, job.tiers.len());
        let table = build_from_frame(df, &job.definition(), &job.target_field, &job.options(&config.build))?;
        built.push((job.dir_name(), table));
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use std::io::Write;

    fn training_df() -> DataFrame {
        df! [
            "field1" => [Some("A"), Some("A"), Some("A"), Some("B"), None, Some(" A ")],
            "field2" => [Some("X"), Some("X"), Some("X"), Some("Y"), Some("X"), Some("Y")],
            "target" => [Some("P1"), Some("P1"), Some("P2"), Some("P3"), Some("P1"), None]
        ]
        .unwrap()
    }

    fn tiers() -> Vec<TierSpec> {
        vec![
            TierSpec::new("L0", &["field1", "field2"], 2),
            TierSpec::new("L1", &["field1"], 1),
        ]
    }

    #[test]
    fn test_records_from_frame_normalises() {
        let records = records_from_frame(&training_df()).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].get("field1"), Some("A"));
        assert_eq!(records[4].get("field1"), None);
        assert_eq!(records[5].get("field1"), Some("A"));
        assert_eq!(records[5].get("target"), None);
    }

    #[test]
    fn test_columnar_matches_in_memory_aggregation() {
        let df = training_df();
        let columnar = aggregate_frame(&df, &tiers(), "target").unwrap();
        let records = records_from_frame(&df).unwrap();
        let in_memory = aggregate(&records, &tiers(), "target").unwrap();
        assert_eq!(columnar, in_memory);
        assert_eq!(columnar.rows, 5);
    }

    #[test]
    fn test_numeric_columns_are_cast() {
        let df = df! [
            "store" => [1i64, 1, 2],
            "target" => ["P1", "P1", "P2"]
        ]
        .unwrap();
        let tiers = vec![TierSpec::new("L0", &["store"], 1)];
        let counts = aggregate_frame(&df, &tiers, "target").unwrap();
        let key = CompositeKey::new(vec![Some("1".to_string())]);
        assert_eq!(counts.tiers[0].get(&key).unwrap().count("P1"), 2);
    }

    #[test]
    fn test_build_from_frame() {
        let definition = CascadeDefinition::new()
            .tier(&["field1", "field2"], 2)
            .tier(&["field1"], 1);
        let table = build_from_frame(&training_df(), &definition, "target", &BuildOptions::default()).unwrap();
        let entry = table.tier(0).unwrap().get("A|X").unwrap();
        assert_eq!(entry.support, 3);
        assert_eq!(table.global_default(), "P1");
    }

    #[test]
    fn test_build_from_frame_errors() {
        let definition = CascadeDefinition::new().tier(&["field1"], 1);
        let err = build_from_frame(&training_df(), &definition, "missing", &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, CascadeError::Build(BuildError::EmptySchema { .. })));

        let empty = training_df().head(Some(0));
        let err = build_from_frame(&empty, &definition, "target", &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, CascadeError::Build(BuildError::EmptyTrainingSet)));
    }

    #[test]
    fn test_build_targets_shares_one_frame() {
        let df = df! [
            "SOLDTOPARTY" => ["S1", "S1", "S2"],
            "CUSTOMERPAYMENTTERMS" => ["T30", "T30", "T60"],
            "SALESGROUP" => ["G1", "G2", "G2"]
        ]
        .unwrap();
        let config = CascadeConfig::from_json(
            r#"{"targets": [
                {"target_field": "CUSTOMERPAYMENTTERMS", "tiers": [{"key_fields": ["SOLDTOPARTY"], "minimum_support": 1}]},
                {"target_field": "SALESGROUP", "tiers": [{"key_fields": ["SOLDTOPARTY"], "minimum_support": 1}]}
            ]}"#,
        )
        .unwrap();

        let built = build_targets(&df, &config).unwrap();
        let names: Vec<&str> = built.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["customerpaymentterms", "salesgroup"]);
        assert_eq!(built[0].1.target_field(), "CUSTOMERPAYMENTTERMS");
        assert_eq!(built[0].1.global_default(), "T30");
        assert_eq!(built[1].1.global_default(), "G2");
        assert_eq!(built[1].1.tier(0).unwrap().get("S1").unwrap().candidates.len(), 2);
    }

    #[test]
    fn test_read_csv_keeps_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "store,target").unwrap();
        writeln!(file, "007,P1").unwrap();
        writeln!(file, "008,P2").unwrap();
        drop(file);

        let df = read_frame(&path).unwrap();
        let records = records_from_frame(&df).unwrap();
        assert_eq!(records[0].get("store"), Some("007"));
    }

    #[test]
    fn test_read_rejects_unknown_extension() {
        let err = read_frame(Path::new("train.xlsx")).unwrap_err();
        assert!(matches!(err, CascadeError::Config(_)));
    }
}
