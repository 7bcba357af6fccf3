use anyhow::{bail, Context, Result};
use cascade_engine::config::CascadeConfig;
use cascade_engine::evaluator::{Evaluator, GroupBy};
use cascade_engine::frame::{build_targets, read_frame, records_from_frame};
use cascade_engine::resolver::{BackfillPolicy, CascadeResolver};
use cascade_engine::table::CascadeTable;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_TOP_K: usize = 3;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "Build, query and evaluate cascade lookup tables")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build one cascade table per configured target from a training file
    Build {
        /// Cascade job config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Training data (.csv or .parquet)
        #[arg(short, long)]
        train: PathBuf,
        /// Output root; each target is written to its own subdirectory
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Print ranked candidates for every row of an input file, as JSON lines
    Predict {
        #[arg(long)]
        table: PathBuf,
        #[arg(short, long)]
        input: PathBuf,
        /// Candidates per row (or set CASCADE_TOP_K)
        #[arg(short = 'k', long = "top-k")]
        k: Option<usize>,
        /// Fill short rankings from lower tiers and the global ranking
        #[arg(long)]
        backfill: bool,
    },
    /// Score a table against labelled test rows
    Evaluate {
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        test: PathBuf,
        #[arg(short = 'k', long = "top-k")]
        k: Option<usize>,
        /// field:NAME, origin, or seen:TIER_INDEX (needs --train)
        #[arg(long)]
        group_by: Option<String>,
        #[arg(long)]
        train: Option<PathBuf>,
        #[arg(long)]
        backfill: bool,
    },
    /// Show the tiers of a saved table
    Inspect {
        #[arg(long)]
        table: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Args::parse().command {
        Command::Build { config, train, out } => run_build(&config, &train, &out),
        Command::Predict {
            table,
            input,
            k,
            backfill,
        } => run_predict(&table, &input, top_k(k)?, backfill),
        Command::Evaluate {
            table,
            test,
            k,
            group_by,
            train,
            backfill,
        } => run_evaluate(&table, &test, top_k(k)?, group_by.as_deref(), train.as_deref(), backfill),
        Command::Inspect { table } => {
            let table = load_table(&table)?;
            println!("{}", table.summary());
            Ok(())
        }
    }
}

fn top_k(flag: Option<usize>) -> Result<usize> {
    if let Some(k) = flag {
        return Ok(k);
    }
    match std::env::var("CASCADE_TOP_K") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("CASCADE_TOP_K is not a number: {}", raw)),
        Err(_) => Ok(DEFAULT_TOP_K),
    }
}

fn resolver_for(backfill: bool) -> CascadeResolver {
    if backfill {
        CascadeResolver::with_policy(BackfillPolicy::LowerTiers)
    } else {
        CascadeResolver::new()
    }
}

fn load_table(dir: &Path) -> Result<CascadeTable> {
    CascadeTable::load(dir).with_context(|| format!("Failed to load cascade table from {}", dir.display()))
}

fn run_build(config: &Path, train: &Path, out: &Path) -> Result<()> {
    let config = CascadeConfig::load(config)
        .with_context(|| format!("Failed to load config {}", config.display()))?;

    let df = read_frame(train)?;
    for (dir_name, table) in build_targets(&df, &config)? {
        println!("{}", table.summary());
        let dir = out.join(&dir_name);
        table.save(&dir)?;
        info!("✅ Table for '{}' written to {}", table.target_field(), dir.display());
    }
    Ok(())
}

fn run_predict(table: &Path, input: &Path, k: usize, backfill: bool) -> Result<()> {
    let table = load_table(table)?;
    let records = records_from_frame(&read_frame(input)?)?;
    let results = resolver_for(backfill).resolve_batch(&table, &records, k);

    for (row, ranked) in results.iter().enumerate() {
        let line = serde_json::json!({
            "row": row,
            "origin": ranked.origin().label(),
            "candidates": ranked.values().collect::<Vec<_>>(),
        });
        println!("{}", line);
    }
    info!("Resolved {} rows", results.len());
    Ok(())
}

fn run_evaluate(
    table: &Path,
    test: &Path,
    k: usize,
    group_by: Option<&str>,
    train: Option<&Path>,
    backfill: bool,
) -> Result<()> {
    let table = load_table(table)?;
    let test_records = records_from_frame(&read_frame(test)?)?;

    let group_by = match group_by {
        None => None,
        Some(spec) => Some(parse_group_by(spec, &table, train)?),
    };

    let metrics = Evaluator::new(resolver_for(backfill)).evaluate(&table, &test_records, k, group_by.as_ref());
    info!(
        "📊 acc@1={:.4} mrr@{}={:.4} over {} rows",
        metrics.overall.accuracy_at_1, metrics.k, metrics.overall.mrr_at_k, metrics.overall.records
    );
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn parse_group_by(spec: &str, table: &CascadeTable, train: Option<&Path>) -> Result<GroupBy> {
    if spec == "origin" {
        return Ok(GroupBy::Origin);
    }
    if let Some(field) = spec.strip_prefix("field:") {
        return Ok(GroupBy::Field(field.to_string()));
    }
    if let Some(index) = spec.strip_prefix("seen:") {
        let index: usize = index
            .parse()
            .with_context(|| format!("seen: expects a tier index, got '{}'", index))?;
        let Some(tier) = table.tier(index) else {
            bail!("table has no tier at index {}", index);
        };
        let Some(train) = train else {
            bail!("--group-by seen:N needs --train");
        };
        let training = records_from_frame(&read_frame(train)?)?;
        return Ok(GroupBy::key_seen_for_tier(&training, tier.spec()));
    }
    bail!("unknown --group-by '{}' (expected field:NAME, origin or seen:TIER_INDEX)", spec)
}
