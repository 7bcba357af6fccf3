//! Cascade tables
//!
//! A `CascadeTable` is immutable once built. Tiers are held behind `Arc` so a
//! table with one rebuilt tier shares every other tier with its predecessor.
//!
//! On disk a table is a directory:
//!
//! ```text
//! manifest.json          format version, target field, row count, tier files
//! tiers/00_<name>.json   one document per tier
//! global_default.json    global ranking
//! ```
//!
//! Every document is written with sorted keys, so identical input gives
//! byte-identical files, and a single tier can be rewritten on its own.

use crate::definition::TierSpec;
use crate::error::{CascadeError, Result};
use crate::record::CompositeKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const FORMAT_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";
const GLOBAL_DEFAULT_FILE: &str = "global_default.json";
const TIERS_DIR: &str = "tiers";

/// A candidate value with its observed count. Serialised as `[value, count]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u64)", into = "(String, u64)")]
pub struct Candidate {
    pub value: String,
    pub count: u64,
}

impl Candidate {
    pub fn new(value: impl Into<String>, count: u64) -> Self {
        Self {
            value: value.into(),
            count,
        }
    }
}

impl From<(String, u64)> for Candidate {
    fn from((value, count): (String, u64)) -> Self {
        Self { value, count }
    }
}

impl From<Candidate> for (String, u64) {
    fn from(c: Candidate) -> Self {
        (c.value, c.count)
    }
}

/// Whether `candidates` is in canonical rank order: count descending, then
/// value ascending, with no repeated value.
pub fn is_ranked(candidates: &[Candidate]) -> bool {
    candidates.windows(2).all(|w| {
        w[0].count > w[1].count || (w[0].count == w[1].count && w[0].value < w[1].value)
    })
}

/// Ranked candidates for one composite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Total rows observed for the key, before any truncation of `candidates`.
    pub support: u64,
    pub candidates: Vec<Candidate>,
}

impl MappingEntry {
    pub fn top(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

/// One built tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    spec: TierSpec,
    priority: usize,
    entries: HashMap<String, MappingEntry>,
}

impl Tier {
    /// Assemble a tier. Every key must be a valid canonical key of the tier's
    /// arity, and every entry must be non-empty, ranked and meet the tier's
    /// minimum support.
    pub fn new(priority: usize, spec: TierSpec, entries: HashMap<String, MappingEntry>) -> Result<Self> {
        for (key, entry) in &entries {
            if CompositeKey::parse(key, spec.arity()).is_none() {
                return Err(CascadeError::CorruptTable(format!(
                    "tier '{}': key '{}' is not a valid {}-field key",
                    spec.name,
                    key,
                    spec.arity()
                )));
            }
            validate_entry(&spec.name, key, entry, spec.minimum_support)?;
        }
        Ok(Self {
            spec,
            priority,
            entries,
        })
    }

    pub fn spec(&self) -> &TierSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn key_fields(&self) -> &[String] {
        &self.spec.key_fields
    }

    pub fn minimum_support(&self) -> u64 {
        self.spec.minimum_support
    }

    /// Look up an entry by canonical joined key.
    pub fn get(&self, canonical_key: &str) -> Option<&MappingEntry> {
        self.entries.get(canonical_key)
    }

    pub fn lookup(&self, key: &CompositeKey) -> Option<&MappingEntry> {
        self.entries.get(&key.canonical())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &MappingEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn file_name(&self) -> String {
        let safe: String = self
            .spec
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{:02}_{}.json", self.priority, safe)
    }

    fn to_document(&self) -> TierDocument {
        TierDocument {
            name: self.spec.name.clone(),
            priority: self.priority,
            key_fields: self.spec.key_fields.clone(),
            minimum_support: self.spec.minimum_support,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn from_document(doc: TierDocument, expected_priority: usize) -> Result<Self> {
        if doc.priority != expected_priority {
            return Err(CascadeError::CorruptTable(format!(
                "tier '{}' has priority {} but is listed at position {}",
                doc.name, doc.priority, expected_priority
            )));
        }

        let spec = TierSpec {
            name: doc.name,
            key_fields: doc.key_fields,
            minimum_support: doc.minimum_support,
        };
        Tier::new(doc.priority, spec, doc.entries.into_iter().collect())
    }
}

fn validate_entry(tier: &str, key: &str, entry: &MappingEntry, minimum_support: u64) -> Result<()> {
    if entry.candidates.is_empty() {
        return Err(CascadeError::CorruptTable(format!(
            "tier '{}': key '{}' has no candidates",
            tier, key
        )));
    }
    if entry.support < minimum_support {
        return Err(CascadeError::CorruptTable(format!(
            "tier '{}': key '{}' has support {} below minimum {}",
            tier, key, entry.support, minimum_support
        )));
    }
    let listed: u64 = entry.candidates.iter().map(|c| c.count).sum();
    if listed > entry.support || entry.candidates.iter().any(|c| c.count == 0) {
        return Err(CascadeError::CorruptTable(format!(
            "tier '{}': key '{}' has candidate counts inconsistent with support {}",
            tier, key, entry.support
        )));
    }
    if !is_ranked(&entry.candidates) {
        return Err(CascadeError::CorruptTable(format!(
            "tier '{}': key '{}' candidates are not in rank order",
            tier, key
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    target_field: String,
    training_rows: u64,
    tiers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TierDocument {
    name: String,
    priority: usize,
    key_fields: Vec<String>,
    minimum_support: u64,
    entries: BTreeMap<String, MappingEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GlobalDefaultDocument {
    target_field: String,
    candidates: Vec<Candidate>,
}

/// Per-tier summary line, as printed after a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierSummary {
    pub priority: usize,
    pub name: String,
    pub key_fields: Vec<String>,
    pub minimum_support: u64,
    pub keys: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub target_field: String,
    pub training_rows: u64,
    pub global_default: String,
    pub tiers: Vec<TierSummary>,
    pub total_keys: usize,
}

impl std::fmt::Display for TableSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "  {} ({} training rows)", self.target_field, self.training_rows)?;
        writeln!(f, "{}", "=".repeat(60))?;
        for tier in &self.tiers {
            writeln!(
                f,
                "  {}: {} keys (min_support={})",
                tier.name, tier.keys, tier.minimum_support
            )?;
        }
        writeln!(f, "  mode: '{}'", self.global_default)?;
        write!(f, "  total keys: {}", self.total_keys)
    }
}

/// Immutable, ordered cascade of tiers plus the global default ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeTable {
    target_field: String,
    tiers: Vec<Arc<Tier>>,
    global_default: Vec<Candidate>,
    training_rows: u64,
}

impl CascadeTable {
    /// Assemble a table. `global_default` must be non-empty and ranked.
    pub fn new(
        target_field: impl Into<String>,
        tiers: Vec<Tier>,
        global_default: Vec<Candidate>,
        training_rows: u64,
    ) -> Result<Self> {
        if global_default.is_empty() || !is_ranked(&global_default) {
            return Err(CascadeError::CorruptTable(
                "global default ranking must be non-empty and ranked".to_string(),
            ));
        }
        for (i, tier) in tiers.iter().enumerate() {
            if tier.priority != i {
                return Err(CascadeError::CorruptTable(format!(
                    "tier '{}' has priority {} at position {}",
                    tier.name(),
                    tier.priority,
                    i
                )));
            }
        }
        Ok(Self {
            target_field: target_field.into(),
            tiers: tiers.into_iter().map(Arc::new).collect(),
            global_default,
            training_rows,
        })
    }

    pub fn target_field(&self) -> &str {
        &self.target_field
    }

    pub fn tiers(&self) -> impl ExactSizeIterator<Item = &Tier> {
        self.tiers.iter().map(|t| t.as_ref())
    }

    pub fn tier(&self, priority: usize) -> Option<&Tier> {
        self.tiers.get(priority).map(|t| t.as_ref())
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// The globally most frequent target value.
    pub fn global_default(&self) -> &str {
        // non-empty by construction
        &self.global_default[0].value
    }

    pub fn global_ranking(&self) -> &[Candidate] {
        &self.global_default
    }

    pub fn training_rows(&self) -> u64 {
        self.training_rows
    }

    /// A new table with the tier at `tier.priority()` replaced; all other
    /// tiers are shared with `self`.
    pub fn with_tier(&self, tier: Tier) -> Result<CascadeTable> {
        let priority = tier.priority;
        let current = self.tiers.get(priority).ok_or_else(|| {
            CascadeError::Config(format!("no tier at priority {}", priority))
        })?;
        if current.name() != tier.name() {
            return Err(CascadeError::Config(format!(
                "tier at priority {} is '{}', not '{}'",
                priority,
                current.name(),
                tier.name()
            )));
        }
        let mut next = self.clone();
        next.tiers[priority] = Arc::new(tier);
        Ok(next)
    }

    pub fn summary(&self) -> TableSummary {
        let tiers: Vec<TierSummary> = self
            .tiers()
            .map(|t| TierSummary {
                priority: t.priority,
                name: t.name().to_string(),
                key_fields: t.key_fields().to_vec(),
                minimum_support: t.minimum_support(),
                keys: t.len(),
            })
            .collect();
        TableSummary {
            target_field: self.target_field.clone(),
            training_rows: self.training_rows,
            global_default: self.global_default().to_string(),
            total_keys: tiers.iter().map(|t| t.keys).sum(),
            tiers,
        }
    }

    /// Serialised documents as `(relative path, contents)`, in write order.
    pub fn to_documents(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut docs = Vec::with_capacity(self.tiers.len() + 2);
        for tier in self.tiers() {
            docs.push((
                Path::new(TIERS_DIR).join(tier.file_name()),
                to_json(&tier.to_document())?,
            ));
        }
        docs.push((
            PathBuf::from(GLOBAL_DEFAULT_FILE),
            to_json(&GlobalDefaultDocument {
                target_field: self.target_field.clone(),
                candidates: self.global_default.clone(),
            })?,
        ));
        docs.push((PathBuf::from(MANIFEST_FILE), to_json(&self.manifest())?));
        Ok(docs)
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            format_version: FORMAT_VERSION,
            target_field: self.target_field.clone(),
            training_rows: self.training_rows,
            tiers: self.tiers().map(|t| t.file_name()).collect(),
        }
    }

    /// Write the whole table under `dir`. The manifest is written last.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir.join(TIERS_DIR))?;
        for (rel, contents) in self.to_documents()? {
            write_document(&dir.join(rel), &contents)?;
        }
        info!(
            "Saved cascade table for {} ({} tiers) to {}",
            self.target_field,
            self.tiers.len(),
            dir.display()
        );
        Ok(())
    }

    /// Rewrite only one tier's document.
    pub fn save_tier(&self, dir: &Path, priority: usize) -> Result<()> {
        let tier = self.tier(priority).ok_or_else(|| {
            CascadeError::Config(format!("no tier at priority {}", priority))
        })?;
        fs::create_dir_all(dir.join(TIERS_DIR))?;
        let path = dir.join(TIERS_DIR).join(tier.file_name());
        write_document(&path, &to_json(&tier.to_document())?)?;
        debug!("Rewrote tier '{}' at {}", tier.name(), path.display());
        Ok(())
    }

    /// Load and fully validate a table directory. Any malformed or truncated
    /// document fails the whole load.
    pub fn load(dir: &Path) -> Result<CascadeTable> {
        let manifest: Manifest = read_document(&dir.join(MANIFEST_FILE))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(CascadeError::CorruptTable(format!(
                "unsupported format version {} (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }

        let mut tiers = Vec::with_capacity(manifest.tiers.len());
        for (priority, file) in manifest.tiers.iter().enumerate() {
            if !is_plain_file_name(file) {
                return Err(CascadeError::CorruptTable(format!(
                    "manifest lists tier file '{}' outside {}/",
                    file, TIERS_DIR
                )));
            }
            let doc: TierDocument = read_document(&dir.join(TIERS_DIR).join(file))?;
            let tier = Tier::from_document(doc, priority)?;
            if &tier.file_name() != file {
                return Err(CascadeError::CorruptTable(format!(
                    "tier file '{}' holds tier '{}'",
                    file,
                    tier.name()
                )));
            }
            tiers.push(tier);
        }

        let global: GlobalDefaultDocument = read_document(&dir.join(GLOBAL_DEFAULT_FILE))?;
        if global.target_field != manifest.target_field {
            return Err(CascadeError::CorruptTable(format!(
                "global default is for '{}' but manifest targets '{}'",
                global.target_field, manifest.target_field
            )));
        }

        let table = CascadeTable::new(
            manifest.target_field,
            tiers,
            global.candidates,
            manifest.training_rows,
        )?;
        info!(
            "Loaded cascade table for {} ({} tiers, {} keys) from {}",
            table.target_field,
            table.tiers.len(),
            table.tiers().map(|t| t.len()).sum::<usize>(),
            dir.display()
        );
        Ok(table)
    }
}

/// A bare file name: no separators, no `.`/`..`.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| c == '/' || c == '\\')
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    Ok(json)
}

/// Write to a sibling temp file, then rename over the target.
fn write_document(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(contents.as_bytes())?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| {
        CascadeError::CorruptTable(format!("cannot open {}: {}", path.display(), e))
    })?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| CascadeError::CorruptTable(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> CascadeTable {
        let mut entries = HashMap::new();
        entries.insert(
            "A|X".to_string(),
            MappingEntry {
                support: 3,
                candidates: vec![Candidate::new("P1", 2), Candidate::new("P2", 1)],
            },
        );
        let tier0 = Tier::new(0, TierSpec::new("L0", &["field1", "field2"], 2), entries).unwrap();
        let tier1 = Tier::new(1, TierSpec::new("L1", &["field1"], 1), HashMap::new()).unwrap();
        CascadeTable::new(
            "target",
            vec![tier0, tier1],
            vec![Candidate::new("P1", 2), Candidate::new("P2", 1)],
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_is_ranked() {
        assert!(is_ranked(&[Candidate::new("P1", 2), Candidate::new("P2", 2)]));
        assert!(!is_ranked(&[Candidate::new("P2", 2), Candidate::new("P1", 2)]));
        assert!(!is_ranked(&[Candidate::new("P1", 1), Candidate::new("P2", 2)]));
        assert!(!is_ranked(&[Candidate::new("P1", 1), Candidate::new("P1", 1)]));
    }

    #[test]
    fn test_candidate_serialises_as_pair() {
        let json = serde_json::to_string(&Candidate::new("P1", 2)).unwrap();
        assert_eq!(json, r#"["P1",2]"#);
    }

    #[test]
    fn test_rejects_empty_global_default() {
        assert!(CascadeTable::new("target", vec![], vec![], 0).is_err());
    }

    #[test]
    fn test_with_tier_shares_other_tiers() {
        let table = sample_table();
        let replacement = Tier::new(1, TierSpec::new("L1", &["field1"], 1), {
            let mut e = HashMap::new();
            e.insert(
                "B".to_string(),
                MappingEntry {
                    support: 1,
                    candidates: vec![Candidate::new("P3", 1)],
                },
            );
            e
        })
        .unwrap();
        let next = table.with_tier(replacement).unwrap();
        assert!(Arc::ptr_eq(&table.tiers[0], &next.tiers[0]));
        assert_eq!(next.tier(1).unwrap().len(), 1);
        assert!(table.tier(1).unwrap().is_empty());

        let wrong = Tier::new(1, TierSpec::new("other", &["field1"], 1), HashMap::new()).unwrap();
        assert!(table.with_tier(wrong).is_err());
    }

    fn tier_with(entry: MappingEntry) -> Result<Tier> {
        let mut entries = HashMap::new();
        entries.insert("A".to_string(), entry);
        Tier::new(0, TierSpec::new("L0", &["field1"], 5), entries)
    }

    #[test]
    fn test_tier_rejects_invalid_entries() {
        let empty = MappingEntry {
            support: 0,
            candidates: vec![],
        };
        assert!(matches!(tier_with(empty), Err(CascadeError::CorruptTable(_))));

        let below_support = MappingEntry {
            support: 2,
            candidates: vec![Candidate::new("P1", 2)],
        };
        assert!(tier_with(below_support).is_err());

        let misordered = MappingEntry {
            support: 9,
            candidates: vec![Candidate::new("P2", 1), Candidate::new("P1", 8)],
        };
        assert!(tier_with(misordered).is_err());

        let valid = MappingEntry {
            support: 9,
            candidates: vec![Candidate::new("P1", 8), Candidate::new("P2", 1)],
        };
        assert!(tier_with(valid).is_ok());

        let mut wrong_arity = HashMap::new();
        wrong_arity.insert(
            "A|X".to_string(),
            MappingEntry {
                support: 1,
                candidates: vec![Candidate::new("P1", 1)],
            },
        );
        assert!(Tier::new(0, TierSpec::new("L0", &["field1"], 0), wrong_arity).is_err());
    }

    #[test]
    fn test_manifest_tier_names_stay_inside_the_table() {
        assert!(is_plain_file_name("00_L0_field1.json"));
        assert!(!is_plain_file_name("../x.json"));
        assert!(!is_plain_file_name("sub/00_L0.json"));
        assert!(!is_plain_file_name("..\\x.json"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));

        let dir = tempfile::tempdir().unwrap();
        let table_dir = dir.path().join("table");
        sample_table().save(&table_dir).unwrap();
        fs::write(dir.path().join("x.json"), "{}").unwrap();

        let manifest_path = table_dir.join(MANIFEST_FILE);
        let mut manifest: Manifest =
            serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
        manifest.tiers[0] = "../../x.json".to_string();
        fs::write(&manifest_path, serde_json::to_string(&manifest).unwrap()).unwrap();

        let err = CascadeTable::load(&table_dir).unwrap_err();
        assert!(matches!(err, CascadeError::CorruptTable(msg) if msg.contains("../../x.json")));
    }

    #[test]
    fn test_summary_counts_keys() {
        let summary = sample_table().summary();
        assert_eq!(summary.total_keys, 1);
        assert_eq!(summary.global_default, "P1");
        assert!(summary.to_string().contains("L0: 1 keys (min_support=2)"));
    }
}
